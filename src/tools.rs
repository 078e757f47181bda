//! The tool registry.
//!
//! A tool is an opaque identity: a stable name, the set of extensions it
//! handles, a probe for whether it is usable on this machine, and a recipe
//! the worker uses to produce a report. The registry is a static table; the
//! set of tools applicable to a path is decided once, when the file's row is
//! created.

use crate::{error::Result, status::Status, utils::RelPath};
use once_cell::sync::{Lazy, OnceCell};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeSet, HashMap},
    fmt, fs,
    path::Path,
    time::Duration,
};

/// Default hard bound for one tool invocation.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable overriding the timeout, in seconds. Read by the
/// worker process.
pub const TIMEOUT_ENV: &str = "SCRUTINY_TOOL_TIMEOUT";

/// Environment variable selecting the syntax highlighting theme.
pub const THEME_ENV: &str = "SCRUTINY_THEME";

/// How a worker produces the report for a tool.
pub enum ToolKind {
    /// Implemented inside the worker binary.
    Builtin(fn(&Path) -> Result<(Status, Vec<String>)>),
    /// An external command; the file path is appended as the last argument.
    Command {
        argv: &'static [&'static str],
        /// Status for a zero exit code.
        success: Status,
        /// Status for a non-zero exit code.
        error: Status,
        /// Whether the command emits ANSI colors that should be preserved.
        has_color: bool,
        /// Optional post-processing of `(exit code, output)` for tools
        /// whose status is not a plain zero/non-zero mapping.
        refine: Option<fn(Option<i32>, &str) -> Status>,
    },
}

impl fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Builtin(_) => f.write_str("Builtin"),
            ToolKind::Command { argv, .. } => write!(f, "Command({argv:?})"),
        }
    }
}

#[derive(Debug)]
pub struct Tool {
    pub name: &'static str,
    /// Handled extensions; empty means the tool applies to every file.
    pub extensions: &'static [&'static str],
    /// Packages needed to run the tool, for packaging scripts only; never
    /// consulted by the scheduler.
    pub dependencies: &'static [&'static str],
    /// Executables that must resolve on `PATH` for the tool to be usable.
    pub executables: &'static [&'static str],
    pub kind: ToolKind,
    pub timeout_secs: u64,
    available: OnceCell<bool>,
    identity: OnceCell<String>,
}

impl Tool {
    const fn builtin(
        name: &'static str,
        run: fn(&Path) -> Result<(Status, Vec<String>)>,
    ) -> Tool {
        Tool::builtin_for(name, &[], &[], &[], run)
    }

    const fn builtin_for(
        name: &'static str,
        extensions: &'static [&'static str],
        dependencies: &'static [&'static str],
        executables: &'static [&'static str],
        run: fn(&Path) -> Result<(Status, Vec<String>)>,
    ) -> Tool {
        Tool {
            name,
            extensions,
            dependencies,
            executables,
            kind: ToolKind::Builtin(run),
            timeout_secs: TOOL_TIMEOUT.as_secs(),
            available: OnceCell::new(),
            identity: OnceCell::new(),
        }
    }

    const fn command(
        name: &'static str,
        extensions: &'static [&'static str],
        dependencies: &'static [&'static str],
        argv: &'static [&'static str],
        success: Status,
        error: Status,
        has_color: bool,
    ) -> Tool {
        Tool {
            name,
            extensions,
            dependencies,
            executables: &[],
            kind: ToolKind::Command { argv, success, error, has_color, refine: None },
            timeout_secs: TOOL_TIMEOUT.as_secs(),
            available: OnceCell::new(),
            identity: OnceCell::new(),
        }
    }

    const fn command_refined(
        name: &'static str,
        extensions: &'static [&'static str],
        dependencies: &'static [&'static str],
        argv: &'static [&'static str],
        has_color: bool,
        refine: fn(Option<i32>, &str) -> Status,
    ) -> Tool {
        Tool {
            name,
            extensions,
            dependencies,
            executables: &[],
            kind: ToolKind::Command {
                argv,
                success: Status::Ok,
                error: Status::Problem,
                has_color,
                refine: Some(refine),
            },
            timeout_secs: TOOL_TIMEOUT.as_secs(),
            available: OnceCell::new(),
            identity: OnceCell::new(),
        }
    }

    /// Whether every executable the tool needs resolves on `PATH`.
    /// Probed once per process.
    pub fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let executables: &[&str] = if self.executables.is_empty() {
                match &self.kind {
                    ToolKind::Builtin(_) => return true,
                    ToolKind::Command { argv, .. } => &argv[..1],
                }
            } else {
                self.executables
            };
            executables.iter().all(|exe| which::which(exe).is_ok())
        })
    }

    /// Stable fingerprint of the tool's identity: its name plus the bytes
    /// that define its behavior. Changing a command line (or releasing a
    /// new engine, for builtins) yields a new hash, which invalidates every
    /// cached result the tool produced.
    pub fn identity_hash(&self) -> &str {
        self.identity.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(self.name.as_bytes());
            match &self.kind {
                ToolKind::Builtin(_) => {
                    hasher.update(b"builtin:");
                    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
                }
                ToolKind::Command { argv, success, error, refine, .. } => {
                    for arg in *argv {
                        hasher.update(arg.as_bytes());
                        hasher.update([0]);
                    }
                    hasher.update([success.code(), error.code()]);
                    // A refinement function lives in the engine binary, so
                    // its behavior changes with the crate version.
                    if refine.is_some() {
                        hasher.update(b"refine:");
                        hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
                    }
                }
            }
            let digest = hasher.finalize();
            digest.iter().map(|byte| format!("{byte:02x}")).collect()
        })
    }

    pub fn timeout(&self) -> Duration {
        let secs = std::env::var(TIMEOUT_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.timeout_secs);
        Duration::from_secs(secs)
    }
}

/// pytest exits with 5 when it collected no tests.
fn pytest_status(code: Option<i32>, _output: &str) -> Status {
    match code {
        Some(0) => Status::Ok,
        Some(5) => Status::NotApplicable,
        _ => Status::Problem,
    }
}

/// A complexity score above 10 is a problem; the exit code says nothing.
/// Each report line is `position function_name score`.
fn mccabe_status(_code: Option<i32>, output: &str) -> Status {
    let max_score = output
        .lines()
        .filter_map(|line| line.split_whitespace().last()?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    if max_score > 10 {
        Status::Problem
    } else {
        Status::Ok
    }
}

/// Tools applied to every file regardless of extension.
static GENERIC_TOOLS: [Tool; 3] = [
    Tool::builtin("contents", builtin::contents),
    Tool::builtin("metadata", builtin::metadata),
    Tool::command(
        "linguist",
        &[],
        &["gem/github-linguist"],
        &["linguist"],
        Status::Normal,
        Status::Problem,
        false,
    ),
];

/// Tools applied to every file when the project root is a git work tree.
static VCS_TOOLS: [Tool; 2] = [
    Tool::command(
        "git-blame",
        &[],
        &["git"],
        &["git", "blame", "--date=short", "--"],
        Status::Normal,
        Status::NotApplicable,
        false,
    ),
    Tool::command(
        "git-log",
        &[],
        &["git"],
        &["git", "log", "--follow", "--oneline", "--"],
        Status::Normal,
        Status::NotApplicable,
        false,
    ),
];

/// The extension-specific tool table.
static EXTENSION_TOOLS: [Tool; 16] = [
    Tool::command(
        "pycodestyle",
        &["py"],
        &["pip/pycodestyle"],
        &["pycodestyle"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "pyflakes",
        &["py"],
        &["pip/pyflakes"],
        &["pyflakes"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "pylint",
        &["py"],
        &["pip/pylint"],
        &["pylint", "--score=n"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "mypy",
        &["py"],
        &["pip/mypy"],
        &["mypy", "--ignore-missing-imports"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command_refined(
        "pytest",
        &["py"],
        &["pip/pytest", "pip/pytest-cov"],
        &["pytest", "--color=yes"],
        true,
        pytest_status,
    ),
    Tool::command(
        "python-coverage",
        &["py"],
        &["pip/coverage"],
        &["coverage", "report", "--include"],
        Status::Normal,
        Status::NotApplicable,
        false,
    ),
    Tool::command_refined(
        "python-mccabe",
        &["py"],
        &["pip/mccabe"],
        &["python3", "-m", "mccabe"],
        false,
        mccabe_status,
    ),
    Tool::command(
        "perltidy",
        &["pl", "pm"],
        &["perltidy"],
        &["perltidy", "-st"],
        Status::Normal,
        Status::Problem,
        false,
    ),
    Tool::command(
        "pandoc",
        &["md", "markdown", "rst"],
        &["pandoc"],
        &["pandoc", "--to=plain"],
        Status::Normal,
        Status::NotApplicable,
        false,
    ),
    Tool::builtin_for(
        "godoc",
        &["go"],
        &["go/github.com/golang/go/src/cmd/godoc"],
        &["godoc"],
        builtin::godoc,
    ),
    Tool::command(
        "perl-syntax",
        &["pl", "pm"],
        &["perl"],
        &["perl", "-c"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "html-syntax",
        &["html", "htm"],
        &["tidy"],
        &["tidy", "-quiet", "-errors"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "cppcheck",
        &["c", "h", "cc", "cpp", "hpp"],
        &["cppcheck"],
        &["cppcheck", "--quiet"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "shellcheck",
        &["sh", "bash"],
        &["shellcheck"],
        &["shellcheck", "--color=always"],
        Status::Ok,
        Status::Problem,
        true,
    ),
    Tool::command(
        "yamllint",
        &["yaml", "yml"],
        &["pip/yamllint"],
        &["yamllint"],
        Status::Ok,
        Status::Problem,
        false,
    ),
    Tool::command(
        "json-syntax",
        &["json"],
        &["jq"],
        &["jq", "."],
        Status::Ok,
        Status::Problem,
        false,
    ),
];

static TOOLS_BY_NAME: Lazy<HashMap<&'static str, &'static Tool>> = Lazy::new(|| {
    all_tools().map(|tool| (tool.name, tool)).collect()
});

static TOOLS_BY_EXTENSION: Lazy<HashMap<&'static str, Vec<&'static Tool>>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Vec<&'static Tool>> = HashMap::new();
    for tool in EXTENSION_TOOLS.iter() {
        for extension in tool.extensions {
            map.entry(extension).or_default().push(tool);
        }
    }
    map
});

fn all_tools() -> impl Iterator<Item = &'static Tool> {
    GENERIC_TOOLS.iter().chain(VCS_TOOLS.iter()).chain(EXTENSION_TOOLS.iter())
}

/// Looks a tool up by its stable name, e.g. when a worker receives a job or
/// a snapshot is restored.
pub fn tool_by_name(name: &str) -> Option<&'static Tool> {
    TOOLS_BY_NAME.get(name).copied()
}

/// Union of every tool's dependency set, for packaging scripts.
pub fn tool_dependencies() -> BTreeSet<&'static str> {
    all_tools().flat_map(|tool| tool.dependencies.iter().copied()).collect()
}

/// Combined fingerprint of the whole tool table. Stored in the cache
/// directory; a mismatch at startup means cached results were produced by
/// different tools and the cache is wiped.
pub fn registry_fingerprint() -> String {
    let mut hasher = Sha256::new();
    for tool in all_tools() {
        hasher.update(tool.identity_hash().as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Decides which tools apply to which paths for one project root.
#[derive(Debug)]
pub struct ToolRegistry {
    has_git: bool,
}

impl ToolRegistry {
    pub fn new(root: &Path) -> Self {
        ToolRegistry { has_git: root.join(".git").is_dir() }
    }

    pub fn generic_tools(&self) -> impl Iterator<Item = &'static Tool> {
        GENERIC_TOOLS.iter()
    }

    /// The ordered tool row for a path: generic tools, then VCS tools when
    /// the root has a `.git` directory, then the extension-specific list,
    /// all filtered by availability.
    pub fn tools_for_path(&self, path: &RelPath) -> Vec<&'static Tool> {
        let mut tools: Vec<&'static Tool> = GENERIC_TOOLS.iter().collect();
        if self.has_git {
            tools.extend(VCS_TOOLS.iter());
        }
        let extension = path.extension();
        if !extension.is_empty() {
            if let Some(extra) = TOOLS_BY_EXTENSION.get(extension) {
                tools.extend(extra.iter().copied());
            }
        }
        tools.retain(|tool| tool.is_available());
        tools
    }
}

/// The builtin tools, executed inside the worker process.
pub mod builtin {
    use super::*;
    use crate::utils::fix_output;
    use std::os::unix::fs::MetadataExt;

    /// Renders the file itself, syntax highlighted when the extension is
    /// recognized. Binary files are not applicable.
    pub fn contents(path: &Path) -> Result<(Status, Vec<String>)> {
        let bytes = fs::read(path).map_err(|err| crate::error::EngineError::io(err, path))?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return Ok((Status::NotApplicable, vec!["Not unicode".to_string()])),
        };
        let text = fix_output(&text);
        let lines = highlight(&text, path).unwrap_or_else(|| {
            text.lines().map(str::to_string).collect()
        });
        Ok((Status::Normal, lines))
    }

    fn highlight(text: &str, path: &Path) -> Option<Vec<String>> {
        use syntect::{
            easy::HighlightLines, highlighting::ThemeSet, parsing::SyntaxSet,
            util::as_24_bit_terminal_escaped,
        };
        static SYNTAXES: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
        static THEMES: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

        let extension = path.extension()?.to_str()?;
        let syntax = SYNTAXES.find_syntax_by_extension(extension)?;
        let theme_name =
            std::env::var(THEME_ENV).unwrap_or_else(|_| "base16-ocean.dark".to_string());
        let theme = THEMES.themes.get(&theme_name).or_else(|| THEMES.themes.values().next())?;
        let mut highlighter = HighlightLines::new(syntax, theme);
        let mut lines = Vec::new();
        for line in text.lines() {
            let ranges = highlighter.highlight_line(line, &SYNTAXES).ok()?;
            lines.push(format!("{}\x1b[0m", as_24_bit_terminal_escaped(&ranges, false)));
        }
        Some(lines)
    }

    /// A stat summary: size, permissions, timestamps, ownership, links.
    pub fn metadata(path: &Path) -> Result<(Status, Vec<String>)> {
        let meta =
            fs::symlink_metadata(path).map_err(|err| crate::error::EngineError::io(err, path))?;
        let mode = meta.mode();
        let lines = vec![
            format!("size:            {}", pretty_bytes(meta.len())),
            format!("permissions:     {} ({:03o})", mode_string(mode), mode & 0o777),
            String::new(),
            format!("modified time:   {}", format_secs(meta.mtime())),
            format!("change time:     {}", format_secs(meta.ctime())),
            format!("access time:     {}", format_secs(meta.atime())),
            String::new(),
            format!("owner:           uid {}", meta.uid()),
            format!("group:           gid {}", meta.gid()),
            String::new(),
            format!("hardlinks:       {}", meta.nlink()),
            format!("symlink:         {}", if meta.file_type().is_symlink() { "yes" } else { "no" }),
        ];
        Ok((Status::Normal, lines))
    }

    /// Renders the package documentation for a Go file. godoc documents
    /// directories, so the file is symlinked alone into a scratch
    /// directory first.
    pub fn godoc(path: &Path) -> Result<(Status, Vec<String>)> {
        use crate::error::EngineError;
        let scratch = tempfile::tempdir().map_err(|err| EngineError::io(err, path))?;
        let target = fs::canonicalize(path).map_err(|err| EngineError::io(err, path))?;
        let link = scratch.path().join("file.go");
        std::os::unix::fs::symlink(&target, &link)
            .map_err(|err| EngineError::io(err, link.as_path()))?;
        let output = std::process::Command::new("godoc")
            .arg(".")
            .current_dir(scratch.path())
            .output()
            .map_err(|err| EngineError::io(err, path))?;
        let text = fix_output(&String::from_utf8_lossy(&output.stdout));
        Ok((Status::Normal, text.lines().map(str::to_string).collect()))
    }

    fn format_secs(secs: i64) -> String {
        use chrono::TimeZone;
        match chrono::Utc.timestamp_opt(secs, 0) {
            chrono::LocalResult::Single(time) => {
                format!("{} ({secs} secs)", time.format("%a %b %e %T %Y"))
            }
            _ => format!("{secs} secs"),
        }
    }

    fn mode_string(mode: u32) -> String {
        let mut out = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }

    fn pretty_bytes(bytes: u64) -> String {
        if bytes == 0 {
            return "0 B".to_string();
        }
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
        let exponent = (63 - bytes.leading_zeros() as u64) / 10;
        let exponent = exponent.min(UNITS.len() as u64 - 1);
        let value = bytes as f64 / f64::powi(1024.0, exponent as i32);
        format!("{:.2} {}", value, UNITS[exponent as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builtin_tools_are_always_available() {
        for tool in GENERIC_TOOLS.iter().filter(|tool| matches!(tool.kind, ToolKind::Builtin(_)))
        {
            assert!(tool.is_available(), "{}", tool.name);
        }
    }

    #[test]
    fn generic_tools_apply_to_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());
        let tools = registry.tools_for_path(&RelPath::new("./no_extension"));
        let names: Vec<_> = tools.iter().map(|tool| tool.name).collect();
        assert!(names.contains(&"contents"));
        assert!(names.contains(&"metadata"));
        // No `.git` at the root, so no VCS tools.
        assert!(!names.contains(&"git-blame"));
    }

    #[test]
    fn vcs_tools_require_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let registry = ToolRegistry::new(dir.path());
        let names: Vec<_> = registry
            .tools_for_path(&RelPath::new("./a.txt"))
            .iter()
            .map(|tool| tool.name)
            .collect();
        if which::which("git").is_ok() {
            assert!(names.contains(&"git-blame"));
            assert!(names.contains(&"git-log"));
        }
    }

    #[test]
    fn extension_tools_filtered_by_availability() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());
        let tools = registry.tools_for_path(&RelPath::new("./script.py"));
        for tool in tools {
            assert!(tool.is_available());
        }
    }

    #[test]
    fn identity_hashes_are_stable_and_distinct() {
        let blame = tool_by_name("git-blame").unwrap();
        let log = tool_by_name("git-log").unwrap();
        assert_eq!(blame.identity_hash(), blame.identity_hash());
        assert_ne!(blame.identity_hash(), log.identity_hash());
        assert_eq!(blame.identity_hash().len(), 64);
    }

    #[test]
    fn lookup_by_name() {
        assert!(tool_by_name("contents").is_some());
        assert!(tool_by_name("no-such-tool").is_none());
    }

    #[test]
    fn dependencies_are_aggregated() {
        let dependencies = tool_dependencies();
        assert!(dependencies.contains("git"));
        assert!(dependencies.contains("pip/pyflakes"));
        assert!(dependencies.contains("pip/pytest"));
        assert!(dependencies.contains("gem/github-linguist"));
    }

    #[test]
    fn pytest_exit_codes_map_to_statuses() {
        assert_eq!(pytest_status(Some(0), ""), Status::Ok);
        assert_eq!(pytest_status(Some(5), ""), Status::NotApplicable);
        assert_eq!(pytest_status(Some(1), ""), Status::Problem);
        assert_eq!(pytest_status(None, ""), Status::Problem);
    }

    #[test]
    fn mccabe_scores_decide_the_status() {
        let low = "1:1 'foo' 3\n8:1 'bar' 10\n";
        assert_eq!(mccabe_status(Some(0), low), Status::Ok);
        let high = "1:1 'foo' 3\n8:1 'bar' 11\n";
        assert_eq!(mccabe_status(Some(0), high), Status::Problem);
        // No parseable scores (e.g. the module is missing) reads as clean.
        assert_eq!(mccabe_status(Some(1), "No module named mccabe\n"), Status::Ok);
        assert_eq!(mccabe_status(Some(0), ""), Status::Ok);
    }

    #[test]
    fn contents_builtin_reads_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.unknownext");
        fs::write(&path, "hello\nworld\n").unwrap();
        let (status, lines) = builtin::contents(&path).unwrap();
        assert_eq!(status, Status::Normal);
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn contents_builtin_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x01]).unwrap();
        let (status, lines) = builtin::contents(&path).unwrap();
        assert_eq!(status, Status::NotApplicable);
        assert_eq!(lines, vec!["Not unicode"]);
    }

    #[test]
    fn metadata_builtin_reports_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, "12345").unwrap();
        let (status, lines) = builtin::metadata(&path).unwrap();
        assert_eq!(status, Status::Normal);
        assert!(lines[0].contains("5.00 B") || lines[0].contains("5 B"), "{}", lines[0]);
        assert!(lines.iter().any(|line| line.starts_with("hardlinks:")));
    }
}
