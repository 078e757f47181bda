//! Utility functions

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    io::Write,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};
use walkdir::WalkDir;

/// Extensions that must be split off as a unit rather than at the last dot.
const COMPOUND_EXTENSIONS: &[&str] = &["tar.gz", "tar.bz2", "tar.xz"];

/// A project-relative path of the form `./sub/…/name.ext`.
///
/// The project root is fixed at engine start and never part of the path,
/// which is what makes snapshots portable across a moved or renamed root.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    /// Builds a relative path from a path already known to live under
    /// `root`. Components are joined with `/`.
    pub fn from_root(root: &Path, path: &Path) -> Option<RelPath> {
        let rel = path.strip_prefix(root).ok()?;
        let mut out = String::from(".");
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    out.push('/');
                    out.push_str(&part.to_string_lossy());
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        if out == "." {
            return None;
        }
        Some(RelPath(out))
    }

    /// Parses an already-relative string, normalizing a missing `./` prefix.
    pub fn new(path: impl Into<String>) -> RelPath {
        let path = path.into();
        if let Some(stripped) = path.strip_prefix("./") {
            RelPath(format!("./{stripped}"))
        } else {
            RelPath(format!("./{path}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path without the `./` prefix.
    pub fn stripped(&self) -> &str {
        &self.0[2..]
    }

    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        root.join(self.stripped())
    }

    /// Directory part of the path, `""` for top-level files.
    pub fn dirname(&self) -> &str {
        match self.stripped().rfind('/') {
            Some(index) => &self.stripped()[..index],
            None => "",
        }
    }

    pub fn basename(&self) -> &str {
        match self.stripped().rfind('/') {
            Some(index) => &self.stripped()[index + 1..],
            None => self.stripped(),
        }
    }

    /// The extension, without the leading dot, `""` when there is none.
    ///
    /// Compound archive extensions are kept whole, so `a.tar.gz` yields
    /// `tar.gz` rather than `gz`.
    pub fn extension(&self) -> &str {
        let name = self.basename();
        for compound in COMPOUND_EXTENSIONS {
            if let Some(stem) = name.strip_suffix(compound) {
                if stem.ends_with('.') && stem.len() > 1 {
                    return compound;
                }
            }
        }
        match name.rfind('.') {
            Some(index) if index > 0 => &name[index + 1..],
            _ => "",
        }
    }

    pub fn len(&self) -> usize {
        self.stripped().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripped().is_empty()
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether any component of the path starts with a dot.
///
/// Applied both during the initial walk and to watcher events, so hidden
/// trees are neither scanned nor watched.
pub fn is_path_excluded(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Walks the project tree and returns every non-hidden file as a relative
/// path. Symlinks to files are reported like regular files; hidden
/// directories are pruned without descending.
pub fn codebase_files(root: &Path) -> Vec<RelPath> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
        .filter_map(|entry| RelPath::from_root(root, entry.path()))
        .collect()
}

/// Millisecond mtime of a file, used as its observed change time.
pub fn change_time(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|err| EngineError::io(err, path))?;
    let modified = metadata.modified().map_err(|err| EngineError::io(err, path))?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .map_err(EngineError::msg)?
        .as_millis() as u64;
    Ok(millis)
}

pub fn create_parent_dir_all(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| EngineError::io(err, parent))?;
    }
    Ok(())
}

/// Writes `contents` to `<path>.tmp` and atomically renames it into place.
///
/// A failure removes the tmp file before reporting, so a reader never
/// observes a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    create_parent_dir_all(path)?;
    let tmp = tmp_sibling(path);
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|err| {
        let _ = fs::remove_file(&tmp);
        EngineError::storage(err, path)
    })
}

pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Creates an empty file, updating its mtime if it already exists.
pub fn touch(path: &Path) -> Result<()> {
    fs::File::create(path).map_err(|err| EngineError::io(err, path))?;
    Ok(())
}

/// `HH:MM:SS` local wall-clock timestamp for log lines.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Replaces non-printable control characters and expands tabs, so tool
/// output renders without corrupting the terminal.
pub fn fix_output(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\t' => out.push_str("    "),
            '\n' => out.push('\n'),
            ch if (ch as u32) < 32 => out.push('#'),
            ch => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rel_path_parts() {
        let path = RelPath::new("./src/deep/file.rs");
        assert_eq!(path.dirname(), "src/deep");
        assert_eq!(path.basename(), "file.rs");
        assert_eq!(path.extension(), "rs");
        assert_eq!(path.len(), "src/deep/file.rs".len());

        let top = RelPath::new("README");
        assert_eq!(top.as_str(), "./README");
        assert_eq!(top.dirname(), "");
        assert_eq!(top.basename(), "README");
        assert_eq!(top.extension(), "");
    }

    #[test]
    fn compound_extensions_split_whole() {
        assert_eq!(RelPath::new("./dist/release.tar.gz").extension(), "tar.gz");
        assert_eq!(RelPath::new("./dist/release.tar.bz2").extension(), "tar.bz2");
        assert_eq!(RelPath::new("./dist/release.gz").extension(), "gz");
        // A bare dotfile has no extension.
        assert_eq!(RelPath::new("x/.tar.gz").basename(), ".tar.gz");
    }

    #[test]
    fn excluded_paths() {
        assert!(is_path_excluded(Path::new("a/.git/config")));
        assert!(is_path_excluded(Path::new(".hidden")));
        assert!(!is_path_excluded(Path::new("src/main.rs")));
    }

    #[test]
    fn walk_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "x").unwrap();
        fs::write(dir.path().join(".git/objects/aa"), "x").unwrap();
        fs::write(dir.path().join(".secret"), "x").unwrap();
        let files = codebase_files(dir.path());
        assert_eq!(files, vec![RelPath::new("./src/lib.rs")]);
    }

    #[test]
    fn atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/blob");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn fix_output_scrubs_controls() {
        assert_eq!(fix_output("a\tb"), "a    b");
        assert_eq!(fix_output("a\u{7}b\n"), "a#b\n");
    }
}
