//! Tool-runner subprocesses.
//!
//! The engine keeps a pool of long-lived `scrutiny-worker` processes, each
//! running a trivial loop: read `(tool_name, path)` lines from stdin, run
//! the tool with a hard timeout, write one status integer to stdout,
//! repeat. Workers are placed in their own process group, niced to the
//! lowest priority, and a hung tool only costs a process-group kill, never
//! the worker itself.
//!
//! Both halves of the protocol live here: [`WorkerHandle`] (engine side)
//! and [`worker_main`] (the `scrutiny-worker` binary).

use crate::{
    compression::Compression,
    error::{EngineError, Result},
    status::Status,
    store::ReportStore,
    tools::{self, Tool, ToolKind},
    utils::{fix_output, RelPath},
    CACHE_DIR_NAME,
};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};

/// Consecutive worker deaths tolerated for a single job before its cell is
/// marked `Error`.
pub const WORKER_RETRY_LIMIT: usize = 3;

/// Environment variable overriding where the worker executable is found;
/// by default it sits next to the engine binary.
pub const WORKER_BIN_ENV: &str = "SCRUTINY_WORKER_BIN";

fn worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        return Ok(PathBuf::from(path));
    }
    let current = std::env::current_exe().map_err(|err| EngineError::io(err, "current_exe"))?;
    Ok(current.with_file_name("scrutiny-worker"))
}

/// Engine-side handle to one worker subprocess.
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pgid: i32,
    root: PathBuf,
    compression: Compression,
}

impl WorkerHandle {
    /// Spawns a worker in its own session (so its whole tool process tree
    /// forms one killable group), reads its pgid handshake, drops its
    /// priority and sends it the compression selector.
    pub async fn spawn(root: &Path, compression: Compression) -> Result<Self> {
        let binary = worker_binary()?;
        let mut command = Command::new(&binary);
        command
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let mut child =
            command.spawn().map_err(|err| EngineError::io(err, binary.clone()))?;
        let stdin = child.stdin.take().expect("worker stdin was piped");
        let mut stdout = BufReader::new(child.stdout.take().expect("worker stdout was piped"));

        let mut pgid_line = String::new();
        stdout
            .read_line(&mut pgid_line)
            .await
            .map_err(|err| EngineError::io(err, &binary))?;
        let pgid: i32 = pgid_line
            .trim()
            .parse()
            .map_err(|_| EngineError::msg(format!("bad worker handshake: {pgid_line:?}")))?;
        unsafe {
            libc::setpriority(libc::PRIO_PGRP as _, pgid as libc::id_t, 19);
        }

        let mut handle = WorkerHandle {
            child,
            stdin,
            stdout,
            pgid,
            root: root.to_path_buf(),
            compression,
        };
        handle.write_line(&compression.to_string()).await?;
        debug!("spawned worker pgid {pgid}");
        Ok(handle)
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|err| EngineError::io(err, "worker stdin"))?;
        self.stdin.flush().await.map_err(|err| EngineError::io(err, "worker stdin"))
    }

    /// Runs one job on this worker. An `Err` means the worker died (EOF or
    /// an unwritable pipe); the caller respawns and retries.
    pub async fn run_job(&mut self, tool_name: &str, path: &RelPath) -> Result<Status> {
        self.write_line(tool_name).await.map_err(|err| died(tool_name, path, err))?;
        self.write_line(path.as_str()).await.map_err(|err| died(tool_name, path, err))?;
        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .await
            .map_err(|err| died(tool_name, path, EngineError::io(err, "worker stdout")))?;
        if read == 0 || reply.trim().is_empty() {
            return Err(EngineError::ToolCrash {
                tool: tool_name.to_string(),
                path: path.as_str().to_string(),
                reason: "EOF on worker stdout".to_string(),
            });
        }
        Ok(Status::from_worker_reply(&reply))
    }

    /// Replaces the dead subprocess with a fresh one.
    pub async fn respawn(&mut self) -> Result<()> {
        self.kill_group();
        let fresh = WorkerHandle::spawn(&self.root, self.compression).await?;
        *self = fresh;
        Ok(())
    }

    /// SIGKILLs the worker's whole process group.
    pub fn kill_group(&mut self) {
        unsafe {
            libc::killpg(self.pgid, libc::SIGKILL);
        }
        // Reap if already exited; the kill above is asynchronous.
        let _ = self.child.start_kill();
    }
}

fn died(tool: &str, path: &RelPath, err: EngineError) -> EngineError {
    EngineError::ToolCrash {
        tool: tool.to_string(),
        path: path.as_str().to_string(),
        reason: err.to_string(),
    }
}

/// Runs one external command tool with a hard timeout.
///
/// The command gets its own process group; on expiry the whole group is
/// killed, the exit is reaped and the job reports `TimedOut`. The worker
/// itself survives.
async fn run_command_tool(
    argv: &[&str],
    path: &Path,
    success: Status,
    error: Status,
    has_color: bool,
    refine: Option<fn(Option<i32>, &str) -> Status>,
    limit: Duration,
) -> (Status, Vec<String>) {
    let mut command = Command::new(argv[0]);
    command
        .args(&argv[1..])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return (Status::Error, vec![format!("failed to start {}: {err}", argv[0])]),
    };
    let pid = child.id().map(|id| id as i32);
    let mut stdout = child.stdout.take().expect("tool stdout was piped");
    let mut stderr = child.stderr.take().expect("tool stderr was piped");

    // The block only borrows `child`; once the timeout drops it, the
    // expiry arm below can still kill and reap the process.
    let gathered = tokio::time::timeout(limit, async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        let exit = child.wait().await;
        (exit, out, err)
    })
    .await;

    match gathered {
        Ok((exit, out, err)) => {
            let succeeded = matches!(&exit, Ok(status) if status.success());
            let exit_code = exit.ok().and_then(|status| status.code());
            let mut text = String::from_utf8_lossy(&out).into_owned();
            text.push_str(&String::from_utf8_lossy(&err));
            let text = if has_color { text } else { fix_output(&text) };
            let status = match refine {
                Some(refine) => refine(exit_code, &text),
                None if succeeded => success,
                None => error,
            };
            let lines = text.lines().map(str::to_string).collect();
            (status, lines)
        }
        Err(_) => {
            if let Some(pid) = pid {
                unsafe {
                    libc::killpg(pid, libc::SIGKILL);
                }
            }
            let _ = child.wait().await;
            (Status::TimedOut, vec!["Timed out".to_string()])
        }
    }
}

/// Runs a tool on a path, never letting an error escape as anything but a
/// status: the worker loop must survive every job.
async fn run_tool(tool: &'static Tool, path: &Path) -> (Status, Vec<String>) {
    match &tool.kind {
        ToolKind::Builtin(run) => match run(path) {
            Ok((status, lines)) => (status, lines),
            Err(err) => (Status::Error, vec![err.to_string()]),
        },
        ToolKind::Command { argv, success, error, has_color, refine } => {
            run_command_tool(argv, path, *success, *error, *has_color, *refine, tool.timeout())
                .await
        }
    }
}

/// The body of the `scrutiny-worker` binary.
///
/// Protocol, line-oriented UTF-8 on stdin/stdout:
/// 1. print own process-group id;
/// 2. read the compression selector;
/// 3. loop: read tool name and path, run, persist the report, print the
///    status integer. EOF on stdin means "die".
pub async fn worker_main() -> std::io::Result<()> {
    use tokio::io::{stdin, stdout};

    let pgid = unsafe { libc::getpgrp() };
    let mut out = stdout();
    out.write_all(format!("{pgid}\n").as_bytes()).await?;
    out.flush().await?;

    let mut lines = BufReader::new(stdin()).lines();
    let compression: Compression = match lines.next_line().await? {
        Some(line) => line.trim().parse().unwrap_or_default(),
        None => return Ok(()),
    };
    let store = ReportStore::new(CACHE_DIR_NAME);

    loop {
        let Some(tool_name) = lines.next_line().await? else { return Ok(()) };
        let Some(path_line) = lines.next_line().await? else { return Ok(()) };
        let path = RelPath::new(path_line.trim());
        let status = match tools::tool_by_name(tool_name.trim()) {
            Some(tool) => {
                let fs_path = PathBuf::from(path.as_str());
                let (status, report) = run_tool(tool, &fs_path).await;
                match store.put(&path, tool.name, report, compression) {
                    Ok(()) => status,
                    Err(_) => Status::Error,
                }
            }
            None => {
                let _ = store.put(
                    &path,
                    tool_name.trim(),
                    vec![format!("unknown tool \"{}\"", tool_name.trim())],
                    compression,
                );
                Status::Error
            }
        };
        out.write_all(format!("{}\n", status.code()).as_bytes()).await?;
        out.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_tool_captures_output_and_exit() {
        let (status, lines) = run_command_tool(
            &["sh", "-c", "echo hello; echo oops >&2; true"],
            Path::new("ignored"),
            Status::Ok,
            Status::Problem,
            false,
            None,
            Duration::from_secs(10),
        )
        .await;
        // `sh -c SCRIPT ignored` runs the script; the appended path is $0.
        assert_eq!(status, Status::Ok);
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn command_tool_maps_failure_status() {
        let (status, _) = run_command_tool(
            &["false"],
            Path::new("ignored"),
            Status::Ok,
            Status::Problem,
            false,
            None,
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(status, Status::Problem);
    }

    #[tokio::test]
    async fn command_tool_times_out_without_hanging() {
        let started = std::time::Instant::now();
        let (status, lines) = run_command_tool(
            &["sh", "-c", "sleep 70"],
            Path::new("ignored"),
            Status::Ok,
            Status::Problem,
            false,
            None,
            Duration::from_millis(200),
        )
        .await;
        assert_eq!(status, Status::TimedOut);
        assert_eq!(lines, vec!["Timed out".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn refined_exit_codes_override_the_plain_mapping() {
        fn five_is_not_applicable(code: Option<i32>, _output: &str) -> Status {
            match code {
                Some(0) => Status::Ok,
                Some(5) => Status::NotApplicable,
                _ => Status::Problem,
            }
        }
        let (status, _) = run_command_tool(
            &["sh", "-c", "exit 5"],
            Path::new("ignored"),
            Status::Ok,
            Status::Problem,
            false,
            Some(five_is_not_applicable),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(status, Status::NotApplicable);
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let (status, lines) = run_command_tool(
            &["definitely-not-a-real-binary-1234"],
            Path::new("ignored"),
            Status::Ok,
            Status::Problem,
            false,
            None,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(status, Status::Error);
        assert!(lines[0].contains("failed to start"));
    }

    #[tokio::test]
    async fn builtin_tool_errors_become_status_error() {
        let contents = tools::tool_by_name("contents").unwrap();
        let (status, lines) = run_tool(contents, Path::new("./does-not-exist")).await;
        assert_eq!(status, Status::Error);
        assert!(!lines.is_empty());
    }
}
