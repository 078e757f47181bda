use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Various error types for the engine core.
///
/// Everything that is not [`EngineError::FatalInit`] is recoverable: it is
/// caught at the nearest task boundary, logged, and the engine continues.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A bounded tool invocation exceeded its timeout.
    #[error("`{tool}` timed out after {timeout:?} on {path}")]
    ToolTimeout { tool: String, path: String, timeout: Duration },
    /// A worker process died or returned a malformed status line.
    #[error("worker running `{tool}` on {path} died: {reason}")]
    ToolCrash { tool: String, path: String, reason: String },
    /// A write, rename or delete in the artifact store failed.
    #[error("artifact store failure for \"{path}\": {source}")]
    Storage { path: PathBuf, source: io::Error },
    /// The snapshot file is corrupt or written by an incompatible version.
    #[error("failed to load snapshot: {0}")]
    Load(String),
    /// The filesystem watcher could not be set up or died.
    #[error("filesystem watcher failed: {0}")]
    Watcher(String),
    /// The project path is missing or not a directory. Reported once, exits
    /// non-zero.
    #[error("\"{path}\" is not a usable project directory: {reason}")]
    FatalInit { path: PathBuf, reason: String },
    #[error("\"{path}\": {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl EngineError {
    pub fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        EngineError::Io { path: path.into(), source }
    }

    pub fn storage(source: io::Error, path: impl Into<PathBuf>) -> Self {
        EngineError::Storage { path: path.into(), source }
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        EngineError::Message(msg.to_string())
    }

    /// Whether the underlying cause is a plain "file not found".
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::Io { source, .. } | EngineError::Storage { source, .. } => {
                source.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }

    pub(crate) fn fatal_init(path: &Path, reason: impl std::fmt::Display) -> Self {
        EngineError::FatalInit { path: path.to_path_buf(), reason: reason.to_string() }
    }
}
