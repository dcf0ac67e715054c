//! Deploy error types.

use std::path::PathBuf;

/// One file that terminally failed to sync.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub sha: String,
    pub path: PathBuf,
    pub error: String,
}

/// Errors produced during a deployment session.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("could not read directory {}", .0.display())]
    ProjectDir(PathBuf),

    #[error("failed to read JSON in \"{}\"", .0.display())]
    Manifest(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] nimbus_connection::AgentError),

    #[error("forbidden (status {status})")]
    Forbidden { status: u16 },

    #[error("deployment initialization failed")]
    InitFailed,

    #[error("no deployment session, call create first")]
    NoSession,

    #[error("{} file(s) failed to sync", .failures.len())]
    Sync { failures: Vec<SyncFailure> },
}
