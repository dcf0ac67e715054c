//! Data model for one deployment session.

use std::collections::HashSet;
use std::path::PathBuf;

use nimbus_retry::RetryPolicy;

/// Lifecycle of one deployment session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing has happened yet.
    Idle,
    /// The create handshake is in flight.
    Creating,
    /// The service knows the manifest; the missing set is pending upload.
    Created,
    /// Missing contents are being uploaded.
    Syncing,
    /// Every missing file uploaded.
    Completed,
    /// The session ended with a terminal error.
    Failed,
}

/// Events emitted by the sync engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// One missing file finished uploading.
    Upload(UploadedFile),
    /// Every missing file uploaded.
    Complete,
    /// Terminal failure for the session.
    Error(String),
}

/// Metadata of a synced file (identity and size, not content).
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub sha: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Server-assigned identity of a deployment in progress.
///
/// `missing` shrinks as uploads complete; entries left behind after a
/// failed sync are the pending or failed files.
#[derive(Debug, Clone)]
pub struct DeploymentSession {
    pub id: String,
    pub url: String,
    pub missing: HashSet<String>,
    pub base_path: PathBuf,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Ask the service for a fresh deployment even if an identical one
    /// already exists.
    pub force_new: bool,
    /// Schedule for the create handshake.
    pub create_retry: RetryPolicy,
    /// Schedule for each missing-file upload.
    pub upload_retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_new: false,
            create_retry: RetryPolicy::create_phase(),
            upload_retry: RetryPolicy::upload_phase(),
        }
    }
}
