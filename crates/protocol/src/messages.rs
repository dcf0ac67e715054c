use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// One manifest entry: content identity plus size, never the content itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub sha: String,
    pub size: u64,
}

/// Registers a deployment from a manifest of `{sha, size}` descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub force_new: bool,
    pub files: Vec<FileDescriptor>,
}

/// Uploads one file body the service reported as missing.
///
/// `file` is the path relative to the deployment root, forward slashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub sha: String,
    pub data: String,
    pub file: String,
    pub deployment_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Successful `create` response.
///
/// `missing` is absent when the service already has every file content
/// (a fully deduplicated deployment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub deployment_id: String,
    pub url: String,
    #[serde(default)]
    pub missing: Vec<String>,
}
