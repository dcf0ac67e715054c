//! Wire protocol types for the nimbus deployment API.
//!
//! Request and response payloads exchanged with the deployment service,
//! plus the endpoint constants both phases of a deployment use.

pub mod messages;

// Re-export primary types for convenience.
pub use messages::{CreateRequest, CreateResponse, FileDescriptor, SyncRequest};

/// Default deployment API host.
pub const DEFAULT_API_HOST: &str = "api.nimbus.sh";

/// Endpoint that registers a deployment and returns the missing-hash set.
pub const CREATE_PATH: &str = "/create";

/// Endpoint that receives one file body per request.
pub const SYNC_PATH: &str = "/sync";
