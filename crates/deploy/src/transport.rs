//! Transport seam between the engine and the connection agent.

use std::future::Future;
use std::pin::Pin;

use nimbus_connection::{Agent, AgentError, Response};

/// Abstract request channel to the deployment service.
///
/// The engine depends on this trait instead of the concrete agent, which
/// keeps the protocol logic decoupled from the HTTP/2 transport and
/// testable with mocks.
pub trait Transport: Send + Sync {
    /// POSTs a JSON body and returns the raw response.
    ///
    /// Implementations report only transport-level failures; HTTP error
    /// statuses come back as ordinary responses.
    fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<Response, AgentError>> + Send + '_>>;
}

impl Transport for Agent {
    fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<Response, AgentError>> + Send + '_>> {
        let path = path.to_owned();
        Box::pin(async move { Agent::post_json(self, &path, body).await })
    }
}
