//! HTTP/2 connection agent.
//!
//! One agent owns one connection. The hyper connection driver runs in a
//! spawned task; when it terminates it records the fault, and the next
//! send discards the dead connection and establishes a fresh one before
//! issuing the request. The check-then-repair sequence runs under a
//! mutex so concurrent tasks never race to reconnect.

use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

/// Errors from the connection agent.
///
/// These are transport-level only. HTTP error statuses are returned as
/// ordinary [`Response`] values; interpreting them is the caller's job.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid host name: {0}")]
    InvalidHost(String),

    #[error("agent closed")]
    Closed,
}

/// Where the agent connects.
#[derive(Debug, Clone)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

impl Endpoint {
    /// The production deployment API.
    pub fn api() -> Self {
        Self::https(nimbus_protocol::DEFAULT_API_HOST)
    }

    /// TLS endpoint on port 443 with ALPN `h2`.
    pub fn https(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 443,
            tls: true,
        }
    }

    /// Plaintext HTTP/2 with prior knowledge. For tests and local services.
    pub fn insecure(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    fn uri_for(&self, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }
}

/// Request body variants.
pub enum RequestBody {
    /// Structured value, serialized to canonical JSON.
    Json(serde_json::Value),
    /// Raw bytes, sent verbatim.
    Raw(Vec<u8>),
    /// No body.
    Empty,
}

/// A raw HTTP exchange result: status plus collected body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Deserializes the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// One established connection plus its out-of-band fault slot.
struct Conn {
    sender: SendRequest<Full<Bytes>>,
    fault: Arc<StdMutex<Option<String>>>,
    driver: JoinHandle<()>,
}

impl Conn {
    fn healthy(&self) -> bool {
        self.fault.lock().map(|f| f.is_none()).unwrap_or(false)
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Authenticated HTTP/2 client bound to a single host.
///
/// All requests multiplex over one connection. After a connection fault
/// the agent stays idle; the next [`send`](Agent::send) re-establishes
/// the connection exactly once before issuing its request.
pub struct Agent {
    endpoint: Endpoint,
    token: String,
    conn: Mutex<Option<Conn>>,
}

impl Agent {
    /// Connects eagerly and returns the agent.
    pub async fn connect(endpoint: Endpoint, token: impl Into<String>) -> Result<Self, AgentError> {
        let conn = establish(&endpoint).await?;
        debug!(host = %endpoint.host, port = endpoint.port, "agent connected");
        Ok(Self {
            endpoint,
            token: token.into(),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Whether the current connection has seen no fault.
    pub async fn is_healthy(&self) -> bool {
        self.conn.lock().await.as_ref().is_some_and(Conn::healthy)
    }

    /// Issues an authenticated request and collects the full response.
    ///
    /// JSON bodies get a `Content-Type: application/json` header; any
    /// present body gets `Content-Length` of its encoded length. Only
    /// transport-level failures surface as errors.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<Response, AgentError> {
        let mut sender = self.ready_sender().await?;

        let (content_type, payload) = match body {
            RequestBody::Json(value) => (
                Some("application/json"),
                Some(Bytes::from(serde_json::to_vec(&value)?)),
            ),
            RequestBody::Raw(bytes) => (None, Some(Bytes::from(bytes))),
            RequestBody::Empty => (None, None),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(self.endpoint.uri_for(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token));
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        if let Some(ref p) = payload {
            builder = builder.header(CONTENT_LENGTH, p.len());
        }
        let req = builder.body(Full::new(payload.unwrap_or_default()))?;

        sender.ready().await?;
        let resp = sender.send_request(req).await?;
        let status = resp.status().as_u16();
        let body = resp.into_body().collect().await?.to_bytes();
        Ok(Response { status, body })
    }

    /// Convenience for the deployment API: `POST` with a JSON body.
    pub async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Response, AgentError> {
        self.send(Method::POST, path, RequestBody::Json(body)).await
    }

    /// Releases the connection. Sends after close fail with
    /// [`AgentError::Closed`].
    pub async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("agent closed");
        }
    }

    /// The check-unhealthy → repair → proceed critical section.
    ///
    /// The sender is cloned out so the response await happens outside
    /// the lock and concurrent requests multiplex freely.
    async fn ready_sender(&self) -> Result<SendRequest<Full<Bytes>>, AgentError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(AgentError::Closed)?;
        if !conn.healthy() {
            debug!("re-establishing connection after fault");
            *conn = establish(&self.endpoint).await?;
        }
        Ok(conn.sender.clone())
    }
}

/// Opens TCP (and TLS when configured), performs the HTTP/2 handshake,
/// and spawns the connection driver.
async fn establish(endpoint: &Endpoint) -> Result<Conn, AgentError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    if endpoint.tls {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        let name = ServerName::try_from(endpoint.host.clone())
            .map_err(|_| AgentError::InvalidHost(endpoint.host.clone()))?;
        let stream = TlsConnector::from(Arc::new(config)).connect(name, tcp).await?;
        handshake(TokioIo::new(stream)).await
    } else {
        handshake(TokioIo::new(tcp)).await
    }
}

async fn handshake<I>(io: I) -> Result<Conn, AgentError>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http2::handshake::<_, _, Full<Bytes>>(TokioExecutor::new(), io).await?;

    // The driver owns the socket. Whatever ends it, the connection is
    // gone; record the fault and let the next send repair.
    let fault: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let slot = fault.clone();
    let driver = tokio::spawn(async move {
        let outcome = match conn.await {
            Ok(()) => "connection closed".to_string(),
            Err(e) => {
                warn!(error = %e, "connection failed");
                e.to_string()
            }
        };
        if let Ok(mut f) = slot.lock() {
            *f = Some(outcome);
        }
    });

    Ok(Conn {
        sender,
        fault,
        driver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use hyper::body::Incoming;
    use hyper::server::conn::http2 as server_http2;
    use hyper::service::service_fn;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    /// In-process HTTP/2 server. Echoes request metadata as JSON and
    /// drops the connection shortly after serving a `/drop` request.
    struct TestServer {
        port: u16,
        conns: Arc<AtomicUsize>,
        handle: JoinHandle<()>,
    }

    impl TestServer {
        fn connections(&self) -> usize {
            self.conns.load(Ordering::SeqCst)
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    async fn spawn_server() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conns = Arc::new(AtomicUsize::new(0));
        let accepted = conns.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let close = Arc::new(Notify::new());
                    let close_signal = close.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let close = close_signal.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let bytes = body.collect().await.unwrap().to_bytes();
                            let header = |name: hyper::header::HeaderName| {
                                parts
                                    .headers
                                    .get(name)
                                    .and_then(|v| v.to_str().ok())
                                    .map(str::to_owned)
                            };
                            let info = serde_json::json!({
                                "path": parts.uri.path(),
                                "authorization": header(AUTHORIZATION),
                                "contentType": header(CONTENT_TYPE),
                                "contentLength": header(CONTENT_LENGTH),
                                "body": String::from_utf8_lossy(&bytes),
                            });
                            if parts.uri.path() == "/drop" {
                                close.notify_one();
                            }
                            Ok::<_, Infallible>(hyper::Response::new(Full::new(
                                Bytes::from(info.to_string()),
                            )))
                        }
                    });

                    let conn = server_http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    tokio::select! {
                        _ = conn.as_mut() => {}
                        _ = close.notified() => {
                            // Keep polling briefly so the in-flight
                            // response flushes, then drop the socket.
                            let _ = tokio::time::timeout(
                                Duration::from_millis(100),
                                conn.as_mut(),
                            )
                            .await;
                        }
                    }
                });
            }
        });

        TestServer {
            port,
            conns,
            handle,
        }
    }

    async fn connect(server: &TestServer) -> Agent {
        Agent::connect(Endpoint::insecure("127.0.0.1", server.port), "tok-1")
            .await
            .unwrap()
    }

    async fn wait_unhealthy(agent: &Agent) {
        for _ in 0..200 {
            if !agent.is_healthy().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent never observed the connection fault");
    }

    #[test]
    fn api_endpoint_targets_default_host() {
        let endpoint = Endpoint::api();
        assert_eq!(endpoint.host, nimbus_protocol::DEFAULT_API_HOST);
        assert_eq!(endpoint.port, 443);
        assert!(endpoint.tls);
    }

    #[test]
    fn uri_carries_scheme_authority_and_path() {
        let secure = Endpoint::https("api.example.com");
        assert_eq!(
            secure.uri_for("/create"),
            "https://api.example.com:443/create"
        );
        let plain = Endpoint::insecure("127.0.0.1", 8080);
        assert_eq!(plain.uri_for("/sync"), "http://127.0.0.1:8080/sync");
    }

    #[tokio::test]
    async fn json_body_sets_headers() {
        let server = spawn_server().await;
        let agent = connect(&server).await;

        let value = serde_json::json!({"forceNew": false});
        let encoded_len = serde_json::to_vec(&value).unwrap().len();
        let resp = agent.post_json("/create", value).await.unwrap();
        assert_eq!(resp.status, 200);

        let echo: serde_json::Value = resp.json().unwrap();
        assert_eq!(echo["path"], "/create");
        assert_eq!(echo["authorization"], "Bearer tok-1");
        assert_eq!(echo["contentType"], "application/json");
        assert_eq!(echo["contentLength"], encoded_len.to_string());
        assert_eq!(echo["body"], r#"{"forceNew":false}"#);
    }

    #[tokio::test]
    async fn raw_body_skips_content_type() {
        let server = spawn_server().await;
        let agent = connect(&server).await;

        let resp = agent
            .send(Method::POST, "/blob", RequestBody::Raw(b"hello".to_vec()))
            .await
            .unwrap();
        let echo: serde_json::Value = resp.json().unwrap();
        assert_eq!(echo["contentType"], serde_json::Value::Null);
        assert_eq!(echo["contentLength"], "5");
        assert_eq!(echo["body"], "hello");
    }

    #[tokio::test]
    async fn empty_body_has_no_length_header() {
        let server = spawn_server().await;
        let agent = connect(&server).await;

        let resp = agent
            .send(Method::GET, "/status", RequestBody::Empty)
            .await
            .unwrap();
        let echo: serde_json::Value = resp.json().unwrap();
        assert_eq!(echo["contentLength"], serde_json::Value::Null);
        assert_eq!(echo["authorization"], "Bearer tok-1");
    }

    #[tokio::test]
    async fn no_fault_means_no_reconnect() {
        let server = spawn_server().await;
        let agent = connect(&server).await;

        for _ in 0..3 {
            let resp = agent
                .send(Method::GET, "/ping", RequestBody::Empty)
                .await
                .unwrap();
            assert_eq!(resp.status, 200);
        }
        assert!(agent.is_healthy().await);
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_share_one_connection() {
        let server = spawn_server().await;
        let agent = Arc::new(connect(&server).await);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..4 {
            let agent = agent.clone();
            tasks.spawn(async move {
                agent
                    .send(Method::GET, &format!("/req/{i}"), RequestBody::Empty)
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn fault_repairs_on_next_send_exactly_once() {
        let server = spawn_server().await;
        let agent = connect(&server).await;

        // Ask the server to drop the connection after responding.
        let resp = agent
            .send(Method::GET, "/drop", RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        wait_unhealthy(&agent).await;
        assert_eq!(server.connections(), 1);

        // Next send re-establishes once, then issues the request.
        let resp = agent
            .send(Method::GET, "/after", RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(agent.is_healthy().await);
        assert_eq!(server.connections(), 2);

        // Further sends reuse the repaired connection.
        agent
            .send(Method::GET, "/again", RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let server = spawn_server().await;
        let agent = connect(&server).await;

        agent.close().await;
        let result = agent.send(Method::GET, "/late", RequestBody::Empty).await;
        assert!(matches!(result, Err(AgentError::Closed)));
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Agent::connect(Endpoint::insecure("127.0.0.1", port), "tok").await;
        assert!(matches!(result, Err(AgentError::Io(_))));
    }
}
