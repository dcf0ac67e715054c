//! Two-phase create/upload sync engine.
//!
//! `create` registers the content-addressed manifest and learns which
//! contents the service is missing; `upload` pushes those contents
//! concurrently, one task per hash, all multiplexed over the shared
//! transport. The create handshake is retried conservatively, each
//! upload leniently with jitter; a 403 on either phase stops that unit
//! of work immediately.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use nimbus_protocol::{CREATE_PATH, CreateRequest, CreateResponse, SYNC_PATH, SyncRequest};
use nimbus_retry::{RetryError, RetryPolicy, retry};

use crate::error::{DeployError, SyncFailure};
use crate::manifest::PackageManifest;
use crate::scanner;
use crate::store::{FileEntry, FileStore};
use crate::transport::Transport;
use crate::types::{DeploymentSession, SessionState, SyncEvent, SyncOptions, UploadedFile};

/// Orchestrates one deployment session.
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    options: SyncOptions,
    files: FileStore,
    session: Option<DeploymentSession>,
    state: SessionState,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Option<mpsc::Receiver<SyncEvent>>,
    sync_amount: OnceLock<u64>,
}

impl SyncEngine {
    /// Creates an engine over the given transport.
    pub fn new(transport: Arc<dyn Transport>, options: SyncOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            transport,
            options,
            files: FileStore::default(),
            session: None,
            state: SessionState::Idle,
            events_tx,
            events_rx: Some(events_rx),
            sync_amount: OnceLock::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.take()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session(&self) -> Option<&DeploymentSession> {
        self.session.as_ref()
    }

    /// The deployment URL, once `create` has succeeded.
    pub fn url(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.url.as_str())
    }

    /// Registers a deployment for the project at `path`.
    ///
    /// Validates the directory, loads `package.json`, lists and hashes
    /// the project files, then negotiates the missing set with the
    /// service. Returns the deployment URL.
    pub async fn create(&mut self, path: &Path) -> Result<String, DeployError> {
        if !path.is_dir() {
            return Err(DeployError::ProjectDir(path.to_path_buf()));
        }
        let manifest = PackageManifest::load(path)?;
        let listed = scanner::list_files(path, &manifest)?;
        debug!(files = listed.len(), "project files listed");
        self.files = FileStore::hash_files(&listed)?;
        debug!(entries = self.files.len(), "content hashed");

        self.set_state(SessionState::Creating).await;

        let body = serde_json::to_value(CreateRequest {
            force_new: self.options.force_new,
            files: self.files.descriptors(),
        })?;

        let transport = &self.transport;
        let outcome = retry(
            &self.options.create_retry,
            async |attempt| {
                let resp = match transport.post_json(CREATE_PATH, body.clone()).await {
                    Ok(resp) => resp,
                    Err(e) => return Err(RetryError::Transient(DeployError::Transport(e))),
                };
                match resp.status {
                    403 => Err(RetryError::Permanent(DeployError::Forbidden { status: 403 })),
                    200 => resp
                        .json::<CreateResponse>()
                        .map_err(|e| RetryError::Transient(DeployError::Json(e))),
                    status => {
                        debug!(status, attempt, "deployment initialization rejected");
                        Err(RetryError::Transient(DeployError::InitFailed))
                    }
                }
            },
            |err| warn!(error = %err, "retrying deployment creation"),
        )
        .await;

        let created = match outcome {
            Ok(created) => created,
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };

        // Only hashes the local store can serve are kept.
        let missing: HashSet<String> = created
            .missing
            .into_iter()
            .filter(|sha| {
                let known = self.files.contains(sha);
                if !known {
                    warn!(%sha, "server requested unknown content hash");
                }
                known
            })
            .collect();

        let session = DeploymentSession {
            id: created.deployment_id,
            url: created.url.clone(),
            missing,
            base_path: path.to_path_buf(),
        };
        info!(
            deployment = %session.id,
            missing = session.missing.len(),
            "deployment created"
        );
        self.session = Some(session);
        self.set_state(SessionState::Created).await;
        Ok(created.url)
    }

    /// Uploads every missing file concurrently over the shared transport.
    ///
    /// Tasks settle independently: a terminal failure in one file never
    /// cancels its siblings, and successful uploads are not rolled back.
    /// All succeed → `Complete` event; otherwise the aggregate error
    /// names every failed file.
    pub async fn upload(&mut self) -> Result<(), DeployError> {
        let Some(session) = self.session.as_ref() else {
            return Err(DeployError::NoSession);
        };
        let deployment_id = session.id.clone();
        let base_path = session.base_path.clone();
        let missing: Vec<String> = session.missing.iter().cloned().collect();

        // Snapshot before any task completes and shrinks the set.
        let total = self.sync_amount();
        debug!(files = missing.len(), bytes = total, "starting sync");

        self.set_state(SessionState::Syncing).await;

        let mut tasks = JoinSet::new();
        for sha in missing {
            let Some(entry) = self.files.get(&sha).cloned() else {
                continue;
            };
            let transport = self.transport.clone();
            let policy = self.options.upload_retry.clone();
            let events_tx = self.events_tx.clone();
            let deployment_id = deployment_id.clone();
            let file = relative_to(&entry.path, &base_path);
            tasks.spawn(async move {
                let result = sync_one(transport, policy, entry.clone(), file, deployment_id).await;
                if result.is_ok() {
                    let _ = events_tx.try_send(SyncEvent::Upload(UploadedFile {
                        sha: entry.sha.clone(),
                        path: entry.path.clone(),
                        size: entry.data.len() as u64,
                    }));
                }
                (entry, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((entry, Ok(()))) => {
                    if let Some(session) = self.session.as_mut() {
                        session.missing.remove(&entry.sha);
                    }
                    debug!(sha = %entry.sha, file = %entry.path.display(), "uploaded");
                }
                Ok((entry, Err(e))) => failures.push(SyncFailure {
                    sha: entry.sha.clone(),
                    path: entry.path.clone(),
                    error: e.to_string(),
                }),
                Err(join_err) => failures.push(SyncFailure {
                    sha: String::new(),
                    path: PathBuf::new(),
                    error: format!("sync task failed: {join_err}"),
                }),
            }
        }

        if failures.is_empty() {
            self.set_state(SessionState::Completed).await;
            let _ = self.events_tx.send(SyncEvent::Complete).await;
            info!("sync complete");
            Ok(())
        } else {
            let err = DeployError::Sync { failures };
            self.fail(&err).await;
            Err(err)
        }
    }

    /// Total byte length of all missing files' data.
    ///
    /// Memoized on first call after `create`: a snapshot of the missing
    /// set at that moment, not a live metric.
    pub fn sync_amount(&self) -> u64 {
        match self.session.as_ref() {
            None => 0,
            Some(session) => *self.sync_amount.get_or_init(|| {
                session
                    .missing
                    .iter()
                    .filter_map(|sha| self.files.get(sha))
                    .map(|entry| entry.data.len() as u64)
                    .sum()
            }),
        }
    }

    async fn set_state(&mut self, state: SessionState) {
        self.state = state.clone();
        let _ = self.events_tx.send(SyncEvent::StateChanged(state)).await;
    }

    async fn fail(&mut self, err: &DeployError) {
        warn!(error = %err, "deployment failed");
        self.set_state(SessionState::Failed).await;
        let _ = self.events_tx.send(SyncEvent::Error(err.to_string())).await;
    }
}

/// Uploads one file body under the lenient per-file retry schedule.
async fn sync_one(
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    entry: FileEntry,
    file: String,
    deployment_id: String,
) -> Result<(), DeployError> {
    let body = serde_json::to_value(SyncRequest {
        sha: entry.sha.clone(),
        data: String::from_utf8_lossy(&entry.data).into_owned(),
        file: file.clone(),
        deployment_id,
    })?;

    let policy: &'static RetryPolicy = Box::leak(Box::new(policy));
    retry(
        policy,
        move |_| {
            let transport = transport.clone();
            let body = body.clone();
            Box::pin(async move {
                let resp = match transport.post_json(SYNC_PATH, body).await {
                    Ok(resp) => resp,
                    Err(e) => return Err(RetryError::Transient(DeployError::Transport(e))),
                };
                match resp.status {
                    403 => Err(RetryError::Permanent(DeployError::Forbidden { status: 403 })),
                    // Any non-403 exchange counts as success.
                    _ => Ok(()),
                }
            }) as Pin<Box<dyn Future<Output = Result<(), RetryError<DeployError>>> + Send>>
        },
        move |_err| { let _ = &file; },
    )
    .await
}

/// Strips the deployment base from an absolute path, tolerating a base
/// given with or without a trailing separator. Separators normalize to
/// `/` on every platform.
fn relative_to(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}
