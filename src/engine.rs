//! Download engine - main coordinator
//!
//! The `DownloadEngine` is the primary entry point for the library. It owns
//! every session, the shared transport, the checkpoint store and the
//! listener set, and runs one retry-driver task per active handle.
//!
//! Event ordering per handle: exactly one `Queued`, at most one `Started`
//! per lifecycle, interleaved `Progress`/`Retry`, balanced
//! `Paused`/`Resumed` pairs, then exactly one terminal event.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::fetcher::{self, ChunkStateTable, FetchContext};
use crate::integrity::IntegrityVerifier;
use crate::progress::ProgressAggregator;
use crate::resolver::StorageResolver;
use crate::scheduler::Scheduler;
use crate::transport::Transport;
use crate::types::{
    ChunkState, DownloadEvent, DownloadHandle, DownloadListener, DownloadProgress,
    DownloadRequest, DownloadStatus, FailureInfo, PausedSnapshot, StorageResolution,
};

/// Maximum number of events to buffer for subscribers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Coalescing window for durable checkpoint writes
const CHECKPOINT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// How long shutdown waits for each driver task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Why a session's task tree is being cancelled. Set before the token
/// fires so the driver can tell pause from stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Running,
    PauseRequested,
    StopRequested,
}

/// In-memory state of one managed download
struct Session {
    handle: DownloadHandle,
    request: DownloadRequest,
    resolution: StorageResolution,
    states: Arc<ChunkStateTable>,
    status: DownloadStatus,
    reason: StopReason,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Session {
    fn new(handle: DownloadHandle, request: DownloadRequest, resolution: StorageResolution) -> Self {
        Self {
            handle,
            request,
            resolution,
            states: Arc::new(ChunkStateTable::new()),
            status: DownloadStatus::Queued,
            reason: StopReason::Running,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    fn snapshot(&self) -> PausedSnapshot {
        PausedSnapshot {
            handle_id: self.handle.id.clone(),
            request: self.request.clone(),
            resolution: self.resolution.clone(),
            completed_bytes: self.states.completed_bytes(),
            chunk_states: self.states.snapshot(),
        }
    }
}

/// The main download engine
pub struct DownloadEngine {
    /// Weak self-reference for spawning background tasks from `&self`
    self_ref: Weak<Self>,

    config: EngineConfig,

    transport: Arc<Transport>,

    resolver: StorageResolver,

    checkpoints: Arc<CheckpointStore>,

    verifier: Arc<IntegrityVerifier>,

    /// All managed downloads, keyed by handle id
    sessions: RwLock<HashMap<String, Session>>,

    /// Delayed-enqueue collaborator
    scheduler: Scheduler,

    /// Event broadcaster (listeners get the same stream synchronously)
    event_tx: broadcast::Sender<DownloadEvent>,

    shutdown: CancellationToken,
}

impl DownloadEngine {
    /// Create a new download engine with the given configuration.
    ///
    /// The configuration is persisted to the state directory so host
    /// schedulers can recreate the engine after process death.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(Transport::new(&config)?);

        let state_base = config.effective_state_dir();
        let checkpoints = Arc::new(CheckpointStore::new(&state_base));
        checkpoints.save_config(&config);

        let resolver = StorageResolver::new(config.storage.clone(), state_base);
        let verifier = Arc::new(IntegrityVerifier::new(
            config.integrity.clone(),
            config.signature_verifier.clone(),
        ));

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            transport,
            resolver,
            checkpoints,
            verifier,
            sessions: RwLock::new(HashMap::new()),
            scheduler: Scheduler::new(),
            event_tx,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Load the configuration a previous process persisted under
    /// `state_dir`, if any
    pub fn persisted_config(state_dir: &Path) -> Option<EngineConfig> {
        CheckpointStore::new(state_dir).load_config()
    }

    /// Obtain a strong `Arc<Self>` for spawning background tasks
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| DownloadError::permanent("engine is shutting down"))
    }

    /// Subscribe to the engine's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Enqueue a download. Storage is resolved synchronously; a matching
    /// paused snapshot (same request id) is replayed so the download
    /// resumes where it left off, even across a process restart.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(&request.id) {
                if !existing.status.is_terminal() {
                    return Err(DownloadError::permanent(format!(
                        "download {} is already registered",
                        request.id
                    )));
                }
            }
        }

        let handle = DownloadHandle::new(&request);
        self.emit(DownloadEvent::Queued {
            handle: handle.clone(),
        });

        if let Err(error) = validate_url(&request.url) {
            self.emit(DownloadEvent::Failed {
                handle: handle.clone(),
                error: FailureInfo::from(&error),
            });
            return Err(error);
        }

        // A live snapshot means a partial file we must not clobber: reuse
        // its resolution instead of re-running the resolver (which would
        // apply the overwrite policy to our own partial output).
        let snapshot = self.checkpoints.load_paused_snapshot(&request.id);
        let resolution = match &snapshot {
            Some(snap) if snap.resolution.file.exists() => snap.resolution.clone(),
            _ => match self.resolver.resolve(&request, false) {
                Ok(resolution) => resolution,
                Err(error) => {
                    self.emit(DownloadEvent::Failed {
                        handle: handle.clone(),
                        error: FailureInfo::from(&error),
                    });
                    return Err(error);
                }
            },
        };

        let (start_offset, prior_states) = match &snapshot {
            Some(snap) => clamp_to_disk(snap),
            None => (0, Vec::new()),
        };

        self.sessions.write().insert(
            request.id.clone(),
            Session::new(handle.clone(), request.clone(), resolution),
        );

        self.spawn_driver(&request.id, start_offset, prior_states, false)?;

        Ok(handle)
    }

    /// Pause a download: persist a fresh snapshot, then tear down the task
    /// tree. No terminal event is emitted; `Paused` is.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let (handle, snapshot, cancel, task) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            if !session.status.is_active() {
                return Err(DownloadError::permanent(
                    "only an active download can be paused",
                ));
            }
            session.reason = StopReason::PauseRequested;
            session.status = DownloadStatus::Paused;
            (
                session.handle.clone(),
                session.snapshot(),
                session.cancel.clone(),
                session.task.take(),
            )
        };

        // Snapshot must be durable before cancellation returns
        self.checkpoints.save_paused_snapshot(&snapshot);

        cancel.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.emit(DownloadEvent::Paused { handle });
        Ok(())
    }

    /// Resume a paused download, in-process or after a restart. Fetchers
    /// pick up at each chunk's persisted `next_offset`.
    pub async fn resume(&self, id: &str) -> Result<DownloadHandle> {
        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(id) {
                if session.status != DownloadStatus::Paused {
                    return Err(DownloadError::permanent(
                        "only a paused download can be resumed",
                    ));
                }
            }
        }

        let snapshot = self
            .checkpoints
            .load_paused_snapshot(id)
            .or_else(|| self.sessions.read().get(id).map(Session::snapshot))
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let (start_offset, prior_states) = clamp_to_disk(&snapshot);

        let handle = DownloadHandle {
            id: snapshot.handle_id.clone(),
            source_url: snapshot.request.url.clone(),
        };

        {
            let mut sessions = self.sessions.write();
            let session = sessions.entry(id.to_string()).or_insert_with(|| {
                Session::new(
                    handle.clone(),
                    snapshot.request.clone(),
                    snapshot.resolution.clone(),
                )
            });
            session.request = snapshot.request.clone();
            session.resolution = snapshot.resolution.clone();
            session.states = Arc::new(ChunkStateTable::new());
            session.reason = StopReason::Running;
            session.cancel = CancellationToken::new();
            session.status = DownloadStatus::Running {
                progress: DownloadProgress::default(),
            };
        }

        self.emit(DownloadEvent::Resumed {
            handle: handle.clone(),
        });

        self.spawn_driver(id, start_offset, prior_states, true)?;

        Ok(handle)
    }

    /// Stop a download: cancel its task tree, delete its snapshot and emit
    /// the terminal `Cancelled`. The partial file is left on disk; cleanup
    /// is the caller's responsibility.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let (handle, cancel, task) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            if session.status.is_terminal() {
                return Err(DownloadError::permanent("download already finished"));
            }
            session.reason = StopReason::StopRequested;
            let task = session.task.take();
            if task.is_none() {
                session.status = DownloadStatus::Cancelled;
            }
            (session.handle.clone(), session.cancel.clone(), task)
        };

        cancel.cancel();
        self.checkpoints.remove_paused_snapshot(id);

        match task {
            Some(task) => {
                // The driver observes StopRequested and emits `Cancelled`
                let _ = task.await;
            }
            None => self.emit(DownloadEvent::Cancelled { handle }),
        }
        Ok(())
    }

    /// Hand a request to the scheduling collaborator for a delayed enqueue
    pub fn schedule(&self, request: DownloadRequest, when: DateTime<Utc>) -> Result<DownloadHandle> {
        let handle = DownloadHandle::new(&request);
        self.scheduler.schedule(self.self_ref.clone(), request, when);
        Ok(handle)
    }

    /// Cancel a scheduled (not yet enqueued) download
    pub fn cancel_scheduled(&self, id: &str) -> bool {
        self.scheduler.cancel(id)
    }

    /// Storage planning without side effects, for UI preview
    pub fn preview_destination(&self, request: &DownloadRequest) -> Result<StorageResolution> {
        self.resolver.resolve(request, true)
    }

    /// Current status of a download
    pub fn status(&self, id: &str) -> Option<DownloadStatus> {
        self.sessions.read().get(id).map(|s| s.status.clone())
    }

    /// Handles of all known sessions
    pub fn list(&self) -> Vec<DownloadHandle> {
        self.sessions.read().values().map(|s| s.handle.clone()).collect()
    }

    /// Handles of sessions that are queued or running
    pub fn active(&self) -> Vec<DownloadHandle> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.status.is_active())
            .map(|s| s.handle.clone())
            .collect()
    }

    /// Snapshots restorable from disk (e.g. after a process restart)
    pub fn paused_snapshots(&self) -> Vec<PausedSnapshot> {
        self.checkpoints.load_all_paused_snapshots()
    }

    /// Graceful shutdown: cancel every session's task tree and pending
    /// scheduled jobs
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();

        let tasks: Vec<(CancellationToken, Option<JoinHandle<()>>)> = {
            let mut sessions = self.sessions.write();
            sessions
                .values_mut()
                .map(|s| (s.cancel.clone(), s.task.take()))
                .collect()
        };

        for (cancel, task) in tasks {
            cancel.cancel();
            if let Some(task) = task {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, task).await;
            }
        }
    }

    // ---- internals -------------------------------------------------------

    fn spawn_driver(
        &self,
        id: &str,
        start_offset: u64,
        prior_states: Vec<ChunkState>,
        resumed: bool,
    ) -> Result<()> {
        let engine = self.arc()?;
        let id_owned = id.to_string();
        let task = tokio::spawn(async move {
            engine
                .run_download_with_retry(id_owned, start_offset, prior_states, resumed)
                .await;
        });

        if let Some(session) = self.sessions.write().get_mut(id) {
            session.task = Some(task);
        }
        Ok(())
    }

    /// The retry driver: one task per handle lifecycle. Network failures
    /// resume from the current checkpoints; integrity failures delete the
    /// file and restart from byte zero; storage and permanent failures are
    /// terminal.
    async fn run_download_with_retry(
        self: Arc<Self>,
        id: String,
        mut start_offset: u64,
        mut prior_states: Vec<ChunkState>,
        resumed: bool,
    ) {
        let (handle, request, resolution, cancel, states) = {
            let sessions = self.sessions.read();
            let Some(session) = sessions.get(&id) else { return };
            (
                session.handle.clone(),
                session.request.clone(),
                session.resolution.clone(),
                session.cancel.clone(),
                Arc::clone(&session.states),
            )
        };

        if !resumed {
            self.emit(DownloadEvent::Started {
                handle: handle.clone(),
            });
        }
        self.set_status(
            &id,
            DownloadStatus::Running {
                progress: DownloadProgress::default(),
            },
        );

        let dirty = Arc::new(Notify::new());
        let flusher = Self::spawn_checkpoint_flusher(
            Arc::clone(&self),
            id.clone(),
            Arc::clone(&dirty),
            cancel.clone(),
        );

        let retry = self.config.retry.clone();
        let mut attempt: u32 = 1;
        let mut delay_ms = retry.initial_delay_ms;

        let terminal: Option<DownloadError> = loop {
            // Seed the aggregator with what is already on disk for this
            // attempt: the checkpoint totals when resuming mid-file, the
            // caller's offset otherwise.
            let seed = if prior_states.is_empty() {
                start_offset
            } else {
                ChunkState::total_completed(&prior_states)
            };
            let aggregator = Arc::new(ProgressAggregator::new(seed));

            let on_progress: Arc<dyn Fn(DownloadProgress) + Send + Sync> = {
                let engine = Arc::clone(&self);
                let handle = handle.clone();
                let id = id.clone();
                Arc::new(move |progress: DownloadProgress| {
                    engine.set_status(
                        &id,
                        DownloadStatus::Running {
                            progress: progress.clone(),
                        },
                    );
                    engine.emit(DownloadEvent::Progress {
                        handle: handle.clone(),
                        progress,
                    });
                })
            };

            let ctx = FetchContext {
                transport: Arc::clone(&self.transport),
                request: request.clone(),
                resolution: resolution.clone(),
                chunking: self.config.chunking.clone(),
                states: Arc::clone(&states),
                aggregator: Arc::clone(&aggregator),
                cancel: cancel.clone(),
                checkpoint_dirty: Arc::clone(&dirty),
                on_progress,
            };

            let error = match fetcher::run(ctx, start_offset, &prior_states).await {
                Ok(outcome) => {
                    let report = self
                        .verifier
                        .verify(
                            &resolution.file,
                            &request,
                            outcome.total_bytes,
                            outcome.content_type.as_deref(),
                        )
                        .await;
                    for warning in &report.warnings {
                        tracing::warn!("Download {}: {}", id, warning);
                    }
                    if report.ok() {
                        break None;
                    }
                    DownloadError::Integrity {
                        failures: report.failures,
                    }
                }
                Err(error) => error,
            };

            match &error {
                DownloadError::Cancelled => break Some(error),
                DownloadError::Integrity { .. } => {
                    // Restart from zero: the artifact cannot be trusted
                    let _ = tokio::fs::remove_file(&resolution.file).await;
                    prior_states = Vec::new();
                    start_offset = 0;
                    if attempt >= retry.max_attempts {
                        break Some(error);
                    }
                }
                DownloadError::Network { .. } => {
                    // Resume where we are: checkpoints stay authoritative
                    let current = states.snapshot();
                    if !current.is_empty() {
                        prior_states = current;
                    }
                    if attempt >= retry.max_attempts {
                        break Some(error);
                    }
                }
                _ => break Some(error),
            }

            tracing::debug!(
                "Download {} attempt {} failed ({}), retrying in {} ms",
                id,
                attempt,
                error,
                delay_ms
            );
            self.emit(DownloadEvent::Retry {
                handle: handle.clone(),
                attempt,
            });

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.cancelled() => break Some(DownloadError::Cancelled),
            }
            delay_ms = retry.next_delay_ms(delay_ms);
            attempt += 1;
        };

        // The flusher must be fully stopped before the snapshot's fate is
        // decided, or a late write could resurrect a removed file.
        flusher.abort();
        let _ = flusher.await;

        match terminal {
            None => {
                self.checkpoints.remove_paused_snapshot(&id);
                self.set_status(
                    &id,
                    DownloadStatus::Completed {
                        file: resolution.file.clone(),
                    },
                );
                self.emit(DownloadEvent::Completed { handle });
            }
            Some(DownloadError::Cancelled) => match self.session_reason(&id) {
                Some(StopReason::PauseRequested) => {
                    // pause() persisted the snapshot and emits `Paused`;
                    // nothing terminal happens here
                }
                Some(StopReason::Running) if self.shutdown.is_cancelled() => {
                    // Engine teardown, not a user stop: flush a final
                    // snapshot so the download is resumable after restart
                    self.persist_running_snapshot(&id);
                }
                _ => {
                    self.checkpoints.remove_paused_snapshot(&id);
                    self.set_status(&id, DownloadStatus::Cancelled);
                    self.emit(DownloadEvent::Cancelled { handle });
                }
            },
            Some(error) => {
                let info = FailureInfo::from(&error);
                self.set_status(
                    &id,
                    DownloadStatus::Failed {
                        error: info.clone(),
                    },
                );
                self.emit(DownloadEvent::Failed {
                    handle,
                    error: info,
                });
            }
        }
    }

    /// Coalesces checkpoint writes: at most one durable snapshot per
    /// session per flush interval, however chatty the fetchers are.
    fn spawn_checkpoint_flusher(
        engine: Arc<Self>,
        id: String,
        dirty: Arc<Notify>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dirty.notified() => {}
                    _ = cancel.cancelled() => break,
                }
                tokio::time::sleep(CHECKPOINT_FLUSH_INTERVAL).await;
                engine.persist_running_snapshot(&id);
            }
        })
    }

    /// Durable snapshot of a session that is still running undisturbed.
    /// Pause and stop manage the snapshot themselves.
    fn persist_running_snapshot(&self, id: &str) {
        let snapshot = {
            let sessions = self.sessions.read();
            sessions
                .get(id)
                .filter(|s| s.reason == StopReason::Running && s.status.is_active())
                .map(Session::snapshot)
        };
        if let Some(snapshot) = snapshot {
            if !snapshot.chunk_states.is_empty() {
                self.checkpoints.save_paused_snapshot(&snapshot);
            }
        }
    }

    fn session_reason(&self, id: &str) -> Option<StopReason> {
        self.sessions.read().get(id).map(|s| s.reason)
    }

    fn set_status(&self, id: &str, status: DownloadStatus) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(id) {
            // A progress update racing a pause/stop must not revive the
            // session
            if matches!(status, DownloadStatus::Running { .. }) && !session.status.is_active() {
                return;
            }
            session.status = status;
        }
    }

    /// Deliver an event to the broadcast channel and every configured
    /// listener. A panicking listener is isolated and logged.
    fn emit(&self, event: DownloadEvent) {
        let _ = self.event_tx.send(event.clone());
        for listener in &self.config.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(listener.as_ref(), &event)));
            if outcome.is_err() {
                tracing::warn!(
                    "Listener panicked handling an event for {}; ignoring",
                    event.handle().id
                );
            }
        }
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for session in self.sessions.read().values() {
            session.cancel.cancel();
        }
    }
}

/// Route an event variant to the matching listener callback
fn dispatch(listener: &dyn DownloadListener, event: &DownloadEvent) {
    match event {
        DownloadEvent::Queued { handle } => listener.on_queued(handle),
        DownloadEvent::Started { handle } => listener.on_started(handle),
        DownloadEvent::Progress { handle, progress } => listener.on_progress(handle, progress),
        DownloadEvent::Paused { handle } => listener.on_paused(handle),
        DownloadEvent::Resumed { handle } => listener.on_resumed(handle),
        DownloadEvent::Retry { handle, attempt } => listener.on_retry(handle, *attempt),
        DownloadEvent::Completed { handle } => listener.on_completed(handle),
        DownloadEvent::Failed { handle, error } => listener.on_failed(handle, error),
        DownloadEvent::Cancelled { handle } => listener.on_cancelled(handle),
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed =
        Url::parse(url).map_err(|e| DownloadError::permanent(format!("malformed URL: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(DownloadError::permanent(format!(
            "unsupported URL scheme: {}",
            scheme
        ))),
    }
}

/// Reconcile a snapshot with what is actually on disk. A missing file
/// restarts from scratch; a truncated file clamps `completedBytes` and the
/// per-chunk offsets so the planner never sees inverted ranges.
fn clamp_to_disk(snapshot: &PausedSnapshot) -> (u64, Vec<ChunkState>) {
    let file_len = match std::fs::metadata(&snapshot.resolution.file) {
        Ok(metadata) => metadata.len(),
        Err(_) => return (0, Vec::new()),
    };

    let states: Vec<ChunkState> = snapshot
        .chunk_states
        .iter()
        .map(|s| ChunkState {
            next_offset: s.next_offset.min(file_len).max(s.start),
            ..*s
        })
        .collect();

    (snapshot.completed_bytes.min(file_len), states)
}
