use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Download engine orchestrator
///
/// Owns every other component and drives the canonical state machine.
/// One parent task per active download owns its chunk workers through a
/// JoinSet, so cancelling the parent cancels the children; session
/// tokens make any callback that outlives a pause/cancel a no-op.
use crate::config::EngineConfig;
use crate::core::assembler;
use crate::core::breaker::BreakerRegistry;
use crate::core::concurrency::ConcurrencyController;
use crate::core::error::EngineError;
use crate::core::events::{ChunkProgress, EngineEvent, EventBus, ExistingFileInfo};
use crate::core::integrity::{self, Expected};
use crate::core::scheduler::{self, QueuedItem, ScheduleContext, ScheduleWeights};
use crate::core::session::{SessionManager, SessionToken};
use crate::core::speed::SpeedTracker;
use crate::core::state::{DownloadState, AWAIT_OVERWRITE};
use crate::core::store::{StateStore, TransitionOpts};
use crate::core::types::{
    AddRequest, Attempt, Chunk, Download, Priority, QueueSummary, Snapshot, TransferMode,
};
use crate::core::workers::WorkerPool;
use crate::network::chunked::{self, ChunkContext, ChunkDeps, ChunkRun};
use crate::network::planner;
use crate::network::probe;
use crate::core::limiter::RateLimiters;
use crate::network::client;
use crate::network::simple::{self, SimpleJob};
use crate::utils::filesystem;

/// Idle tick cadence; add/resume/finish nudge it early
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks between adaptive-concurrency and compaction passes
const SLOW_PASS_EVERY: u64 = 10;

/// Handles of one in-flight download, removed only by the engine's own
/// control paths
struct ActiveDownload {
    #[allow(dead_code)]
    session: SessionToken,
    parent: tokio::task::JoinHandle<()>,
    host: String,
    /// Confirmed payload bytes, fed by the transfer tasks
    bytes: Arc<AtomicU64>,
    /// Stops a merge running on a pool worker
    cancel_merge: Arc<AtomicBool>,
}

/// Wire shape of `session_metrics`
#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub by_host: HashMap<String, usize>,
    pub circuit_states: HashMap<String, &'static str>,
    pub current_bps: u64,
    pub active_downloads: usize,
    pub state_version: u64,
}

/// Wire shape of `debug(id)`
#[derive(Debug, Serialize)]
pub struct DebugDump {
    pub download: Download,
    pub chunks: Vec<Chunk>,
    pub attempts: Vec<Attempt>,
}

pub struct DownloadEngine {
    config: EngineConfig,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    breakers: Arc<BreakerRegistry>,
    limiters: RateLimiters,
    speed: Arc<SpeedTracker>,
    controller: Arc<ConcurrencyController>,
    workers: Arc<WorkerPool>,
    client: reqwest::Client,
    active: Mutex<HashMap<i64, ActiveDownload>>,
    /// Ids handed to a start task but not yet out of QUEUED
    starting: Mutex<HashSet<i64>>,
    /// Overwrites the user approved, consumed by the next start
    overwrite_approved: Mutex<HashSet<i64>>,
    tick: Notify,
    shutdown: AtomicBool,
}

impl DownloadEngine {
    /// Build the engine and start its background tick; must run inside a
    /// tokio runtime
    pub fn new(config: EngineConfig, state_db: &Path) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        let store = Arc::new(StateStore::open(state_db)?);
        Self::with_store(config, store)
    }

    /// Build the engine with its database in `data_dir`
    pub fn open_in(config: EngineConfig, data_dir: &Path) -> Result<Arc<Self>, EngineError> {
        std::fs::create_dir_all(data_dir)?;
        Self::new(config, &data_dir.join(crate::core::store::STATE_DB_FILE))
    }

    fn with_store(config: EngineConfig, store: Arc<StateStore>) -> Result<Arc<Self>, EngineError> {
        let recovered = store.recover_interrupted()?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted downloads as paused");
        }

        let client = client::create_client(&config)?;
        let engine = Arc::new(Self {
            store,
            bus: Arc::new(EventBus::new()),
            sessions: Arc::new(SessionManager::new()),
            breakers: Arc::new(BreakerRegistry::new(&config)),
            limiters: RateLimiters::new(&config),
            speed: Arc::new(SpeedTracker::new()),
            controller: Arc::new(ConcurrencyController::new(&config)),
            workers: Arc::new(WorkerPool::new(
                config.workers_min,
                config.effective_workers_max(),
            )),
            client,
            active: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            overwrite_approved: Mutex::new(HashSet::new()),
            tick: Notify::new(),
            shutdown: AtomicBool::new(false),
            config,
        });

        let ticker = engine.clone();
        tokio::spawn(async move {
            ticker.run_ticks().await;
        });

        info!("Download engine started");
        Ok(engine)
    }

    #[cfg(test)]
    pub(crate) fn with_store_for_test(config: EngineConfig, store: Arc<StateStore>) -> Arc<Self> {
        Self::with_store(config, store).unwrap()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Rate limiter shared with the request boundary
    pub fn limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Validate and enqueue a download request
    pub fn add(&self, req: AddRequest) -> Result<i64, EngineError> {
        self.ensure_running()?;
        let url = url::Url::parse(&req.url)
            .map_err(|e| EngineError::Validation(format!("bad url: {e}")))?;
        if url.scheme() != "https" {
            return Err(EngineError::Validation(format!(
                "only https urls are accepted, got {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Validation("url has no host".to_string()))?;
        if !self.config.host_allowed(host) {
            return Err(EngineError::Validation(format!(
                "host not in allow-list: {host}"
            )));
        }
        filesystem::validate_save_path(Path::new(&req.save_path))?;

        let id = self.store.add(&req)?;
        self.notify_version();
        info!(download_id = id, url = %req.url, "Download queued");
        self.tick.notify_one();
        Ok(id)
    }

    /// Pause one download; parts stay on disk
    pub fn pause(&self, id: i64) -> Result<(), EngineError> {
        let current = self.store.get(id)?;
        if !current.state.can_transition(DownloadState::Paused) {
            return Err(EngineError::State(format!(
                "cannot pause download in state {}",
                current.state.as_str()
            )));
        }
        // invalidate before the transition so a start task racing us
        // bails at its session check instead of resurrecting the row
        self.sessions.invalidate(id);
        self.transition(id, DownloadState::Paused, TransitionOpts::default())?;
        self.teardown_run(id, current.state == DownloadState::Downloading);
        info!(download_id = id, "Download paused");
        Ok(())
    }

    pub fn pause_all(&self) -> Result<usize, EngineError> {
        let mut paused = 0;
        for state in [
            DownloadState::Queued,
            DownloadState::Starting,
            DownloadState::Downloading,
        ] {
            for d in self.store.list_by_state(state, usize::MAX)? {
                if self.pause(d.id).is_ok() {
                    paused += 1;
                }
            }
        }
        Ok(paused)
    }

    /// Re-queue a paused download; the scheduler picks it up
    pub fn resume(&self, id: i64) -> Result<(), EngineError> {
        self.ensure_running()?;
        let current = self.store.get(id)?;
        if !current.state.can_resume() {
            return Err(EngineError::State(format!(
                "cannot resume download in state {}",
                current.state.as_str()
            )));
        }
        self.transition(id, DownloadState::Queued, TransitionOpts::default())?;
        self.tick.notify_one();
        Ok(())
    }

    pub fn resume_all(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for d in self.store.list_by_state(DownloadState::Paused, usize::MAX)? {
            if self.resume(d.id).is_ok() {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Cancel a download and delete its on-disk artifacts
    pub fn cancel(&self, id: i64) -> Result<(), EngineError> {
        let download = self.store.get(id)?;
        if !download.state.can_transition(DownloadState::Cancelled) {
            return Err(EngineError::State(format!(
                "cannot cancel download in state {}",
                download.state.as_str()
            )));
        }
        self.sessions.invalidate(id);
        self.transition(id, DownloadState::Cancelled, TransitionOpts::default())?;
        self.teardown_run(id, false);
        filesystem::cleanup_artifacts(Path::new(&download.save_path));
        self.overwrite_approved.lock().unwrap().remove(&id);
        info!(download_id = id, "Download cancelled");
        self.tick.notify_one();
        Ok(())
    }

    pub fn cancel_all(&self) -> Result<usize, EngineError> {
        let mut cancelled = 0;
        for state in [
            DownloadState::Queued,
            DownloadState::Starting,
            DownloadState::Downloading,
            DownloadState::Paused,
            DownloadState::Merging,
            DownloadState::Verifying,
            DownloadState::Failed,
        ] {
            for d in self.store.list_by_state(state, usize::MAX)? {
                if self.cancel(d.id).is_ok() {
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    /// Re-queue a failed download; completed chunks are kept
    pub fn retry(&self, id: i64) -> Result<(), EngineError> {
        self.ensure_running()?;
        let current = self.store.get(id)?;
        if current.state != DownloadState::Failed {
            return Err(EngineError::State(format!(
                "retry applies to failed downloads, not {}",
                current.state.as_str()
            )));
        }
        self.store.reset_incomplete_chunks(id)?;
        self.transition(id, DownloadState::Queued, TransitionOpts::default())?;
        self.tick.notify_one();
        Ok(())
    }

    /// Delete a settled download and its artifacts
    pub fn remove(&self, id: i64) -> Result<(), EngineError> {
        let download = self.store.get(id)?;
        self.store.remove(id)?;
        self.notify_version();
        // a completed download keeps its final file; only staging leftovers go
        filesystem::cleanup_artifacts(Path::new(&download.save_path));
        info!(download_id = id, "Download removed");
        Ok(())
    }

    /// Resolve a pending overwrite confirmation
    pub fn confirm_overwrite(&self, id: i64, accept: bool) -> Result<(), EngineError> {
        let download = self.store.get(id)?;
        if download.state != DownloadState::Paused
            || download.error_code.as_deref() != Some(AWAIT_OVERWRITE)
        {
            return Err(EngineError::State(format!(
                "download {id} is not awaiting overwrite confirmation"
            )));
        }
        if accept {
            self.overwrite_approved.lock().unwrap().insert(id);
            self.transition(id, DownloadState::Queued, TransitionOpts::default())?;
            self.tick.notify_one();
            info!(download_id = id, "Overwrite accepted, re-queued");
        } else {
            self.transition(id, DownloadState::Cancelled, TransitionOpts::default())?;
            filesystem::cleanup_artifacts(Path::new(&download.save_path));
            info!(download_id = id, "Overwrite declined, cancelled");
        }
        Ok(())
    }

    pub fn set_priority(&self, id: i64, priority: Priority) -> Result<(), EngineError> {
        let current = self.store.get(id)?;
        if !matches!(
            current.state,
            DownloadState::Queued | DownloadState::Paused | DownloadState::Failed
        ) {
            return Err(EngineError::State(format!(
                "priority is fixed once a download is {}",
                current.state.as_str()
            )));
        }
        self.store.set_priority(id, priority)?;
        self.notify_version();
        self.tick.notify_one();
        Ok(())
    }

    pub fn snapshot(&self, min_version: Option<u64>) -> Result<Option<Snapshot>, EngineError> {
        self.store.snapshot(min_version)
    }

    pub fn list(
        &self,
        state: DownloadState,
        limit: usize,
    ) -> Result<Vec<Download>, EngineError> {
        self.store.list_by_state(state, limit)
    }

    pub fn summary(&self) -> Result<QueueSummary, EngineError> {
        self.store.summary()
    }

    pub fn session_metrics(&self) -> SessionMetrics {
        let by_host = {
            let active = self.active.lock().unwrap();
            let mut map: HashMap<String, usize> = HashMap::new();
            for entry in active.values() {
                *map.entry(entry.host.clone()).or_insert(0) += 1;
            }
            map
        };
        SessionMetrics {
            by_host,
            circuit_states: self.breakers.states().into_iter().collect(),
            current_bps: self.speed.aggregate_bps(),
            active_downloads: self.controller.active_downloads(),
            state_version: self.store.current_version(),
        }
    }

    /// Structured dump of one download for diagnosis
    pub fn debug(&self, id: i64) -> Result<DebugDump, EngineError> {
        Ok(DebugDump {
            download: self.store.get(id)?,
            chunks: self.store.get_chunks(id)?,
            attempts: self.store.get_attempts(id)?,
        })
    }

    /// Stop everything: scheduler, transfers, pool, breakers
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Engine shutting down");
        self.tick.notify_one();

        let entries: Vec<(i64, ActiveDownload)> = {
            let mut active = self.active.lock().unwrap();
            active.drain().collect()
        };
        let mut flush = Vec::new();
        for (id, entry) in entries {
            self.sessions.invalidate(id);
            entry.cancel_merge.store(true, Ordering::SeqCst);
            entry.parent.abort();
            flush.push((id, entry.bytes.load(Ordering::Relaxed)));
            let _ = self
                .store
                .set_state(id, DownloadState::Paused, TransitionOpts::default());
            self.checkpoint_chunks(id);
            self.controller.release(id);
        }
        if let Err(e) = self.store.batch_update_progress(&flush) {
            warn!(error = %e, "Final progress flush failed");
        }
        self.sessions.invalidate_all();
        self.workers.shutdown();
        self.breakers.clear();
        self.notify_version();
        info!("Engine shut down");
    }

    // ------------------------------------------------------------------
    // Tick loop
    // ------------------------------------------------------------------

    async fn run_ticks(self: Arc<Self>) {
        let mut iteration = 0u64;
        loop {
            tokio::select! {
                _ = self.tick.notified() => {}
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            iteration += 1;

            self.sweep_finished();
            self.flush_progress();
            if iteration % SLOW_PASS_EVERY == 0 {
                self.controller.adapt_all();
                self.limiters.compact();
            }
            if let Err(e) = self.schedule_starts() {
                warn!(error = %e, "Scheduling pass failed");
            }
        }
    }

    /// Drop registry entries whose parent task already returned
    fn sweep_finished(&self) {
        let mut active = self.active.lock().unwrap();
        active.retain(|_, entry| !entry.parent.is_finished());
    }

    /// Durable + observable progress for every active download
    fn flush_progress(&self) {
        let snapshot: Vec<(i64, u64)> = {
            let active = self.active.lock().unwrap();
            active
                .iter()
                .map(|(id, entry)| (*id, entry.bytes.load(Ordering::Relaxed)))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        // batched write rides a pool worker; inline if the pool is gone
        let store = self.store.clone();
        let updates = snapshot.clone();
        let submitted = self.workers.submit("progress-flush", move || {
            store.batch_update_progress(&updates)?;
            Ok(())
        });
        if submitted.is_err() {
            if let Err(e) = self.store.batch_update_progress(&snapshot) {
                warn!(error = %e, "Inline progress flush failed");
            }
        }
        self.notify_version();

        for (id, bytes) in snapshot {
            self.speed.record(id, bytes);
            if let Some(slots) = self.controller.slots(id) {
                slots.record_progress(bytes);
            }
            let Ok(download) = self.store.get(id) else { continue };
            if download.state != DownloadState::Downloading {
                continue;
            }
            let chunk_progress = if download.mode == Some(TransferMode::Chunked) {
                self.store.get_chunks(id).ok().map(|chunks| {
                    chunks
                        .iter()
                        .map(|c| ChunkProgress {
                            chunk_index: c.chunk_index,
                            written_bytes: c.written_bytes,
                            range_len: c.range_len(),
                        })
                        .collect::<Vec<_>>()
                })
            } else {
                None
            };
            let percent = match download.total_bytes {
                Some(total) if total > 0 => (bytes as f64 / total as f64) * 100.0,
                _ => 0.0,
            };
            self.bus.emit_progress(EngineEvent::DownloadProgress {
                id,
                bytes,
                percent,
                speed_bps: self.speed.current_bps(id),
                eta_s: self.speed.eta_seconds(id, bytes, download.total_bytes),
                chunk_progress,
            });
        }
    }

    /// One scheduling pass: pick queued ids and launch their start tasks
    fn schedule_starts(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        let queued = self.store.list_by_state(DownloadState::Queued, 256)?;
        if queued.is_empty() {
            return Ok(());
        }

        let items: Vec<QueuedItem> = queued
            .iter()
            .filter_map(|d| {
                Some(QueuedItem {
                    id: d.id,
                    host: probe::host_of(&d.url)?,
                    priority: d.priority,
                    created_at: d.created_at,
                })
            })
            .collect();

        let ctx = {
            let active = self.active.lock().unwrap();
            let starting = self.starting.lock().unwrap();
            let mut active_per_host: HashMap<String, usize> = HashMap::new();
            for entry in active.values() {
                *active_per_host.entry(entry.host.clone()).or_insert(0) += 1;
            }
            ScheduleContext {
                free_slots: self.controller.free_global_slots(),
                active_per_host,
                max_per_host: self.config.max_per_host,
                blocked_hosts: items
                    .iter()
                    .filter(|i| !self.breakers.host_admittable(&i.host))
                    .map(|i| i.host.clone())
                    .collect(),
                starting: starting.clone(),
            }
        };
        let weights = ScheduleWeights {
            priority_weight: self.config.priority_weight,
            age_weight: self.config.age_weight,
        };

        for id in scheduler::select_starts(&items, &ctx, weights, chrono::Utc::now()) {
            let Some(item) = items.iter().find(|i| i.id == id) else { continue };
            if !self.limiters.host.allow(&item.host) {
                debug!(download_id = id, host = %item.host, "Start deferred by host rate limit");
                continue;
            }
            let Some(permit) = self.controller.try_global_permit() else { break };
            self.launch_start(id, item.host.clone(), permit);
        }
        Ok(())
    }

    fn launch_start(
        self: &Arc<Self>,
        id: i64,
        host: String,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.starting.lock().unwrap().insert(id);
        let token = self.sessions.issue(id);
        let bytes = Arc::new(AtomicU64::new(0));
        let cancel_merge = Arc::new(AtomicBool::new(false));

        let engine = self.clone();
        let task_token = token.clone();
        let task_bytes = bytes.clone();
        let task_cancel = cancel_merge.clone();
        let parent = tokio::spawn(async move {
            let _permit = permit;
            engine
                .run_download(id, task_token, task_bytes, task_cancel)
                .await;
            engine.starting.lock().unwrap().remove(&id);
        });

        let mut active = self.active.lock().unwrap();
        active.insert(
            id,
            ActiveDownload {
                session: token,
                parent,
                host,
                bytes,
                cancel_merge,
            },
        );
    }

    // ------------------------------------------------------------------
    // Start flow
    // ------------------------------------------------------------------

    async fn run_download(
        self: &Arc<Self>,
        id: i64,
        token: SessionToken,
        bytes: Arc<AtomicU64>,
        cancel_merge: Arc<AtomicBool>,
    ) {
        // a pause/cancel that landed between selection and here already
        // invalidated the token; do not resurrect the row
        if !self.sessions.is_current(id, &token) {
            self.starting.lock().unwrap().remove(&id);
            self.finish_run(id);
            return;
        }
        if self
            .transition(id, DownloadState::Starting, TransitionOpts::default())
            .is_err()
        {
            // raced with a pause/cancel between selection and start
            self.finish_run(id);
            return;
        }
        self.starting.lock().unwrap().remove(&id);

        match self.drive_download(id, &token, &bytes, &cancel_merge).await {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                debug!(download_id = id, "Run ended by pause/cancel");
            }
            Err(err) => {
                self.fail_download(id, &err, false);
            }
        }
        self.finish_run(id);
        self.tick.notify_one();
    }

    async fn drive_download(
        self: &Arc<Self>,
        id: i64,
        token: &SessionToken,
        bytes: &Arc<AtomicU64>,
        cancel_merge: &Arc<AtomicBool>,
    ) -> Result<(), EngineError> {
        let download = self.store.get(id)?;
        let save_path = PathBuf::from(&download.save_path);
        let host = probe::host_of(&download.url)
            .ok_or_else(|| EngineError::Validation("url lost its host".to_string()))?;
        let breaker = self.breakers.for_host(&host);

        // probe for size and range support
        let probe_result = match &breaker {
            Some(b) => {
                b.execute(|| probe::probe(&self.client, &download.url))
                    .await
            }
            None => probe::probe(&self.client, &download.url).await,
        };
        let probed = match probe_result {
            Ok(p) => p,
            Err(err) => {
                self.store.record_attempt(id, None, 1, &err, 0)?;
                return Err(err);
            }
        };
        if !self.sessions.is_current(id, token) {
            return Err(EngineError::Cancelled);
        }

        let total_bytes = probed.total_bytes.or(download.total_bytes);
        if let Some(total) = total_bytes {
            self.store.set_total_bytes(id, total)?;
            self.notify_version();
        }

        // existing target: park and ask, unless already approved
        let approved = self.overwrite_approved.lock().unwrap().remove(&id);
        if save_path.exists() && !approved {
            let (size_bytes, modified) =
                filesystem::existing_file_info(&save_path).unwrap_or((0, None));
            self.transition(id, DownloadState::Paused, TransitionOpts::await_overwrite())?;
            self.bus.emit(EngineEvent::NeedsConfirmation {
                id,
                file_info: ExistingFileInfo {
                    path: download.save_path.clone(),
                    size_bytes,
                    modified,
                },
            });
            info!(download_id = id, "Target exists, awaiting overwrite confirmation");
            return Ok(());
        }

        // mode decision
        let chunked = !self.config.disable_chunked
            && probed.accepts_ranges
            && total_bytes.map(|t| !planner::wants_simple(t)).unwrap_or(false);
        let mode = if chunked {
            TransferMode::Chunked
        } else {
            TransferMode::Simple
        };
        self.store.set_mode(id, mode)?;

        if let Some(total) = total_bytes.filter(|_| chunked) {
            let plan: Vec<(u32, u64, u64)> = planner::plan(total)
                .into_iter()
                .map(|c| (c.index, c.start, c.end))
                .collect();
            self.store.upsert_chunks(id, &plan)?;
        }

        self.transition(id, DownloadState::Downloading, TransitionOpts::default())?;
        self.notify_version();

        match mode {
            TransferMode::Simple => {
                self.run_simple_mode(id, &download, token, bytes).await?;
                self.complete_download(id, &download, &save_path, token, cancel_merge, false)
                    .await
            }
            TransferMode::Chunked => {
                match self.run_chunked_mode(id, &download, token, bytes).await? {
                    ChunkRun::Completed => {
                        self.complete_download(id, &download, &save_path, token, cancel_merge, true)
                            .await
                    }
                    ChunkRun::RangeIgnored => {
                        // the probe promised ranges but the server sent
                        // whole bodies; no chunk rows survive the switch
                        warn!(download_id = id, "Falling back to simple mode");
                        self.store.delete_chunks(id)?;
                        self.store.set_mode(id, TransferMode::Simple)?;
                        filesystem::cleanup_artifacts(&save_path);
                        bytes.store(0, Ordering::Relaxed);
                        self.run_simple_mode(id, &download, token, bytes).await?;
                        self.complete_download(id, &download, &save_path, token, cancel_merge, false)
                            .await
                    }
                }
            }
        }
    }

    /// Simple transfer with the engine-level retry loop
    async fn run_simple_mode(
        self: &Arc<Self>,
        id: i64,
        download: &Download,
        token: &SessionToken,
        bytes: &Arc<AtomicU64>,
    ) -> Result<(), EngineError> {
        let host = probe::host_of(&download.url).unwrap_or_default();
        let breaker = self.breakers.for_host(&host);
        let job = SimpleJob {
            download_id: id,
            url: download.url.clone(),
            save_path: PathBuf::from(&download.save_path),
            idle_timeout: self.config.idle_timeout(),
        };

        let mut attempts = 0u32;
        loop {
            if !self.sessions.is_current(id, token) {
                return Err(EngineError::Cancelled);
            }
            let counter = bytes.clone();
            let result = simple::run_simple(
                &self.client,
                &job,
                &self.sessions,
                token,
                breaker.as_ref(),
                move |written| counter.store(written, Ordering::Relaxed),
            )
            .await;

            match result {
                Ok(written) => {
                    bytes.store(written, Ordering::Relaxed);
                    self.store.update_progress(id, written)?;
                    self.notify_version();
                    return Ok(());
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    attempts += 1;
                    self.store.record_attempt(
                        id,
                        None,
                        attempts,
                        &err,
                        bytes.load(Ordering::Relaxed),
                    )?;
                    if !err.is_retryable() || attempts > self.config.max_chunk_retries {
                        return Err(err);
                    }
                    let delay = chunked::backoff_delay(attempts);
                    debug!(
                        download_id = id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Simple attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Chunked transfer: one JoinSet of chunk workers under the slots
    async fn run_chunked_mode(
        self: &Arc<Self>,
        id: i64,
        download: &Download,
        token: &SessionToken,
        bytes: &Arc<AtomicU64>,
    ) -> Result<ChunkRun, EngineError> {
        let host = probe::host_of(&download.url).unwrap_or_default();
        let slots = self.controller.register(id);
        let deps = ChunkDeps {
            client: self.client.clone(),
            store: self.store.clone(),
            sessions: self.sessions.clone(),
            bus: self.bus.clone(),
            slots,
            breaker: self.breakers.for_host(&host),
            bytes_counter: bytes.clone(),
        };
        let ctx = ChunkContext {
            download_id: id,
            url: download.url.clone(),
            save_path: PathBuf::from(&download.save_path),
            idle_timeout: self.config.idle_timeout(),
            chunk_timeout: self.config.chunk_timeout(),
            max_retries: self.config.max_chunk_retries,
        };

        let chunks = self.store.get_chunks(id)?;
        let done_bytes: u64 = chunks
            .iter()
            .filter(|c| c.is_complete())
            .map(|c| c.range_len())
            .sum();
        bytes.store(done_bytes, Ordering::Relaxed);

        let staging = filesystem::staging_dir(Path::new(&download.save_path));
        tokio::fs::create_dir_all(&staging).await?;

        let mut set: JoinSet<Result<ChunkRun, EngineError>> = JoinSet::new();
        for chunk in chunks.into_iter().filter(|c| !c.is_complete()) {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let token = token.clone();
            set.spawn(async move { chunked::run_chunk(&deps, &ctx, &chunk, &token).await });
        }

        let mut outcome = ChunkRun::Completed;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(ChunkRun::Completed)) => {}
                Ok(Ok(ChunkRun::RangeIgnored)) => {
                    outcome = ChunkRun::RangeIgnored;
                    set.abort_all();
                    break;
                }
                Ok(Err(EngineError::Cancelled)) => {
                    set.abort_all();
                    return Err(EngineError::Cancelled);
                }
                Ok(Err(err)) => {
                    // cascade: invalidate the session so sibling workers
                    // stop at their next suspension point
                    self.sessions.invalidate(id);
                    set.abort_all();
                    self.controller.release(id);
                    return Err(err);
                }
                Err(join_err) if join_err.is_cancelled() => {
                    return Err(EngineError::Cancelled);
                }
                Err(join_err) => {
                    self.sessions.invalidate(id);
                    set.abort_all();
                    self.controller.release(id);
                    return Err(EngineError::State(join_err.to_string()));
                }
            }
        }
        self.controller.release(id);
        Ok(outcome)
    }

    /// Merge (chunked), verify, and settle as COMPLETED
    async fn complete_download(
        self: &Arc<Self>,
        id: i64,
        download: &Download,
        save_path: &Path,
        token: &SessionToken,
        cancel_merge: &Arc<AtomicBool>,
        merged: bool,
    ) -> Result<(), EngineError> {
        let refreshed = self.store.get(id)?;
        let total = refreshed.total_bytes;

        if merged {
            self.transition(id, DownloadState::Merging, TransitionOpts::default())?;
            self.bus.emit(EngineEvent::MergeStarted { id });

            let chunks = self.store.get_chunks(id)?;
            let sizes: Vec<u64> = chunks.iter().map(|c| c.range_len()).collect();
            let count = chunks.len() as u32;
            let path = save_path.to_path_buf();
            let flag = cancel_merge.clone();
            let rx = self
                .workers
                .submit("chunk-merge", move || {
                    assembler::merge_chunks(&path, count, &sizes, total, &flag)
                        .map_err(anyhow::Error::from)?;
                    Ok(())
                })
                .map_err(|e| EngineError::State(e.to_string()))?;

            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let err = e
                        .downcast::<EngineError>()
                        .unwrap_or_else(|e| EngineError::Disk(e.to_string()));
                    if matches!(err, EngineError::Cancelled) {
                        return Err(EngineError::Cancelled);
                    }
                    self.fail_download(id, &err, true);
                    return Ok(());
                }
                Err(_) => {
                    self.fail_download(
                        id,
                        &EngineError::State("merge worker vanished".to_string()),
                        true,
                    );
                    return Ok(());
                }
            }
            if !self.sessions.is_current(id, token) {
                return Err(EngineError::Cancelled);
            }
        }

        // verification pass over the assembled file
        let expected = Expected {
            size: total,
            sha256: refreshed.expected_sha256.clone(),
        };
        let wants_verify = !self.config.skip_verification
            && (expected.size.is_some() || expected.sha256.is_some());
        if wants_verify {
            self.transition(id, DownloadState::Verifying, TransitionOpts::default())?;
            self.bus.emit(EngineEvent::VerificationStarted { id });

            let path = save_path.to_path_buf();
            let rx = self
                .workers
                .submit("verify", move || {
                    integrity::verify_file(&path, &expected).map_err(anyhow::Error::from)?;
                    Ok(())
                })
                .map_err(|e| EngineError::State(e.to_string()))?;
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let err = e
                        .downcast::<EngineError>()
                        .unwrap_or_else(|e| EngineError::Integrity(e.to_string()));
                    self.fail_download(id, &err, false);
                    return Ok(());
                }
                Err(_) => {
                    self.fail_download(
                        id,
                        &EngineError::State("verify worker vanished".to_string()),
                        false,
                    );
                    return Ok(());
                }
            }
        }

        if let Some(total) = total {
            self.store.update_progress(id, total)?;
        }
        self.transition(id, DownloadState::Completed, TransitionOpts::default())?;
        if merged {
            // parts served their purpose once the final file is in place
            filesystem::cleanup_artifacts(save_path);
        }
        self.bus.emit(EngineEvent::DownloadCompleted {
            id,
            title: download.save_name(),
            save_path: download.save_path.clone(),
        });
        info!(download_id = id, path = %download.save_path, "Download completed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(EngineError::State("engine is shut down".to_string()))
        } else {
            Ok(())
        }
    }

    fn transition(
        &self,
        id: i64,
        state: DownloadState,
        opts: TransitionOpts,
    ) -> Result<(), EngineError> {
        let version = self.store.set_state(id, state, opts)?;
        self.bus.notify_state_changed(version);
        Ok(())
    }

    fn notify_version(&self) {
        self.bus.notify_state_changed(self.store.current_version());
    }

    fn fail_download(&self, id: i64, err: &EngineError, during_merge: bool) {
        error!(download_id = id, error = %err, during_merge, "Download failed");
        // stale sibling callbacks become no-ops
        self.sessions.invalidate(id);
        let _ = self.transition(
            id,
            DownloadState::Failed,
            TransitionOpts::error(err.to_string(), err.kind()),
        );
        self.bus.emit(EngineEvent::DownloadFailed {
            id,
            error: err.to_string(),
            failed_during_merge: during_merge,
        });
    }

    /// Abort the live run of a download and flush its last progress
    fn teardown_run(&self, id: i64, flush_progress: bool) {
        self.sessions.invalidate(id);
        let entry = {
            let mut active = self.active.lock().unwrap();
            active.remove(&id)
        };
        if let Some(entry) = entry {
            entry.cancel_merge.store(true, Ordering::SeqCst);
            entry.parent.abort();
            if flush_progress {
                let bytes = entry.bytes.load(Ordering::Relaxed);
                if let Err(e) = self.store.update_progress(id, bytes) {
                    warn!(download_id = id, error = %e, "Progress flush on teardown failed");
                }
                self.checkpoint_chunks(id);
            }
        }
        self.starting.lock().unwrap().remove(&id);
        self.finish_run(id);
    }

    /// Stamp tail-hash checkpoints on partially written chunk parts
    ///
    /// Runs on clean suspension; the recorded count is what is actually
    /// on disk, so a write the aborting worker never flushed is simply
    /// not counted.
    fn checkpoint_chunks(&self, id: i64) {
        let Ok(download) = self.store.get(id) else { return };
        if download.mode != Some(TransferMode::Chunked) {
            return;
        }
        let Ok(chunks) = self.store.get_chunks(id) else { return };
        let save_path = PathBuf::from(&download.save_path);
        for chunk in chunks.iter().filter(|c| !c.is_complete()) {
            let part = filesystem::chunk_part_path(&save_path, chunk.chunk_index);
            let on_disk = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            let written = on_disk.min(chunk.range_len());
            if written == 0 {
                continue;
            }
            if let Ok(Some(hash)) = integrity::tail_hash_at(&part, written) {
                let _ = self
                    .store
                    .set_chunk_progress(id, chunk.chunk_index, written, Some(&hash));
                let _ = self
                    .store
                    .set_chunk_state(id, chunk.chunk_index, crate::core::state::ChunkState::Paused);
            }
        }
        debug!(download_id = id, "Chunk checkpoints stamped");
    }

    /// Release per-download resources after a run ends
    fn finish_run(&self, id: i64) {
        self.controller.release(id);
        self.speed.forget(id);
        self.bus.clear_progress_gate(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ChunkState;
    use crate::testsupport::ByteServer;
    use tempfile::tempdir;

    fn test_config() -> EngineConfig {
        EngineConfig::default()
    }

    fn engine_with(config: EngineConfig) -> Arc<DownloadEngine> {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        DownloadEngine::with_store(config, store).unwrap()
    }

    fn add_req(url: &str, save: &Path) -> AddRequest {
        AddRequest {
            id: None,
            url: url.to_string(),
            save_path: save.to_string_lossy().to_string(),
            total_bytes_hint: None,
            priority: None,
            expected_sha256: None,
        }
    }

    async fn wait_for_state(
        engine: &DownloadEngine,
        id: i64,
        state: DownloadState,
        timeout: Duration,
    ) -> Download {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let d = engine.store.get(id).unwrap();
            if d.state == state {
                return d;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {state:?}, at {:?} ({:?}/{:?})",
                d.state,
                d.error_message,
                d.error_code
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_add_validations() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let save = dir.path().join("f.bin");

        // scheme
        let err = engine
            .add(add_req("http://files.example.org/f.bin", &save))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        // unparseable
        assert_eq!(
            engine.add(add_req("not a url", &save)).unwrap_err().kind(),
            "validation"
        );

        // relative save path
        let err = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                Path::new("relative.bin"),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        // happy path
        let id = engine
            .add(add_req("https://files.example.org/f.bin", &save))
            .unwrap();
        assert!(id >= 1);
        assert_eq!(
            engine.store.get(id).unwrap().state,
            DownloadState::Queued
        );
    }

    #[tokio::test]
    async fn test_add_enforces_allowlist() {
        let mut config = test_config();
        config.host_allowlist = vec!["mirror.example.org".to_string()];
        let engine = engine_with(config);
        let dir = tempdir().unwrap();
        let save = dir.path().join("f.bin");

        assert!(engine
            .add(add_req("https://mirror.example.org/f.bin", &save))
            .is_ok());
        let err = engine
            .add(add_req("https://other.example.org/f.bin", &save))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_duplicate_explicit_id_rejected() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let mut req = add_req(
            "https://files.example.org/f.bin",
            &dir.path().join("f.bin"),
        );
        req.id = Some(42);
        assert_eq!(engine.add(req.clone()).unwrap(), 42);
        assert_eq!(engine.add(req).unwrap_err().kind(), "state");
    }

    #[tokio::test]
    async fn test_pause_resume_cycle_on_queued() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let id = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap();

        engine.pause(id).unwrap();
        assert_eq!(engine.store.get(id).unwrap().state, DownloadState::Paused);

        engine.resume(id).unwrap();
        assert_eq!(engine.store.get(id).unwrap().state, DownloadState::Queued);

        // resume again is a state error
        assert_eq!(engine.resume(id).unwrap_err().kind(), "state");
    }

    #[tokio::test]
    async fn test_cancel_removes_artifacts() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let save = dir.path().join("f.bin");
        let id = engine
            .add(add_req("https://files.example.org/f.bin", &save))
            .unwrap();

        // simulate on-disk leftovers
        std::fs::create_dir_all(filesystem::staging_dir(&save)).unwrap();
        std::fs::write(filesystem::chunk_part_path(&save, 0), b"x").unwrap();
        std::fs::write(filesystem::simple_part_path(&save), b"y").unwrap();

        engine.cancel(id).unwrap();
        assert_eq!(
            engine.store.get(id).unwrap().state,
            DownloadState::Cancelled
        );
        assert!(!filesystem::staging_dir(&save).exists());
        assert!(!filesystem::simple_part_path(&save).exists());
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let id = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap();
        assert_eq!(engine.retry(id).unwrap_err().kind(), "state");

        engine
            .store
            .set_state(id, DownloadState::Starting, TransitionOpts::default())
            .unwrap();
        engine
            .store
            .set_state(
                id,
                DownloadState::Failed,
                TransitionOpts::error("boom", "network"),
            )
            .unwrap();
        engine.retry(id).unwrap();
        assert_eq!(engine.store.get(id).unwrap().state, DownloadState::Queued);
    }

    #[tokio::test]
    async fn test_confirm_overwrite_requires_pending_state() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let id = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap();
        assert_eq!(engine.confirm_overwrite(id, true).unwrap_err().kind(), "state");
    }

    #[tokio::test]
    async fn test_set_priority_rules() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let id = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap();
        engine.set_priority(id, Priority::High).unwrap();
        assert_eq!(engine.store.get(id).unwrap().priority, Priority::High);

        engine
            .store
            .set_state(id, DownloadState::Starting, TransitionOpts::default())
            .unwrap();
        assert_eq!(
            engine.set_priority(id, Priority::Low).unwrap_err().kind(),
            "state"
        );
    }

    #[tokio::test]
    async fn test_snapshot_and_summary_delegation() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let id = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap();

        let snap = engine.snapshot(None).unwrap().unwrap();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].id, id);
        assert!(engine.snapshot(Some(snap.version)).unwrap().is_none());
        assert_eq!(engine.summary().unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_debug_dump() {
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let id = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap();
        engine.store.upsert_chunks(id, &[(0, 0, 99)]).unwrap();
        engine
            .store
            .record_attempt(id, Some(0), 1, &EngineError::Network("x".into()), 0)
            .unwrap();

        let dump = engine.debug(id).unwrap();
        assert_eq!(dump.download.id, id);
        assert_eq!(dump.chunks.len(), 1);
        assert_eq!(dump.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_session_metrics_shape() {
        let engine = engine_with(test_config());
        let metrics = engine.session_metrics();
        assert_eq!(metrics.active_downloads, 0);
        assert_eq!(metrics.current_bps, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let engine = engine_with(test_config());
        engine.shutdown().await;
        let dir = tempdir().unwrap();
        let err = engine
            .add(add_req(
                "https://files.example.org/f.bin",
                &dir.path().join("f.bin"),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), "state");
    }

    // ------------------------------------------------------------------
    // End-to-end through the scheduler against a local byte server.
    // Component-level chunked tests live in network::chunked; these runs
    // exercise the start flow, mode decision, and completion path. The
    // add() validations are bypassed by seeding the store directly, the
    // way the scheduler sees rows regardless of their origin.
    // ------------------------------------------------------------------

    fn seed_queued(engine: &DownloadEngine, url: &str, save: &Path) -> i64 {
        engine
            .store
            .add(&AddRequest {
                id: None,
                url: url.to_string(),
                save_path: save.to_string_lossy().to_string(),
                total_bytes_hint: None,
                priority: None,
                expected_sha256: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_e2e_simple_download_completes() {
        let payload: Vec<u8> = (0..80_000u32).map(|i| (i % 251) as u8).collect();
        let server = ByteServer::spawn(payload.clone(), true).await;
        let engine = engine_with(test_config());
        let mut events = engine.subscribe();
        let dir = tempdir().unwrap();
        let save = dir.path().join("rom.bin");

        let v0 = engine.store.current_version();
        let id = seed_queued(&engine, &server.url("/rom.bin"), &save);
        engine.tick.notify_one();

        let done = wait_for_state(&engine, id, DownloadState::Completed, Duration::from_secs(10))
            .await;
        assert_eq!(done.mode, Some(TransferMode::Simple));
        assert_eq!(done.downloaded_bytes, payload.len() as u64);
        assert_eq!(std::fs::read(&save).unwrap(), payload);
        assert!(engine.store.current_version() > v0);

        // exactly one completion event for this id
        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::DownloadCompleted { id: eid, .. } if eid == id) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_e2e_chunked_download_completes() {
        // just over the simple threshold so the planner picks chunked mode
        let total: usize = 52 * 1024 * 1024;
        let mut payload = vec![0u8; total];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let digest = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(&payload);
            format!("{:x}", hasher.finalize())
        };
        let server = ByteServer::spawn(payload, true).await;
        let engine = engine_with(test_config());
        let mut events = engine.subscribe();
        let dir = tempdir().unwrap();
        let save = dir.path().join("rom.bin");

        let id = engine
            .store
            .add(&AddRequest {
                id: None,
                url: server.url("/rom.bin"),
                save_path: save.to_string_lossy().to_string(),
                total_bytes_hint: None,
                priority: None,
                expected_sha256: Some(digest),
            })
            .unwrap();
        engine.tick.notify_one();

        let done =
            wait_for_state(&engine, id, DownloadState::Completed, Duration::from_secs(120)).await;
        assert_eq!(done.mode, Some(TransferMode::Chunked));
        assert_eq!(done.total_bytes, Some(total as u64));
        assert_eq!(done.downloaded_bytes, total as u64);
        assert_eq!(std::fs::metadata(&save).unwrap().len(), total as u64);

        // the plan covered the file in the expected band and every chunk
        // settled; part files are gone once the final file is in place
        let chunks = engine.store.get_chunks(id).unwrap();
        assert!((4..=8).contains(&chunks.len()), "planned {} chunks", chunks.len());
        assert!(chunks.iter().all(|c| c.state == ChunkState::Completed));
        assert!(!filesystem::staging_dir(&save).exists());

        let (mut merges, mut verifies, mut completions) = (0, 0, 0);
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::MergeStarted { id: eid } if eid == id => merges += 1,
                EngineEvent::VerificationStarted { id: eid } if eid == id => verifies += 1,
                EngineEvent::DownloadCompleted { id: eid, .. } if eid == id => completions += 1,
                _ => {}
            }
        }
        assert_eq!(merges, 1);
        assert_eq!(verifies, 1);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_e2e_existing_target_prompts_and_decline_cancels() {
        let payload = vec![1u8; 5_000];
        let server = ByteServer::spawn(payload, true).await;
        let engine = engine_with(test_config());
        let mut events = engine.subscribe();
        let dir = tempdir().unwrap();
        let save = dir.path().join("rom.bin");
        std::fs::write(&save, b"pre-existing contents").unwrap();

        let id = seed_queued(&engine, &server.url("/rom.bin"), &save);
        engine.tick.notify_one();

        let parked =
            wait_for_state(&engine, id, DownloadState::Paused, Duration::from_secs(10)).await;
        assert_eq!(parked.error_code.as_deref(), Some(AWAIT_OVERWRITE));

        let mut prompts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::NeedsConfirmation { id: eid, .. } if eid == id) {
                prompts += 1;
            }
        }
        assert_eq!(prompts, 1);

        engine.confirm_overwrite(id, false).unwrap();
        assert_eq!(
            engine.store.get(id).unwrap().state,
            DownloadState::Cancelled
        );
        // the existing file was never touched
        assert_eq!(std::fs::read(&save).unwrap(), b"pre-existing contents");
    }

    #[tokio::test]
    async fn test_e2e_overwrite_accept_replaces_file() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 199) as u8).collect();
        let server = ByteServer::spawn(payload.clone(), true).await;
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let save = dir.path().join("rom.bin");
        std::fs::write(&save, b"old").unwrap();

        let id = seed_queued(&engine, &server.url("/rom.bin"), &save);
        engine.tick.notify_one();
        wait_for_state(&engine, id, DownloadState::Paused, Duration::from_secs(10)).await;

        engine.confirm_overwrite(id, true).unwrap();
        wait_for_state(&engine, id, DownloadState::Completed, Duration::from_secs(10)).await;
        assert_eq!(std::fs::read(&save).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_e2e_server_error_fails_download() {
        let server = ByteServer::spawn_with_status(404).await;
        let engine = engine_with(test_config());
        let dir = tempdir().unwrap();
        let save = dir.path().join("rom.bin");

        let id = seed_queued(&engine, &server.url("/rom.bin"), &save);
        engine.tick.notify_one();

        let failed =
            wait_for_state(&engine, id, DownloadState::Failed, Duration::from_secs(10)).await;
        assert_eq!(failed.error_code.as_deref(), Some("server"));
        assert!(!engine.store.get_attempts(id).unwrap().is_empty());

        // retry re-queues it
        engine.retry(id).unwrap();
        assert_eq!(engine.store.get(id).unwrap().state, DownloadState::Queued);
    }
}
