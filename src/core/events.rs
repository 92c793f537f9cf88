use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Typed event fan-out to the UI boundary
///
/// Events ride a broadcast channel; slow subscribers lag and drop, which
/// is fine because the queue state can always be reconstructed from
/// `snapshot`. `state-changed` is debounced: a burst of store mutations
/// inside the window collapses to one emission carrying the latest
/// version, and versions never go backwards.

/// Capacity of the broadcast ring; laggards drop the oldest events
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Debounce window for state-changed
const STATE_DEBOUNCE: Duration = Duration::from_millis(50);

/// Minimum spacing of progress events per download (2 Hz)
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Per-chunk progress attached to progress events of chunked downloads
#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    pub chunk_index: u32,
    pub written_bytes: u64,
    pub range_len: u64,
}

/// Details handed to the UI when the target path already exists
#[derive(Debug, Clone, Serialize)]
pub struct ExistingFileInfo {
    pub path: String,
    pub size_bytes: u64,
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EngineEvent {
    StateChanged {
        version: u64,
    },
    DownloadProgress {
        id: i64,
        bytes: u64,
        percent: f64,
        speed_bps: u64,
        eta_s: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_progress: Option<Vec<ChunkProgress>>,
    },
    DownloadCompleted {
        id: i64,
        title: String,
        save_path: String,
    },
    DownloadFailed {
        id: i64,
        error: String,
        failed_during_merge: bool,
    },
    ChunkCompleted {
        id: i64,
        chunk_index: u32,
    },
    ChunkFailed {
        id: i64,
        chunk_index: u32,
        error: String,
        will_retry: bool,
    },
    MergeStarted {
        id: i64,
    },
    VerificationStarted {
        id: i64,
    },
    NeedsConfirmation {
        id: i64,
        file_info: ExistingFileInfo,
    },
}

impl EngineEvent {
    /// Contractual event name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::StateChanged { .. } => "state-changed",
            EngineEvent::DownloadProgress { .. } => "download-progress",
            EngineEvent::DownloadCompleted { .. } => "download-completed",
            EngineEvent::DownloadFailed { .. } => "download-failed",
            EngineEvent::ChunkCompleted { .. } => "chunk-completed",
            EngineEvent::ChunkFailed { .. } => "chunk-failed",
            EngineEvent::MergeStarted { .. } => "merge-started",
            EngineEvent::VerificationStarted { .. } => "verification-started",
            EngineEvent::NeedsConfirmation { .. } => "needs-confirmation",
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    version_tx: watch::Sender<u64>,
    progress_gate: Mutex<HashMap<i64, Instant>>,
}

impl EventBus {
    /// Build the bus and spawn its debounce task; must run inside a
    /// tokio runtime
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (version_tx, mut version_rx) = watch::channel(0u64);

        let debounce_tx = tx.clone();
        tokio::spawn(async move {
            while version_rx.changed().await.is_ok() {
                tokio::time::sleep(STATE_DEBOUNCE).await;
                let version = *version_rx.borrow_and_update();
                let _ = debounce_tx.send(EngineEvent::StateChanged { version });
            }
        });

        Self {
            tx,
            version_tx,
            progress_gate: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Queue a debounced state-changed emission for `version`
    ///
    /// Safe from any thread; the debounce task reads the latest value
    /// after the window closes.
    pub fn notify_state_changed(&self, version: u64) {
        self.version_tx.send_if_modified(|current| {
            if version > *current {
                *current = version;
                true
            } else {
                false
            }
        });
    }

    /// Emit a progress event, rate-limited to 2 Hz per download
    pub fn emit_progress(&self, event: EngineEvent) {
        let EngineEvent::DownloadProgress { id, .. } = &event else {
            debug!(event = event.name(), "emit_progress called with non-progress event");
            return;
        };
        let now = Instant::now();
        {
            let mut gate = self.progress_gate.lock().unwrap();
            let inside_window = gate
                .get(id)
                .map(|last| now.duration_since(*last) < PROGRESS_MIN_INTERVAL)
                .unwrap_or(false);
            if inside_window {
                return;
            }
            gate.insert(*id, now);
        }
        let _ = self.tx.send(event);
    }

    /// Emit any non-progress event immediately
    pub fn emit(&self, event: EngineEvent) {
        debug!(event = event.name(), "Emitting engine event");
        let _ = self.tx.send(event);
    }

    /// Drop the per-download gate entry once a download settles
    pub fn clear_progress_gate(&self, id: i64) {
        self.progress_gate.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(id: i64, bytes: u64) -> EngineEvent {
        EngineEvent::DownloadProgress {
            id,
            bytes,
            percent: 0.0,
            speed_bps: 0,
            eta_s: None,
            chunk_progress: None,
        }
    }

    #[tokio::test]
    async fn test_state_changed_debounce_collapses_burst() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for v in 1..=20u64 {
            bus.notify_state_changed(v);
        }

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("debounced event")
            .unwrap();
        match event {
            EngineEvent::StateChanged { version } => assert_eq!(version, 20),
            other => panic!("unexpected event {other:?}"),
        }

        // nothing else queued
        assert!(
            tokio::time::timeout(Duration::from_millis(120), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_state_changed_never_goes_backwards() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.notify_state_changed(5);
        bus.notify_state_changed(3); // stale, ignored

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::StateChanged { version } => assert_eq!(version, 5),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_gate_limits_rate() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit_progress(progress(1, 100));
        bus.emit_progress(progress(1, 200)); // inside the window, dropped
        bus.emit_progress(progress(2, 50)); // different download, passes

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            EngineEvent::DownloadProgress { id: 1, bytes: 100, .. }
        ));
        assert!(matches!(
            second,
            EngineEvent::DownloadProgress { id: 2, bytes: 50, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_and_names() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::MergeStarted { id: 4 });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "merge-started");
    }
}
