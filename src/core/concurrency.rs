use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Concurrency control
///
/// Two layers of semaphores: one global limit on simultaneously active
/// downloads, and one per-download limit on in-flight chunks. The
/// per-download target adapts to observed throughput: climbing windows
/// with no stalls earn an extra slot, stalled or regressing windows lose
/// one.
use crate::config::EngineConfig;

/// Window length the adaptive controller reasons over
const ADAPT_WINDOW: Duration = Duration::from_secs(10);

/// Throughput must improve by this factor before a slot is added
const CLIMB_FACTOR: f64 = 1.05;

/// Chunk slots for one active chunked download
pub struct DownloadSlots {
    sem: Arc<Semaphore>,
    target: AtomicUsize,
    cap: usize,
    floor: usize,
    window: Mutex<ThroughputWindow>,
}

struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
    prev_rate: f64,
    stall_events: u32,
}

impl DownloadSlots {
    fn new(initial: usize, cap: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(initial)),
            target: AtomicUsize::new(initial),
            cap,
            floor: 1,
            window: Mutex::new(ThroughputWindow {
                samples: VecDeque::new(),
                prev_rate: 0.0,
                stall_events: 0,
            }),
        }
    }

    /// Wait for a chunk slot
    pub async fn acquire(self: &Arc<Self>) -> Result<OwnedSemaphorePermit, tokio::sync::AcquireError> {
        self.sem.clone().acquire_owned().await
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }

    /// Feed the adaptive window a cumulative byte count
    pub fn record_progress(&self, cumulative_bytes: u64) {
        let mut window = self.window.lock().unwrap();
        let now = Instant::now();
        window.samples.push_back((now, cumulative_bytes));
        while let Some((t, _)) = window.samples.front() {
            if now.duration_since(*t) > ADAPT_WINDOW * 2 {
                window.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Note a chunk that made almost no progress over its check window
    pub fn note_stall(&self) {
        self.window.lock().unwrap().stall_events += 1;
    }

    /// Recompute the slot target from the last window
    pub fn adapt(&self) {
        let (rate, prev_rate, stalls) = {
            let mut window = self.window.lock().unwrap();
            let rate = match (window.samples.front(), window.samples.back()) {
                (Some((t0, b0)), Some((t1, b1))) if t1 > t0 => {
                    b1.saturating_sub(*b0) as f64 / t1.duration_since(*t0).as_secs_f64()
                }
                _ => 0.0,
            };
            let prev = window.prev_rate;
            let stalls = window.stall_events;
            window.prev_rate = rate;
            window.stall_events = 0;
            window.samples.clear();
            (rate, prev, stalls)
        };

        let target = self.target.load(Ordering::Relaxed);
        if stalls > 0 || (prev_rate > 0.0 && rate < prev_rate) {
            if target > self.floor {
                self.lower();
                debug!(rate, prev_rate, stalls, target = target - 1, "Chunk slots lowered");
            }
        } else if prev_rate > 0.0 && rate > prev_rate * CLIMB_FACTOR && target < self.cap {
            self.sem.add_permits(1);
            self.target.store(target + 1, Ordering::Relaxed);
            debug!(rate, prev_rate, target = target + 1, "Chunk slots raised");
        }
    }

    fn lower(&self) {
        self.target.fetch_sub(1, Ordering::Relaxed);
        // swallow one permit; if all are in use this waits for the next
        // worker to finish instead of preempting it
        if let Ok(permit) = self.sem.clone().try_acquire_owned() {
            permit.forget();
        } else {
            let sem = self.sem.clone();
            tokio::spawn(async move {
                if let Ok(permit) = sem.acquire_owned().await {
                    permit.forget();
                }
            });
        }
    }
}

pub struct ConcurrencyController {
    global: Arc<Semaphore>,
    global_limit: usize,
    per_download: Mutex<HashMap<i64, Arc<DownloadSlots>>>,
    initial_chunks: usize,
    chunk_cap: usize,
}

impl ConcurrencyController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_parallel_downloads)),
            global_limit: config.max_parallel_downloads,
            per_download: Mutex::new(HashMap::new()),
            initial_chunks: config.max_chunks_per_download,
            chunk_cap: config.chunk_concurrency_cap,
        }
    }

    /// Claim a global download slot without waiting
    pub fn try_global_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.global.clone().try_acquire_owned().ok()
    }

    /// Global slots not currently held
    pub fn free_global_slots(&self) -> usize {
        self.global.available_permits()
    }

    pub fn active_downloads(&self) -> usize {
        self.global_limit - self.global.available_permits()
    }

    /// Create (or return) the chunk slots for an active download
    pub fn register(&self, id: i64) -> Arc<DownloadSlots> {
        let mut per_download = self.per_download.lock().unwrap();
        per_download
            .entry(id)
            .or_insert_with(|| {
                info!(download_id = id, slots = self.initial_chunks, "Registered chunk slots");
                Arc::new(DownloadSlots::new(self.initial_chunks, self.chunk_cap))
            })
            .clone()
    }

    pub fn slots(&self, id: i64) -> Option<Arc<DownloadSlots>> {
        self.per_download.lock().unwrap().get(&id).cloned()
    }

    /// Forget a download's slots once it settles
    pub fn release(&self, id: i64) {
        self.per_download.lock().unwrap().remove(&id);
    }

    /// Run one adaptation pass over every active chunked download
    pub fn adapt_all(&self) {
        let slots: Vec<Arc<DownloadSlots>> = {
            let per_download = self.per_download.lock().unwrap();
            per_download.values().cloned().collect()
        };
        for s in slots {
            s.adapt();
        }
    }
}
