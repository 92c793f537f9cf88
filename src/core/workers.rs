use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reusable background workers
///
/// Chunk merges and batched DB writes are blocking disk work; they run
/// here instead of on the async reactor. The pool keeps between `min`
/// and `max` threads: idle threads beyond `min` retire themselves, a
/// supervisor pings for liveness and replaces workers that stop
/// answering, and repeated thread-spawn failures flip the pool into a
/// degraded state that rejects new work instead of spawn-looping.
use crate::core::error::EngineError;

/// Consecutive spawn failures before the pool degrades
const DEGRADE_AFTER_SPAWN_FAILURES: u32 = 3;

/// How long an idle surplus worker lingers before retiring
const IDLE_RETIRE: Duration = Duration::from_secs(60);

/// Supervisor ping cadence and response window
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_WINDOW: Duration = Duration::from_secs(5);

type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

enum Job {
    Run {
        label: &'static str,
        task: Task,
        done: tokio::sync::oneshot::Sender<anyhow::Result<()>>,
    },
    Ping(mpsc::Sender<usize>),
}

struct Shared {
    rx: Mutex<mpsc::Receiver<Job>>,
    live: AtomicUsize,
    pending: AtomicUsize,
    min: usize,
    max: usize,
    idle_retire: Duration,
    degraded: AtomicBool,
    spawn_failures: AtomicU32,
    next_worker: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(min: usize, max: usize) -> Self {
        Self::with_idle_retire(min, max, IDLE_RETIRE)
    }

    fn with_idle_retire(min: usize, max: usize, idle_retire: Duration) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            rx: Mutex::new(rx),
            live: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            min,
            max,
            idle_retire,
            degraded: AtomicBool::new(false),
            spawn_failures: AtomicU32::new(0),
            next_worker: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let pool = Self {
            tx: Mutex::new(Some(tx)),
            shared,
        };
        for _ in 0..min {
            pool.spawn_worker();
        }
        pool.spawn_supervisor();
        info!(min, max, "Worker pool started");
        pool
    }

    /// Queue a blocking task; the receiver resolves with its result
    pub fn submit<F>(
        &self,
        label: &'static str,
        task: F,
    ) -> Result<tokio::sync::oneshot::Receiver<anyhow::Result<()>>, EngineError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.shared.degraded.load(Ordering::SeqCst) {
            return Err(EngineError::State("worker pool degraded".to_string()));
        }
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        {
            let tx = self.tx.lock().unwrap();
            let tx = tx
                .as_ref()
                .ok_or_else(|| EngineError::State("worker pool shut down".to_string()))?;
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            tx.send(Job::Run {
                label,
                task: Box::new(task),
                done: done_tx,
            })
            .map_err(|_| EngineError::State("worker pool shut down".to_string()))?;
        }

        // scale up while there is queued work and headroom
        let live = self.shared.live.load(Ordering::SeqCst);
        if live < self.shared.max && self.shared.pending.load(Ordering::SeqCst) > live {
            self.spawn_worker();
        }
        Ok(done_rx)
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Stop accepting work and let workers drain
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let mut tx = self.tx.lock().unwrap();
        if tx.take().is_some() {
            info!("Worker pool shutting down");
        }
    }

    fn spawn_worker(&self) {
        let shared = self.shared.clone();
        if shared.live.load(Ordering::SeqCst) >= shared.max {
            return;
        }
        let id = shared.next_worker.fetch_add(1, Ordering::SeqCst);
        let builder = std::thread::Builder::new().name(format!("dl-worker-{id}"));
        let shared_for_thread = shared.clone();
        match builder.spawn(move || worker_loop(id, shared_for_thread)) {
            Ok(_) => {
                shared.live.fetch_add(1, Ordering::SeqCst);
                shared.spawn_failures.store(0, Ordering::SeqCst);
                debug!(worker = id, "Worker spawned");
            }
            Err(e) => {
                let failures = shared.spawn_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(error = %e, failures, "Failed to spawn worker thread");
                if failures >= DEGRADE_AFTER_SPAWN_FAILURES {
                    warn!("Worker pool degraded after repeated spawn failures");
                    shared.degraded.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn spawn_supervisor(&self) {
        let shared = self.shared.clone();
        let tx = self.tx.lock().unwrap().as_ref().cloned();
        let Some(tx) = tx else { return };
        let result = std::thread::Builder::new()
            .name("dl-worker-supervisor".to_string())
            .spawn(move || supervisor_loop(shared, tx));
        if let Err(e) = result {
            error!(error = %e, "Failed to spawn pool supervisor");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        let job = {
            let rx = shared.rx.lock().unwrap();
            rx.recv_timeout(shared.idle_retire)
        };
        match job {
            Ok(Job::Run { label, task, done }) => {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                debug!(worker = id, label, "Worker picked up task");
                let result = task();
                if let Err(e) = &result {
                    warn!(worker = id, label, error = %e, "Worker task failed");
                }
                let _ = done.send(result);
            }
            Ok(Job::Ping(reply)) => {
                let _ = reply.send(id);
            }
            Err(RecvTimeoutError::Timeout) => {
                // surplus workers retire; the base set stays warm
                let live = shared.live.load(Ordering::SeqCst);
                if live > shared.min {
                    shared.live.fetch_sub(1, Ordering::SeqCst);
                    debug!(worker = id, "Idle worker retired");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

fn supervisor_loop(shared: Arc<Shared>, tx: mpsc::Sender<Job>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(PING_INTERVAL);
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let live = shared.live.load(Ordering::SeqCst);
        if live == 0 {
            continue;
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        for _ in 0..live {
            if tx.send(Job::Ping(reply_tx.clone())).is_err() {
                return;
            }
        }
        drop(reply_tx);

        let deadline = std::time::Instant::now() + PING_WINDOW;
        let mut responses = 0usize;
        while responses < live {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                break;
            }
            match reply_rx.recv_timeout(left) {
                Ok(_) => responses += 1,
                Err(_) => break,
            }
        }

        if responses < live {
            // a long merge keeps a worker legitimately busy; only top the
            // pool back up to its floor
            warn!(live, responses, "Worker ping shortfall");
            let missing = shared.min.saturating_sub(responses);
            for _ in 0..missing {
                if shared.live.load(Ordering::SeqCst) >= shared.max {
                    break;
                }
                let id = shared.next_worker.fetch_add(1, Ordering::SeqCst);
                let shared_clone = shared.clone();
                match std::thread::Builder::new()
                    .name(format!("dl-worker-{id}"))
                    .spawn(move || worker_loop(id, shared_clone))
                {
                    Ok(_) => {
                        shared.live.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        let failures = shared.spawn_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        error!(error = %e, failures, "Supervisor failed to replace worker");
                        if failures >= DEGRADE_AFTER_SPAWN_FAILURES {
                            shared.degraded.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        }
    }
}
