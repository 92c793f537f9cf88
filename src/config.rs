/// Engine configuration
///
/// One typed struct with enumerated, range-checked options. The embedding
/// process deserializes it from its settings file and hands it to
/// `DownloadEngine::new`; nothing inside the engine reads dynamic config.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::error::EngineError;

/// Circuit breaker wiring mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerMode {
    /// No breakers; every attempt goes to the network
    Off,
    /// One breaker shared by all hosts
    Global,
    /// One breaker per hostname
    PerHost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum simultaneously active downloads (1..=10)
    pub max_parallel_downloads: usize,

    /// Maximum simultaneously started downloads per host; defaults to the
    /// global cap
    pub max_per_host: usize,

    /// Initial chunk concurrency within one download (1..=16)
    pub max_chunks_per_download: usize,

    /// Adaptive controller ceiling for per-download chunk concurrency
    pub chunk_concurrency_cap: usize,

    /// Network retries per chunk before the download fails (0..=50)
    pub max_chunk_retries: u32,

    /// Overall per-chunk deadline in minutes (0.5..=60.0)
    pub chunk_timeout_min: f64,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Abort a stream when no bytes arrive for this long
    pub idle_timeout_secs: u64,

    /// Skip the post-merge size/hash verification pass
    pub skip_verification: bool,

    /// Force simple mode regardless of size and range support
    pub disable_chunked: bool,

    /// Breaker wiring
    pub circuit_breaker_mode: BreakerMode,

    /// Global breaker: consecutive failures before opening
    pub breaker_failure_threshold: u32,

    /// Global breaker: consecutive half-open successes before closing
    pub breaker_success_threshold: u32,

    /// Global breaker: seconds an open breaker waits before half-open
    pub breaker_reset_secs: u64,

    /// Per-host breaker: consecutive failures before opening
    pub host_breaker_failure_threshold: u32,

    /// Per-host breaker: seconds an open breaker waits before half-open
    pub host_breaker_reset_secs: u64,

    /// Hostnames downloads may originate from; empty admits any https host
    pub host_allowlist: Vec<String>,

    /// Redirect hops followed before giving up
    pub max_redirects: usize,

    /// Sliding-window budget for request initiation per host (requests
    /// per window)
    pub host_rate_limit: u32,

    /// Sliding-window budget for UI/IPC calls per channel
    pub ipc_rate_limit: u32,

    /// Rate limiter window length in seconds
    pub rate_window_secs: u64,

    /// Worker pool lower bound
    pub workers_min: usize,

    /// Worker pool upper bound; 0 means max(2, cpus - 1)
    pub workers_max: usize,

    /// Scheduler: weight of priority in the start score
    pub priority_weight: f64,

    /// Scheduler: weight of queue age (seconds) in the start score
    pub age_weight: f64,

    /// User-Agent header on every outbound request
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 3,
            max_per_host: 3,
            max_chunks_per_download: 3,
            chunk_concurrency_cap: 8,
            max_chunk_retries: 5,
            chunk_timeout_min: 5.0,
            connect_timeout_secs: 30,
            idle_timeout_secs: 60,
            skip_verification: false,
            disable_chunked: false,
            circuit_breaker_mode: BreakerMode::PerHost,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_reset_secs: 60,
            host_breaker_failure_threshold: 10,
            host_breaker_reset_secs: 60,
            host_allowlist: Vec::new(),
            max_redirects: 5,
            host_rate_limit: 30,
            ipc_rate_limit: 60,
            rate_window_secs: 10,
            workers_min: 1,
            workers_max: 0,
            priority_weight: 1000.0,
            age_weight: 1.0,
            user_agent: concat!("dpanahub/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    /// Reject out-of-range values before any component is built
    pub fn validate(&self) -> Result<(), EngineError> {
        fn check(ok: bool, what: &str) -> Result<(), EngineError> {
            if ok {
                Ok(())
            } else {
                Err(EngineError::Validation(format!("config: {what}")))
            }
        }

        check(
            (1..=10).contains(&self.max_parallel_downloads),
            "max_parallel_downloads must be in 1..=10",
        )?;
        check(self.max_per_host >= 1, "max_per_host must be >= 1")?;
        check(
            (1..=16).contains(&self.max_chunks_per_download),
            "max_chunks_per_download must be in 1..=16",
        )?;
        check(
            (self.max_chunks_per_download..=16).contains(&self.chunk_concurrency_cap),
            "chunk_concurrency_cap must be in max_chunks_per_download..=16",
        )?;
        check(
            self.max_chunk_retries <= 50,
            "max_chunk_retries must be in 0..=50",
        )?;
        check(
            (0.5..=60.0).contains(&self.chunk_timeout_min),
            "chunk_timeout_min must be in 0.5..=60",
        )?;
        check(self.connect_timeout_secs >= 1, "connect_timeout_secs must be >= 1")?;
        check(self.idle_timeout_secs >= 1, "idle_timeout_secs must be >= 1")?;
        check(self.rate_window_secs >= 1, "rate_window_secs must be >= 1")?;
        check(self.workers_min >= 1, "workers_min must be >= 1")?;
        if self.workers_max != 0 {
            check(
                self.workers_max >= self.workers_min,
                "workers_max must be 0 or >= workers_min",
            )?;
        }
        check(self.priority_weight >= 0.0, "priority_weight must be >= 0")?;
        check(self.age_weight >= 0.0, "age_weight must be >= 0")?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_timeout_min * 60.0)
    }

    /// Effective worker pool upper bound
    pub fn effective_workers_max(&self) -> usize {
        if self.workers_max == 0 {
            std::cmp::max(2, num_cpus::get().saturating_sub(1))
        } else {
            self.workers_max
        }
        .max(self.workers_min)
    }

    /// Whether a hostname is admitted by the allow-list
    pub fn host_allowed(&self, host: &str) -> bool {
        self.host_allowlist.is_empty()
            || self
                .host_allowlist
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host))
    }
}
