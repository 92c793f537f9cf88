use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::EngineConfig;

/// Sliding-window rate limiter
///
/// One limiter instance serves many keys: hostnames for request
/// initiation, channel ids for UI/IPC traffic. `allow` counts the call
/// against the key's window and answers whether it fit the budget.
/// Idle keys are dropped by periodic compaction so the map does not
/// grow with every host ever contacted.
pub struct RateLimiter {
    budget: u32,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request against `key`; true while inside the budget
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        if self.budget == 0 {
            return false;
        }
        let mut windows = self.windows.lock().unwrap();
        let entries = windows.entry(key.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() as u32 >= self.budget {
            debug!(key, in_window = entries.len(), "Rate limit exceeded");
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Remaining budget for `key` without consuming any of it
    pub fn remaining(&self, key: &str) -> u32 {
        let now = Instant::now();
        let windows = self.windows.lock().unwrap();
        let used = windows
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count() as u32
            })
            .unwrap_or(0);
        self.budget.saturating_sub(used)
    }

    /// Drop keys with no activity inside the window
    pub fn compact(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, entries| {
            entries
                .back()
                .map(|last| now.duration_since(*last) < self.window)
                .unwrap_or(false)
        });
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

/// The two limiter instances one engine owns
pub struct RateLimiters {
    /// Request initiation per hostname
    pub host: RateLimiter,
    /// Calls per UI/IPC channel
    pub ipc: RateLimiter,
}

impl RateLimiters {
    pub fn new(config: &EngineConfig) -> Self {
        let window = Duration::from_secs(config.rate_window_secs);
        Self {
            host: RateLimiter::new(config.host_rate_limit, window),
            ipc: RateLimiter::new(config.ipc_rate_limit, window),
        }
    }

    pub fn compact(&self) {
        self.host.compact();
        self.ipc.compact();
    }
}
