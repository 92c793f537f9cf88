use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breakers over failing endpoints
///
/// A breaker short-circuits attempts against a host that keeps failing,
/// so retry storms do not pile onto a dead mirror. Wiring is chosen by
/// configuration: off, one global breaker, or one per hostname.
use crate::config::{BreakerMode, EngineConfig};
use crate::core::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Rejecting everything until the cooldown elapses
    Open,
    /// Admitting a single probe to test recovery
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Gate an attempt; Err means the caller must not touch the network
    pub fn admit(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.reset_timeout {
                    info!(breaker = %self.name, "Breaker half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(EngineError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    info!(breaker = %self.name, "Breaker closed after recovery");
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                }
            }
            // success while open can only come from a request admitted
            // before the trip; the cooldown still applies
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    /// Run `f` under the breaker
    ///
    /// Cancellation does not count against the endpoint.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.admit()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(EngineError::Cancelled) => {
                let mut inner = self.inner.lock().unwrap();
                inner.probe_in_flight = false;
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn force_open_at(&self, opened_at: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Open;
        inner.opened_at = Some(opened_at);
    }
}

/// Owns all breakers of one engine instance; torn down with it
pub struct BreakerRegistry {
    mode: BreakerMode,
    global: Arc<CircuitBreaker>,
    per_host: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    host_failure_threshold: u32,
    host_success_threshold: u32,
    host_reset_timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            mode: config.circuit_breaker_mode,
            global: Arc::new(CircuitBreaker::new(
                "global",
                config.breaker_failure_threshold,
                config.breaker_success_threshold,
                Duration::from_secs(config.breaker_reset_secs),
            )),
            per_host: Mutex::new(HashMap::new()),
            host_failure_threshold: config.host_breaker_failure_threshold,
            host_success_threshold: config.breaker_success_threshold,
            host_reset_timeout: Duration::from_secs(config.host_breaker_reset_secs),
        }
    }

    /// The breaker guarding `host`, or None when breakers are off
    pub fn for_host(&self, host: &str) -> Option<Arc<CircuitBreaker>> {
        match self.mode {
            BreakerMode::Off => None,
            BreakerMode::Global => Some(self.global.clone()),
            BreakerMode::PerHost => {
                let mut per_host = self.per_host.lock().unwrap();
                Some(
                    per_host
                        .entry(host.to_string())
                        .or_insert_with(|| {
                            debug!(host, "Creating per-host breaker");
                            Arc::new(CircuitBreaker::new(
                                host,
                                self.host_failure_threshold,
                                self.host_success_threshold,
                                self.host_reset_timeout,
                            ))
                        })
                        .clone(),
                )
            }
        }
    }

    /// Whether the scheduler may start work against `host` right now
    pub fn host_admittable(&self, host: &str) -> bool {
        match self.for_host(host) {
            None => true,
            Some(breaker) => !matches!(breaker.state(), BreakerState::Open),
        }
    }

    /// Breaker states for session metrics
    pub fn states(&self) -> Vec<(String, &'static str)> {
        match self.mode {
            BreakerMode::Off => Vec::new(),
            BreakerMode::Global => vec![("global".to_string(), self.global.state().as_str())],
            BreakerMode::PerHost => {
                let per_host = self.per_host.lock().unwrap();
                per_host
                    .iter()
                    .map(|(host, b)| (host.clone(), b.state().as_str()))
                    .collect()
            }
        }
    }

    /// Drop every breaker; nothing survives shutdown
    pub fn clear(&self) {
        self.per_host.lock().unwrap().clear();
    }
}
