//! Circuit breaker: trips after a run of failures, probes recovery in a
//! bounded half-open state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed.
    Closed,
    /// Failure threshold exceeded - all calls rejected.
    Open,
    /// Testing if the dependency recovered - limited calls allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                                                            │
///      │                                                            │
///      │              success threshold / any failure reopens       │
///      └────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes required to close the circuit again.
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open.
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Concurrent trial executions permitted while half-open.
    pub half_open_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_half_open_calls(mut self, n: u32) -> Self {
        self.half_open_calls = n.max(1);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    #[error("circuit is open")]
    Open,
    #[error("half-open trial capacity exhausted")]
    HalfOpenSaturated,
}

struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A single circuit breaker instance, guarding one logical dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    half_open_gate: Semaphore,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let half_open_calls = config.half_open_calls as usize;
        Self {
            config,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            half_open_gate: Semaphore::new(half_open_calls),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    /// Request permission to run one call through the breaker.
    ///
    /// While `Open`, permission is denied until `reset_timeout` elapses,
    /// at which point the breaker flips to `HalfOpen` and grants a
    /// bounded number of concurrent trial calls.
    pub fn allow(&self) -> Result<CircuitBreakerPermit<'_>, CircuitBreakerError> {
        let mut state = self.state.lock();

        if state.circuit == CircuitState::Open {
            let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.config.reset_timeout {
                info!("circuit breaker transitioning open -> half_open");
                state.circuit = CircuitState::HalfOpen;
                state.consecutive_successes = 0;
            } else {
                return Err(CircuitBreakerError::Open);
            }
        }

        if state.circuit == CircuitState::HalfOpen {
            let permit = self
                .half_open_gate
                .try_acquire()
                .map_err(|_| CircuitBreakerError::HalfOpenSaturated)?;
            return Ok(CircuitBreakerPermit {
                breaker: self,
                _half_open_permit: Some(permit),
                resolved: false,
            });
        }

        Ok(CircuitBreakerPermit {
            breaker: self,
            _half_open_permit: None,
            resolved: false,
        })
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    info!("circuit breaker transitioning half_open -> closed");
                    state.circuit = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {
                debug!("success recorded while open, ignoring");
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    info!("circuit breaker transitioning closed -> open");
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                info!("circuit breaker transitioning half_open -> open (trial failed)");
                state.circuit = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// RAII permit returned by [`CircuitBreaker::allow`]. The caller must
/// consume it with [`success`](Self::success) or [`failure`](Self::failure)
/// to report the outcome; dropping it unresolved counts as neither.
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    _half_open_permit: Option<SemaphorePermit<'a>>,
    resolved: bool,
}

impl<'a> CircuitBreakerPermit<'a> {
    pub fn success(mut self) {
        self.breaker.record_success();
        self.resolved = true;
    }

    pub fn failure(mut self) {
        self.breaker.record_failure();
        self.resolved = true;
    }
}

/// Shares one [`CircuitBreaker`] per key across callers (job executors
/// configured with the same `breakerKey`).
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_insert(&self, key: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|e| e.clone())
    }

    /// Drops every tracked breaker. Used by test harnesses that need a
    /// process-wide reset between cases (spec §5).
    pub fn clear(&self) {
        self.breakers.clear();
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
