use crate::clock::{self, Clock};
use crate::{CallError, Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub probes_in_flight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// How long the breaker stays open before letting a probe through.
    #[serde(rename = "cooldown_ms", with = "crate::config::duration_ms")]
    pub cooldown: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Alias for with_cooldown for API consistency
    pub fn with_reset_timeout(self, timeout: Duration) -> Self {
        self.with_cooldown(timeout)
    }

    pub fn with_half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes;
        self
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Circuit breaker.
///
/// - Counts consecutive failures while closed
/// - Opens for a cooldown once the threshold is reached
/// - After the cooldown, admits a bounded number of probes; the first probe
///   outcome decides between closing and re-opening
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

/// Admission to run one call. Report the outcome with
/// [`success`](CallGuard::success) or [`failure`](CallGuard::failure);
/// dropping it unreported frees a probe slot without changing state.
#[must_use = "report the call outcome with success() or failure()"]
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallGuard<'_> {
    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandoned_probe();
        }
    }
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(cfg, clock::system())
    }

    pub fn with_clock(cfg: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
            clock,
        }
    }

    fn threshold(&self) -> u32 {
        self.cfg.failure_threshold.max(1)
    }

    fn max_probes(&self) -> u32 {
        self.cfg.half_open_max_probes.max(1)
    }

    /// Ask to run one call.
    ///
    /// Returns [`Error::CircuitOpen`] while open and during half-open once all
    /// probe slots are taken.
    pub fn allow(&self) -> Result<CallGuard<'_>> {
        let now = self.clock.now();
        let mut st = self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "CircuitBreaker poisoned",
                ErrorContext::new().with_source("circuit_breaker"),
            )
        })?;
        if let Some(refusal) = self.refusal(&st, now) {
            return Err(refusal);
        }
        let probe = match st.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                // cooldown expired
                st.state = CircuitState::HalfOpen;
                st.probes_in_flight = 1;
                info!(
                    consecutive_failures = st.consecutive_failures,
                    "circuit breaker half-open, admitting probe"
                );
                true
            }
            CircuitState::HalfOpen => {
                st.probes_in_flight += 1;
                true
            }
        };
        Ok(CallGuard {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Check admission without taking a probe slot or changing state.
    ///
    /// Returns the error [`allow`](Self::allow) would return right now. The
    /// answer can change before a later `allow`.
    pub fn check(&self) -> Result<()> {
        let now = self.clock.now();
        let st = self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "CircuitBreaker poisoned",
                ErrorContext::new().with_source("circuit_breaker"),
            )
        })?;
        match self.refusal(&st, now) {
            Some(refusal) => Err(refusal),
            None => Ok(()),
        }
    }

    fn refusal(&self, st: &State, now: Instant) -> Option<Error> {
        match st.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let elapsed = st
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.cfg.cooldown);
                (elapsed < self.cfg.cooldown).then(|| Error::CircuitOpen {
                    retry_after_ms: Some((self.cfg.cooldown - elapsed).as_millis() as u64),
                })
            }
            CircuitState::HalfOpen => {
                (st.probes_in_flight >= self.max_probes()).then_some(Error::CircuitOpen {
                    retry_after_ms: None,
                })
            }
        }
    }

    /// Run `op` under the breaker.
    ///
    /// The operation's own error comes back as [`CallError::Operation`];
    /// a refused call comes back as [`CallError::Rejected`] without `op`
    /// having been invoked.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let guard = self.allow()?;
        match op().await {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(e) => {
                guard.failure();
                Err(CallError::Operation(e))
            }
        }
    }

    fn on_success(&self, probe: bool) {
        if let Ok(mut st) = self.state.lock() {
            if probe {
                st.probes_in_flight = st.probes_in_flight.saturating_sub(1);
                if st.state == CircuitState::HalfOpen {
                    st.state = CircuitState::Closed;
                    st.consecutive_failures = 0;
                    st.opened_at = None;
                    st.probes_in_flight = 0;
                    info!("circuit breaker closed after successful probe");
                }
            } else if st.state != CircuitState::Open {
                st.consecutive_failures = 0;
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = self.clock.now();
        if let Ok(mut st) = self.state.lock() {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            if probe {
                st.probes_in_flight = st.probes_in_flight.saturating_sub(1);
                if st.state == CircuitState::HalfOpen {
                    st.state = CircuitState::Open;
                    st.opened_at = Some(now);
                    warn!(
                        cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                        "circuit breaker probe failed, re-opening"
                    );
                }
            } else if st.state == CircuitState::Closed
                && st.consecutive_failures >= self.threshold()
            {
                st.state = CircuitState::Open;
                st.opened_at = Some(now);
                warn!(
                    consecutive_failures = st.consecutive_failures,
                    cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
        }
    }

    fn on_abandoned_probe(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.probes_in_flight = st.probes_in_flight.saturating_sub(1);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let cooldown_ms = self.cfg.cooldown.as_millis() as u64;
        if let Ok(st) = self.state.lock() {
            let open_remaining_ms = match (st.state, st.opened_at) {
                (CircuitState::Open, Some(at)) => {
                    let until = at + self.cfg.cooldown;
                    if until > now {
                        Some((until - now).as_millis() as u64)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            CircuitBreakerSnapshot {
                state: st.state,
                failure_threshold: self.cfg.failure_threshold,
                cooldown_ms,
                consecutive_failures: st.consecutive_failures,
                open_remaining_ms,
                probes_in_flight: st.probes_in_flight,
            }
        } else {
            CircuitBreakerSnapshot {
                state: CircuitState::Closed,
                failure_threshold: self.cfg.failure_threshold,
                cooldown_ms,
                consecutive_failures: 0,
                open_remaining_ms: None,
                probes_in_flight: 0,
            }
        }
    }
}
