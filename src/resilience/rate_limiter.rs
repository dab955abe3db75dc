use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub rps: f64,
    pub burst: u32,
    pub tokens: u32,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Tokens per second.
    pub rps: f64,
    /// Maximum buffered tokens. Defaults to one second worth, at least 1.
    #[serde(default)]
    pub burst: Option<u32>,
    /// Tokens available before the first refill tick.
    #[serde(default)]
    pub initial_tokens: u32,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self {
            rps,
            burst: None,
            initial_tokens: 0,
        })
    }

    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            rps: 10.0,
            burst: None,
            initial_tokens: 0,
        }
    }

    /// Set the maximum tokens (burst size)
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.burst = Some(tokens);
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.rps = rate;
        self
    }

    pub fn with_initial_tokens(mut self, tokens: u32) -> Self {
        self.initial_tokens = tokens;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.burst
            .unwrap_or_else(|| self.rps.ceil() as u32)
            .max(1)
    }

    /// Interval between two refill ticks. Saturates at [`Duration::MAX`] for
    /// rates too small to express; such configs fail validation.
    pub fn period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.rps)
            .unwrap_or(Duration::MAX)
            .max(Duration::from_nanos(1))
    }

    fn validate(&self) -> Result<Duration> {
        let invalid = |message: &str| {
            Error::configuration_with_context(
                message.to_string(),
                ErrorContext::new()
                    .with_field_path("rate_limiter.rps")
                    .with_details(format!("got {}", self.rps))
                    .with_source("rate_limiter"),
            )
        };
        if !self.rps.is_finite() || self.rps <= 0.0 {
            return Err(invalid(
                "rate must be a positive, finite number of tokens per second",
            ));
        }
        // The first refill tick must land on a representable instant.
        let period = Duration::try_from_secs_f64(1.0 / self.rps)
            .ok()
            .filter(|p| std::time::Instant::now().checked_add(*p).is_some())
            .ok_or_else(|| invalid("rate is too small to schedule a refill tick"))?;
        Ok(period.max(Duration::from_nanos(1)))
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Token-bucket rate limiter with a background refill task.
///
/// One token is added every `1/rps`; ticks that find the bucket full are
/// discarded. The refill task lives until [`stop`](Self::stop) or until the
/// limiter is dropped.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    capacity: u32,
    tokens: Arc<Semaphore>,
    stop: CancellationToken,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Start a limiter. Must be called from within a tokio runtime.
    pub fn new(cfg: RateLimiterConfig) -> Result<Self> {
        let period = cfg.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "rate limiter needs a tokio runtime for its refill task",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("rate_limiter"),
            )
        })?;

        let capacity = cfg.capacity();
        let initial = cfg.initial_tokens.min(capacity);
        let tokens = Arc::new(Semaphore::new(initial as usize));
        let stop = CancellationToken::new();
        let task = runtime.spawn(run_refill_loop(
            Arc::clone(&tokens),
            capacity,
            period,
            stop.clone(),
        ));

        Ok(Self {
            cfg,
            capacity,
            tokens,
            stop,
            stopped: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Try to acquire a token without waiting, returns true if successful
    pub fn try_acquire(&self) -> bool {
        self.allow()
    }

    /// Wait for a token, or fail with [`Error::Cancelled`] once `cancel` fires.
    ///
    /// Waiting on a stopped, empty limiter fails instead of hanging.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled("rate_limiter")),
            permit = self.tokens.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(stopped_error()),
            },
            _ = self.stop.cancelled() => Err(stopped_error()),
        }
    }

    /// Acquire one token (may sleep).
    pub async fn acquire(&self) -> Result<()> {
        self.wait(&CancellationToken::new()).await
    }

    /// Stop refilling. Safe to call any number of times, from any task.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop.cancel();
            info!(rps = self.cfg.rps, "rate limiter stopped");
        }
    }

    /// Stop refilling and wait for the refill task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "rate limiter refill task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        match self.task.lock() {
            Ok(task) => task.as_ref().map(|t| !t.is_finished()).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let tokens = (self.tokens.available_permits() as u32).min(self.capacity);
        let running = self.is_running();
        let estimated_wait_ms = if tokens == 0 && running {
            Some(self.cfg.period().as_millis() as u64)
        } else {
            None
        };
        RateLimiterSnapshot {
            rps: self.cfg.rps,
            burst: self.capacity,
            tokens,
            estimated_wait_ms,
            running,
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn stopped_error() -> Error {
    Error::runtime_with_context(
        "rate limiter stopped",
        ErrorContext::new().with_source("rate_limiter"),
    )
}

/// Refill loop: one token per tick, never more than `capacity` buffered.
async fn run_refill_loop(
    tokens: Arc<Semaphore>,
    capacity: u32,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(
        period_us = period.as_micros() as u64,
        capacity, "rate limiter refill task started"
    );

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("rate limiter refill task shutting down");
                break;
            }
            _ = ticker.tick() => {
                // Only this task adds tokens, so check-then-add cannot overshoot.
                if tokens.available_permits() < capacity as usize {
                    tokens.add_permits(1);
                }
            }
        }
    }
}
