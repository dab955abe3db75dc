//! Unified admission for calls to one dependency.
//!
//! A [`Gate`] runs each call through, in order:
//! - the rate limiter (optional), waiting for a token
//! - the circuit breaker (optional), which may reject outright
//! - the permit pool (optional), holding a permit for the whole call
//!
//! The rate token and the breaker decision are per-call gates; the permit is
//! held until the operation finishes. A call the breaker would refuse is
//! turned away before it takes a rate token.

use crate::config::ToolkitConfig;
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::signals::SignalsSnapshot;
use crate::sync::PermitPool;
use crate::{CallError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Default)]
pub struct Gate {
    rate_limiter: Option<Arc<RateLimiter>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    permit_pool: Option<PermitPool>,
}

#[derive(Default)]
pub struct GateBuilder {
    gate: Gate,
}

impl GateBuilder {
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.gate.rate_limiter = Some(limiter);
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.gate.circuit_breaker = Some(breaker);
        self
    }

    pub fn permit_pool(mut self, pool: PermitPool) -> Self {
        self.gate.permit_pool = Some(pool);
        self
    }

    pub fn build(self) -> Gate {
        self.gate
    }
}

impl Gate {
    pub fn builder() -> GateBuilder {
        GateBuilder::default()
    }

    /// Build every primitive present in `config`.
    ///
    /// Starts the rate limiter's refill task, so it must be called inside a
    /// tokio runtime when a limiter is configured.
    pub fn from_config(config: &ToolkitConfig) -> Result<Self> {
        let mut builder = Gate::builder();
        if let Some(cfg) = &config.rate_limiter {
            builder = builder.rate_limiter(Arc::new(RateLimiter::new(cfg.clone())?));
        }
        if let Some(cfg) = &config.circuit_breaker {
            builder = builder.circuit_breaker(Arc::new(CircuitBreaker::new(cfg.clone())));
        }
        if let Some(cfg) = &config.permit_pool {
            builder = builder.permit_pool(PermitPool::from_config(cfg)?);
        }
        Ok(builder.build())
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    pub fn permit_pool(&self) -> Option<&PermitPool> {
        self.permit_pool.as_ref()
    }

    /// Admit and run `op`.
    ///
    /// Refusals (cancelled waits, open circuit) come back as
    /// [`CallError::Rejected`] with `op` never invoked; the operation's own
    /// error comes back as [`CallError::Operation`] and counts as a breaker
    /// failure.
    pub async fn run<F, Fut, T, E>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            if let Some(breaker) = &self.circuit_breaker {
                breaker.check()?;
            }
            limiter.wait(cancel).await?;
        }
        let guard = match &self.circuit_breaker {
            Some(breaker) => Some(breaker.allow()?),
            None => None,
        };
        // A cancelled permit wait drops the breaker guard, which frees any
        // half-open probe slot it took.
        let _permit = match &self.permit_pool {
            Some(pool) => Some(pool.acquire_cancellable(cancel).await?),
            None => None,
        };

        let result = op().await;
        match (&result, guard) {
            (Ok(_), Some(guard)) => guard.success(),
            (Err(_), Some(guard)) => {
                debug!("gated call failed");
                guard.failure();
            }
            (_, None) => {}
        }
        result.map_err(CallError::Operation)
    }

    pub fn signals(&self) -> SignalsSnapshot {
        SignalsSnapshot {
            permit_pool: self.permit_pool.as_ref().map(PermitPool::snapshot),
            rate_limiter: self.rate_limiter.as_ref().map(|l| l.snapshot()),
            circuit_breaker: self.circuit_breaker.as_ref().map(|b| b.snapshot()),
        }
    }
}
