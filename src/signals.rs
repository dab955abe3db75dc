use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::resilience::rate_limiter::RateLimiterSnapshot;
use crate::sync::PermitPoolSnapshot;
use serde::Serialize;

/// A point-in-time view of the primitives guarding one dependency.
///
/// Facts only, no policy: callers build load shedding or routing decisions on
/// top of these numbers. Each field is `None` when the primitive is not
/// configured.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalsSnapshot {
    pub permit_pool: Option<PermitPoolSnapshot>,
    pub rate_limiter: Option<RateLimiterSnapshot>,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
}

impl SignalsSnapshot {
    /// True when a call issued now would not have to wait or be rejected.
    ///
    /// Best effort: the answer can change before the call is made.
    pub fn is_ready(&self) -> bool {
        let permits = self
            .permit_pool
            .as_ref()
            .map(|p| p.available > 0)
            .unwrap_or(true);
        let tokens = self
            .rate_limiter
            .as_ref()
            .map(|r| r.tokens > 0)
            .unwrap_or(true);
        let circuit = self
            .circuit_breaker
            .as_ref()
            .map(|c| c.open_remaining_ms.is_none())
            .unwrap_or(true);
        permits && tokens && circuit
    }
}
