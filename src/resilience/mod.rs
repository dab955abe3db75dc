//! 弹性模式模块：提供熔断器和限流器等可靠性保障机制。
//!
//! # Resilience Primitives Module
//!
//! Primitives that wrap individual calls to protect a downstream dependency
//! and the caller from overload and repeated failure.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Circuit breaker pattern for failure isolation |
//! | [`rate_limiter`] | Token bucket rate limiter for throughput control |
//!
//! ## Circuit Breaker
//!
//! The circuit breaker prevents repeated calls to a failing service:
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Failures reached the threshold, requests fail fast
//! - **Half-Open**: A bounded number of probes test whether the service recovered
//!
//! ```rust
//! use flowguard::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new(config);
//!
//! let result = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>("pong") })
//!     .await;
//! assert!(result.is_ok());
//! # }
//! ```
//!
//! ## Rate Limiter
//!
//! The rate limiter refills a token bucket from a background task owned by
//! the limiter:
//!
//! ```rust
//! use flowguard::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> flowguard::Result<()> {
//! let config = RateLimiterConfig::new()
//!     .with_max_tokens(100)
//!     .with_refill_rate(10.0) // 10 tokens per second
//!     .with_initial_tokens(1);
//! let limiter = RateLimiter::new(config)?;
//!
//! if limiter.try_acquire() {
//!     // Proceed with request...
//! }
//! limiter.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    CallGuard, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
