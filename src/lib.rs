//! # flowguard
//!
//! 面向异步服务的并发控制工具包：许可池、按键互斥锁、令牌桶限流、熔断器与多阶段流水线。
//!
//! Concurrency-control primitives for tokio services: bound how much work runs
//! at once, serialize work per key, throttle throughput, stop calling a failing
//! dependency, and move items through a multi-stage worker pipeline with
//! back-pressure.
//!
//! ## Core Philosophy
//!
//! - **Explicit instances**: no process-wide state; every primitive is constructed,
//!   owned, and shared by the caller
//! - **Cancellable waits**: every blocking operation has a variant that takes a
//!   [`CancellationToken`] and returns [`Error::Cancelled`] without side effects
//! - **RAII release**: permits and locks come back when their guard is dropped
//!
//! ## Quick Start
//!
//! ```rust
//! use flowguard::{CancellationToken, Gate, PermitPool};
//! use flowguard::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> flowguard::Result<()> {
//! let gate = Gate::builder()
//!     .permit_pool(PermitPool::new(4)?)
//!     .circuit_breaker(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new())))
//!     .build();
//!
//! let value = gate
//!     .run(|| async { Ok::<_, std::io::Error>(42) }, &CancellationToken::new())
//!     .await
//!     .map_err(|e| e.to_string());
//! assert_eq!(value, Ok(42));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`sync`] | Permit pool and keyed lock |
//! | [`resilience`] | Token-bucket rate limiter and circuit breaker |
//! | [`pipeline`] | Multi-stage worker pipeline with bounded queues |
//! | [`gate`] | Limiter, breaker and permit pool composed around one call |
//! | [`signals`] | Serializable snapshots of primitive state |
//! | [`config`] | YAML/JSON configuration for every primitive |
//! | [`clock`] | Injectable time source |

pub mod clock;
pub mod config;
pub mod gate;
pub mod pipeline;
pub mod resilience;
pub mod signals;
pub mod sync;

// Re-export main types for convenience
pub use config::ToolkitConfig;
pub use gate::{Gate, GateBuilder};
pub use pipeline::{ErrorPolicy, Pipeline, PipelineBuilder, PipelineRun, StageError};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
pub use signals::SignalsSnapshot;
pub use sync::{KeyedLock, PermitPool};
pub use tokio_util::sync::CancellationToken;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{CallError, Error, ErrorContext};
