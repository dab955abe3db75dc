//! 同步原语模块：许可池与按键互斥锁。
//!
//! # Synchronization Primitives
//!
//! Building blocks callers acquire and release directly around critical
//! sections.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PermitPool`] | Bounded counting semaphore |
//! | [`KeyedLock`] | Per-key mutual exclusion with automatic entry cleanup |
//!
//! Both hand out RAII guards. Guards can be detached for callers that need an
//! explicit acquire/release pair spanning scopes; the matching
//! [`PermitPool::release`] / [`KeyedLock::unlock`] returns the hold.
//!
//! ```rust
//! use flowguard::sync::{KeyedLock, PermitPool};
//!
//! # #[tokio::main]
//! # async fn main() -> flowguard::Result<()> {
//! let pool = PermitPool::new(4)?;
//! let _slot = pool.acquire().await?;
//!
//! let locks = KeyedLock::new();
//! let _user = locks.lock("user:42").await;
//! # Ok(())
//! # }
//! ```

pub mod keyed_lock;
pub mod permit_pool;

pub use keyed_lock::{KeyedLock, KeyedLockGuard};
pub use permit_pool::{PermitPool, PermitPoolConfig, PermitPoolSnapshot, PoolPermit};
