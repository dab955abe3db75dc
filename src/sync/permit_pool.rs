use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct PermitPoolSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermitPoolConfig {
    pub capacity: usize,
}

impl Default for PermitPoolConfig {
    fn default() -> Self {
        Self { capacity: 1 }
    }
}

impl PermitPoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

/// Bounded counting semaphore.
///
/// Waiters are not served in any promised order. Permits come back either by
/// dropping the [`PoolPermit`] guard or, for detached permits, through
/// [`PermitPool::release`].
#[derive(Debug, Clone)]
pub struct PermitPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

/// A held permit. Returned to the pool on drop.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct PoolPermit {
    permit: OwnedSemaphorePermit,
}

impl PoolPermit {
    /// Keep the permit held past the guard's lifetime. The caller becomes
    /// responsible for a matching [`PermitPool::release`].
    pub fn detach(self) {
        self.permit.forget();
    }
}

impl PermitPool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::configuration_with_context(
                "permit pool capacity must be positive",
                ErrorContext::new()
                    .with_field_path("permit_pool.capacity")
                    .with_source("permit_pool"),
            ));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(Error::configuration_with_context(
                "permit pool capacity too large",
                ErrorContext::new()
                    .with_field_path("permit_pool.capacity")
                    .with_details(format!("max {}", Semaphore::MAX_PERMITS))
                    .with_source("permit_pool"),
            ));
        }
        Ok(Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        })
    }

    pub fn from_config(cfg: &PermitPoolConfig) -> Result<Self> {
        Self::new(cfg.capacity)
    }

    /// Wait until a permit is free.
    pub async fn acquire(&self) -> Result<PoolPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed_error())?;
        Ok(PoolPermit { permit })
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| PoolPermit { permit })
    }

    /// Wait for a permit or for `cancel` to fire. Nothing is consumed on cancel.
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<PoolPermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled("permit_pool")),
            permit = self.acquire() => permit,
        }
    }

    /// Return a permit previously kept with [`PoolPermit::detach`].
    ///
    /// Releasing more than was acquired is clamped at `capacity`.
    pub fn release(&self) {
        if self.semaphore.available_permits() >= self.capacity {
            tracing::warn!(
                capacity = self.capacity,
                "permit released with none outstanding; ignoring"
            );
            return;
        }
        self.semaphore.add_permits(1);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits().min(self.capacity)
    }

    pub fn outstanding(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn snapshot(&self) -> PermitPoolSnapshot {
        let available = self.available();
        PermitPoolSnapshot {
            max: self.capacity,
            available,
            in_use: self.capacity - available,
        }
    }
}

fn closed_error() -> Error {
    Error::runtime_with_context(
        "permit pool semaphore closed",
        ErrorContext::new().with_source("permit_pool"),
    )
}
