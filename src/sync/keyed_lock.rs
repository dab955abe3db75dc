use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    /// Holders plus waiters.
    refs: usize,
    /// Hold parked by [`KeyedLockGuard::detach`], released by `unlock`.
    detached: Option<OwnedMutexGuard<()>>,
}

struct Shared<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash> Shared<K> {
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_ref(&self, key: &K) {
        let mut entries = self.entries();
        release_ref_locked(&mut entries, key);
    }
}

fn release_ref_locked<K: Eq + Hash>(entries: &mut HashMap<K, Entry>, key: &K) {
    if let Some(entry) = entries.get_mut(key) {
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
        }
    }
}

/// Reference held on a map entry; dropping it gives the reference back.
struct Ticket<K: Eq + Hash> {
    shared: Arc<Shared<K>>,
    key: K,
    armed: bool,
}

impl<K: Eq + Hash> Drop for Ticket<K> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_ref(&self.key);
        }
    }
}

/// Mutual exclusion scoped to a key.
///
/// Locks on different keys never contend. Entries are created on first use and
/// evicted as soon as the last holder or waiter for the key is gone, so the map
/// only ever contains keys that are in use.
pub struct KeyedLock<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Exclusive hold on one key. Dropping it unlocks.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyedLockGuard<K: Eq + Hash> {
    held: Option<OwnedMutexGuard<()>>,
    ticket: Ticket<K>,
}

impl<K: Eq + Hash> KeyedLockGuard<K> {
    pub fn key(&self) -> &K {
        &self.ticket.key
    }

    /// Keep the key locked after the guard goes away. Release it later with
    /// [`KeyedLock::unlock`].
    pub fn detach(mut self) {
        if let Some(held) = self.held.take() {
            let mut entries = self.ticket.shared.entries();
            if let Some(entry) = entries.get_mut(&self.ticket.key) {
                entry.detached = Some(held);
            }
        }
        // The parked hold now owns the reference.
        self.ticket.armed = false;
    }
}

impl<K: Eq + Hash + std::fmt::Debug> std::fmt::Debug for KeyedLockGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockGuard")
            .field("key", &self.ticket.key)
            .finish_non_exhaustive()
    }
}

impl<K: Eq + Hash> Drop for KeyedLockGuard<K> {
    fn drop(&mut self) {
        // Unlock before the ticket gives its reference back.
        drop(self.held.take());
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve(&self, key: K) -> (Ticket<K>, Arc<AsyncMutex<()>>) {
        let mut entries = self.shared.entries();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            lock: Arc::new(AsyncMutex::new(())),
            refs: 0,
            detached: None,
        });
        entry.refs += 1;
        let lock = Arc::clone(&entry.lock);
        drop(entries);
        (
            Ticket {
                shared: Arc::clone(&self.shared),
                key,
                armed: true,
            },
            lock,
        )
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: K) -> KeyedLockGuard<K> {
        let (ticket, lock) = self.reserve(key);
        let held = lock.lock_owned().await;
        KeyedLockGuard {
            held: Some(held),
            ticket,
        }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<KeyedLockGuard<K>> {
        let (ticket, lock) = self.reserve(key);
        let held = lock.try_lock_owned().ok()?;
        Some(KeyedLockGuard {
            held: Some(held),
            ticket,
        })
    }

    /// Like [`lock`](Self::lock), but gives up when `cancel` fires. A cancelled
    /// waiter leaves no trace in the map.
    pub async fn lock_cancellable(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<KeyedLockGuard<K>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled("keyed_lock")),
            guard = self.lock(key) => Ok(guard),
        }
    }

    /// Release a hold that was parked with [`KeyedLockGuard::detach`].
    ///
    /// Returns [`Error::LockMisuse`] if `key` has no detached hold; the map is
    /// left untouched in that case.
    pub fn unlock(&self, key: &K) -> Result<()> {
        let mut entries = self.shared.entries();
        let parked = entries.get_mut(key).and_then(|e| e.detached.take());
        match parked {
            Some(held) => {
                drop(held);
                release_ref_locked(&mut entries, key);
                Ok(())
            }
            None => {
                tracing::warn!(key = ?key, "unlock called for a key that is not held");
                Err(Error::LockMisuse {
                    key: format!("{:?}", key),
                })
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_unlock() {
        let locks = KeyedLock::new();
        {
            let guard = locks.lock("a").await;
            assert_eq!(*guard.key(), "a");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLock::new();
        let _a = locks.lock("a".to_string()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b".to_string())).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_try_lock_same_key() {
        let locks = KeyedLock::new();
        let held = locks.try_lock(7u64);
        assert!(held.is_some());
        assert!(locks.try_lock(7u64).is_none());
        // The failed attempt gave its reference back.
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_cleans_up() {
        let locks = KeyedLock::new();
        let held = locks.lock(1u32).await;

        let cancel = CancellationToken::new();
        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.lock_cancellable(1u32, &cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_detach_then_unlock() {
        let locks = KeyedLock::new();
        locks.lock("job-1").await.detach();
        assert_eq!(locks.len(), 1);
        assert!(locks.try_lock("job-1").is_none());

        locks.unlock(&"job-1").unwrap();
        assert!(locks.is_empty());
        assert!(locks.try_lock("job-1").is_some());
    }

    #[tokio::test]
    async fn test_unlock_unheld_key_is_misuse() {
        let locks: KeyedLock<&str> = KeyedLock::new();
        let err = locks.unlock(&"ghost").unwrap_err();
        assert!(matches!(err, Error::LockMisuse { .. }));
        assert!(locks.is_empty());

        // A guard-held key has no detached hold either.
        let _guard = locks.lock("live").await;
        assert!(locks.unlock(&"live").is_err());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _g = locks.lock("shared").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }
}
