use flowguard::{CancellationToken, KeyedLock, PermitPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

#[test]
fn test_waiter_wakes_when_permit_returns() {
    let pool = PermitPool::new(1).unwrap();
    let held = pool.try_acquire().unwrap();

    let mut waiter = tokio_test::task::spawn(pool.acquire());
    assert_pending!(waiter.poll());

    drop(held);
    assert!(waiter.is_woken());
    let permit = assert_ready!(waiter.poll()).unwrap();
    assert_eq!(pool.outstanding(), 1);
    drop(permit);
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_detached_permit_needs_release() {
    let pool = PermitPool::new(2).unwrap();
    pool.try_acquire().unwrap().detach();
    assert_eq!(pool.outstanding(), 1);

    pool.release();
    assert_eq!(pool.outstanding(), 0);

    // Over-release is clamped.
    pool.release();
    assert_eq!(pool.available(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_bounds_concurrency_under_load() {
    let pool = PermitPool::new(4).unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..64 {
        let pool = pool.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let _permit = pool.acquire().await.unwrap();
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            current.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test]
async fn test_distinct_keys_do_not_block() {
    let locks: KeyedLock<&'static str> = KeyedLock::new();
    let _a = locks.lock("a").await;

    let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b")).await;
    assert!(b.is_ok());
    assert!(locks.try_lock("a").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_is_serialized() {
    let locks: KeyedLock<u32> = KeyedLock::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let locks = locks.clone();
        let inside = Arc::clone(&inside);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let _guard = locks.lock(7).await;
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(locks.is_empty());
}

#[tokio::test]
async fn test_key_map_does_not_grow() {
    let locks: KeyedLock<String> = KeyedLock::new();
    for i in 0..1_000 {
        let guard = locks.lock(format!("user-{}", i)).await;
        assert_eq!(guard.key(), &format!("user-{}", i));
    }
    assert_eq!(locks.len(), 0);
}

#[tokio::test]
async fn test_cancelled_lock_wait_leaves_no_entry() {
    let locks: KeyedLock<u8> = KeyedLock::new();
    let held = locks.lock(1).await;

    let cancel = CancellationToken::new();
    let waiter = {
        let locks = locks.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { locks.lock_cancellable(1, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
    drop(held);
    assert!(locks.is_empty());
}

#[tokio::test]
async fn test_detached_hold_released_by_unlock() {
    let locks: KeyedLock<u8> = KeyedLock::new();
    locks.lock(3).await.detach();
    assert!(locks.try_lock(3).is_none());

    locks.unlock(&3).unwrap();
    assert!(locks.is_empty());
    assert!(locks.try_lock(3).is_some());

    let err = locks.unlock(&3).unwrap_err();
    assert!(matches!(err, flowguard::Error::LockMisuse { .. }));
}
