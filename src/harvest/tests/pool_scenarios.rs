use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use super::mock_browser::{fixed_surface, MockBrowser, MockFactory};
use crate::harvest::session_pool::{PoolError, PoolStatus, SessionPool};

async fn pool_of(size: usize) -> SessionPool<MockBrowser> {
    SessionPool::new(&MockFactory::new(fixed_surface(Vec::new())), size)
        .await
        .expect("pool")
}

#[tokio::test]
async fn test_never_more_leases_than_sessions() {
    let pool = pool_of(2).await;
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..5 {
        let pool = pool.clone();
        let in_use = Arc::clone(&in_use);
        let peak = Arc::clone(&peak);
        workers.spawn(async move {
            let lease = pool.acquire(Duration::from_secs(5)).await.expect("lease");
            let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(pool.status().busy <= 2);
            tokio::time::sleep(Duration::from_millis(20)).await;
            in_use.fetch_sub(1, Ordering::SeqCst);
            lease.release();
        });
    }
    while let Some(joined) = workers.join_next().await {
        joined.expect("worker");
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.status(), PoolStatus { total: 2, busy: 0, available: 2 });
}

#[tokio::test]
async fn test_acquire_times_out_with_none() {
    let pool = pool_of(1).await;
    let held = pool.acquire(Duration::from_millis(10)).await.expect("first lease");

    assert!(pool.acquire(Duration::from_millis(50)).await.is_none());

    drop(held);
    let again = pool.acquire(Duration::from_millis(10)).await.expect("freed by drop");
    assert_eq!(again.id(), 0);
}

#[tokio::test]
async fn test_partial_creation_keeps_survivors() {
    let mut factory = MockFactory::new(fixed_surface(Vec::new()));
    factory.failing_ids.insert(1);
    let pool = SessionPool::new(&factory, 3).await.expect("pool");
    assert_eq!(pool.size(), 2);

    let first = pool.acquire(Duration::from_millis(10)).await.expect("lease");
    let second = pool.acquire(Duration::from_millis(10)).await.expect("lease");
    let mut ids = vec![first.id(), second.id()];
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 2]);
}

#[tokio::test]
async fn test_no_sessions_is_an_error() {
    let mut factory = MockFactory::new(fixed_surface(Vec::new()));
    factory.failing_ids.extend([0, 1]);

    match SessionPool::new(&factory, 2).await {
        Err(PoolError::NoSessions { requested }) => assert_eq!(requested, 2),
        Ok(_) => panic!("pool without sessions was created"),
    }
}

#[tokio::test]
async fn test_close_all_quits_once_and_empties() {
    let pool = pool_of(2).await;
    let flags: Vec<_> = {
        let a = pool.acquire(Duration::from_millis(10)).await.expect("lease");
        let b = pool.acquire(Duration::from_millis(10)).await.expect("lease");
        vec![a.session().quit_flag(), b.session().quit_flag()]
    };
    assert!(pool.wait_for_all_released(Duration::from_millis(50)).await);

    pool.close_all().await;
    pool.close_all().await;

    assert!(flags.iter().all(|flag| flag.load(Ordering::SeqCst)));
    assert_eq!(pool.size(), 0);
    assert!(pool.acquire(Duration::from_millis(10)).await.is_none());
}

#[tokio::test]
async fn test_wait_for_release_times_out_while_leased() {
    let pool = pool_of(1).await;
    let lease = pool.acquire(Duration::from_millis(10)).await.expect("lease");

    assert!(!pool.wait_for_all_released(Duration::from_millis(50)).await);
    pool.release(lease.id());
    pool.release(lease.id());
    assert_eq!(pool.status().busy, 0);

    lease.release();
    assert_eq!(pool.status().available, 1);
}
