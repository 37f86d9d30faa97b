mod common;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use d_coord::service::MemoryEnsemble;
use d_coord::service::WatchedEvent;
use d_coord::DistributedLock;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;

use crate::common::connect;
use crate::common::WATCH_WAKE_LATENCY_MS;

const LOCK_PATH: &str = "/locks/compaction";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_is_woken_by_watch_not_by_polling() {
    let ensemble = MemoryEnsemble::new();
    let holder = DistributedLock::new(connect(&ensemble).await, LOCK_PATH);
    let waiter = DistributedLock::new(connect(&ensemble).await, LOCK_PATH);
    holder.acquire().await.unwrap();

    let (acquired_tx, acquired_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        waiter.acquire().await.unwrap();
        let _ = acquired_tx.send(Instant::now());
        waiter
    });

    // hold for a while so a polling waiter would have to poll
    sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());

    let observer = connect(&ensemble).await;
    let (fired_tx, fired_rx) = oneshot::channel();
    let present = observer
        .exists(
            LOCK_PATH,
            Some(Box::new(move |_event: WatchedEvent| {
                let _ = fired_tx.send(Instant::now());
            })),
        )
        .await
        .unwrap();
    assert!(present);

    holder.release().await.unwrap();
    let fired_at = timeout(Duration::from_secs(2), fired_rx).await.unwrap().unwrap();
    let acquired_at = timeout(Duration::from_secs(2), acquired_rx).await.unwrap().unwrap();

    let wake_latency = acquired_at.saturating_duration_since(fired_at);
    assert!(
        wake_latency < Duration::from_millis(WATCH_WAKE_LATENCY_MS),
        "waiter took {wake_latency:?} after the watch fired"
    );
    let waiter = handle.await.unwrap();
    assert!(waiter.is_locked().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contenders_never_overlap() {
    let ensemble = MemoryEnsemble::new();
    let inside = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let lock = DistributedLock::new(connect(&ensemble).await, LOCK_PATH);
        let inside = inside.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..4 {
                let guard = lock.lock().await.unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                sleep(Duration::from_millis(2)).await;
                inside.store(false, Ordering::SeqCst);
                guard.release().await.unwrap();
            }
        }));
    }

    let results = timeout(Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("contenders should finish");
    for result in results {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_holder_releases_through_session_expiry() {
    let ensemble = MemoryEnsemble::new();
    let holder_conn = connect(&ensemble).await;
    let holder = DistributedLock::new(holder_conn.clone(), LOCK_PATH);
    let waiter = DistributedLock::new(connect(&ensemble).await, LOCK_PATH);
    holder.acquire().await.unwrap();

    let handle = tokio::spawn(async move { waiter.acquire().await });
    sleep(Duration::from_millis(50)).await;
    ensemble.expire_session(holder_conn.session_id().unwrap());

    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
}
