use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing_test::traced_test;

use super::*;
use crate::service::MemoryEnsemble;
use crate::CoordinatorConfig;

async fn connect(ensemble: &MemoryEnsemble) -> Arc<Connection> {
    let conn = Connection::new(Arc::new(ensemble.clone()), CoordinatorConfig::default());
    conn.open().await.expect("open should succeed");
    Arc::new(conn)
}

#[tokio::test]
#[traced_test]
async fn acquire_then_release() {
    let ensemble = MemoryEnsemble::new();
    let lock = DistributedLock::new(connect(&ensemble).await, "/leader");

    assert!(!lock.is_locked().await.unwrap());
    lock.acquire().await.unwrap();
    assert!(lock.is_locked().await.unwrap());

    lock.release().await.unwrap();
    assert!(!lock.is_locked().await.unwrap());
    assert!(logs_contain("lock acquired"));
    assert!(logs_contain("lock released"));
}

#[tokio::test]
async fn lock_node_is_ephemeral() {
    let ensemble = MemoryEnsemble::new();
    let conn = connect(&ensemble).await;
    let lock = DistributedLock::new(conn.clone(), "/leader");
    lock.acquire().await.unwrap();

    let observer = DistributedLock::new(connect(&ensemble).await, "/leader");
    assert!(observer.is_locked().await.unwrap());

    ensemble.expire_session(conn.session_id().unwrap());
    assert!(!observer.is_locked().await.unwrap());
}

#[tokio::test]
async fn try_acquire_reports_contention() {
    let ensemble = MemoryEnsemble::new();
    let first = DistributedLock::new(connect(&ensemble).await, "/leader");
    let second = DistributedLock::new(connect(&ensemble).await, "/leader");

    assert!(first.try_acquire().await.unwrap());
    assert!(!second.try_acquire().await.unwrap());
}

#[tokio::test]
#[traced_test]
async fn second_acquire_waits_for_release() {
    let ensemble = MemoryEnsemble::new();
    let first = DistributedLock::new(connect(&ensemble).await, "/leader");
    let second = DistributedLock::new(connect(&ensemble).await, "/leader");
    first.acquire().await.unwrap();

    let waiter = tokio::spawn(async move { second.acquire().await });
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    first.release().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be woken by the watch")
        .unwrap()
        .unwrap();
    assert!(first.is_locked().await.unwrap());
    assert!(logs_contain("waiting for release"));
}

#[tokio::test]
async fn holder_expiry_wakes_waiter() {
    let ensemble = MemoryEnsemble::new();
    let holder_conn = connect(&ensemble).await;
    let holder = DistributedLock::new(holder_conn.clone(), "/leader");
    let waiter = DistributedLock::new(connect(&ensemble).await, "/leader");
    holder.acquire().await.unwrap();

    let handle = tokio::spawn(async move { waiter.acquire().await });
    sleep(Duration::from_millis(20)).await;
    ensemble.expire_session(holder_conn.session_id().unwrap());

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn acquire_timeout_expires_while_held() {
    let ensemble = MemoryEnsemble::new();
    let first = DistributedLock::new(connect(&ensemble).await, "/leader");
    let second = DistributedLock::new(connect(&ensemble).await, "/leader");
    first.acquire().await.unwrap();

    let err = second.acquire_timeout(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    first.release().await.unwrap();
    second.acquire_timeout(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn release_tolerates_missing_node() {
    let ensemble = MemoryEnsemble::new();
    let lock = DistributedLock::new(connect(&ensemble).await, "/leader");

    lock.release().await.unwrap();
    assert!(logs_contain("lock node already gone"));
}

#[tokio::test]
async fn guard_release_and_drop() {
    let ensemble = MemoryEnsemble::new();
    let lock = DistributedLock::new(connect(&ensemble).await, "/leader");

    let guard = lock.lock().await.unwrap();
    assert_eq!(guard.path(), "/leader");
    guard.release().await.unwrap();
    assert!(!lock.is_locked().await.unwrap());

    {
        let _guard = lock.lock().await.unwrap();
        assert!(lock.is_locked().await.unwrap());
    }
    let contender = DistributedLock::new(connect(&ensemble).await, "/leader");
    contender.acquire_timeout(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn acquire_in_commits_with_other_operations() {
    let ensemble = MemoryEnsemble::new();
    let conn = connect(&ensemble).await;
    let lock = DistributedLock::new(conn.clone(), "/leader");

    let mut txn = conn.transaction("elect and announce");
    lock.acquire_in(&mut txn, &Value::Data("node-1")).unwrap();
    txn.create("/announcement", &Value::Data(1u64), CreateOptions::default())
        .unwrap();
    txn.commit().await.unwrap();
    assert_eq!(conn.get::<String>("/leader").await.unwrap(), Value::Data("node-1".to_string()));

    // a held lock makes the whole request fail
    let other = DistributedLock::new(connect(&ensemble).await, "/leader");
    let other_conn = connect(&ensemble).await;
    let mut txn = other_conn.transaction("usurp");
    other.acquire_in(&mut txn, &Value::<()>::Empty).unwrap();
    txn.create("/usurped", &Value::<()>::Empty, CreateOptions::default())
        .unwrap();
    assert!(txn.commit().await.unwrap_err().is_node_exists());
    assert!(!conn.exists("/usurped", None).await.unwrap());

    let mut txn = conn.transaction("step down");
    lock.release_in(&mut txn);
    txn.delete("/announcement", false);
    txn.commit().await.unwrap();
    assert!(!lock.is_locked().await.unwrap());
}
