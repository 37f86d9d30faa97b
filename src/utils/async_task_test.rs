use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::async_task::task_with_timeout_and_exponential_backoff;
use crate::service::ServiceError;
use crate::ConnectRetryPolicy;

fn policy(max_attempts: usize) -> ConnectRetryPolicy {
    ConnectRetryPolicy {
        max_attempts,
        timeout_ms: 100,
        base_delay_ms: 10,
        max_delay_ms: 40,
    }
}

#[tokio::test(start_paused = true)]
async fn returns_first_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let result = task_with_timeout_and_exponential_backoff(
        || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ServiceError::ConnectionLoss)
                } else {
                    Ok(n)
                }
            }
        },
        policy(5),
    )
    .await;
    assert_eq!(result, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn bounded_attempts_return_last_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let result: Result<(), _> = task_with_timeout_and_exponential_backoff(
        || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::SessionExpired)
            }
        },
        policy(3),
    )
    .await;
    assert_eq!(result, Err(ServiceError::SessionExpired));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_is_cut_by_timeout() {
    let result: Result<(), _> = task_with_timeout_and_exponential_backoff(
        || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        },
        policy(1),
    )
    .await;
    assert_eq!(result, Err(ServiceError::ConnectTimeout(Duration::from_millis(100))));
}

#[tokio::test(start_paused = true)]
async fn unbounded_policy_keeps_retrying() {
    let calls = Arc::new(AtomicUsize::new(0));
    let result = task_with_timeout_and_exponential_backoff(
        || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 50 {
                    Err(ServiceError::ConnectionLoss)
                } else {
                    Ok(())
                }
            }
        },
        policy(0),
    )
    .await;
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 51);
}
