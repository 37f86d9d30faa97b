use std::future::Future;

use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use crate::metrics::CONNECT_ATTEMPTS;
use crate::service::ServiceError;
use crate::service::ServiceResult;
use crate::ConnectRetryPolicy;

/// Runs `task` until it succeeds, bounding each attempt by `policy.timeout_ms`
/// and doubling the pause between attempts.
///
/// With `policy.max_attempts == 0` it never gives up; otherwise the error of the
/// last attempt is returned once the attempts are exhausted.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: ConnectRetryPolicy,
) -> ServiceResult<P>
where
    F: Fn() -> T,
    T: Future<Output = ServiceResult<P>>,
{
    let attempt_timeout = policy.attempt_timeout();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match timeout(attempt_timeout, task()).await {
            Ok(Ok(r)) => {
                CONNECT_ATTEMPTS.with_label_values(&["ok"]).inc();
                return Ok(r);
            }
            Ok(Err(error)) => error,
            Err(_) => ServiceError::ConnectTimeout(attempt_timeout),
        };
        CONNECT_ATTEMPTS.with_label_values(&["failed"]).inc();
        warn!(attempt, max_attempts = policy.max_attempts, "connect attempt failed: {}", error);

        if !policy.is_unbounded() && attempt >= policy.max_attempts {
            warn!("Task failed after {} attempts", attempt);
            return Err(error);
        }
        sleep(policy.delay_after(attempt)).await;
    }
}
