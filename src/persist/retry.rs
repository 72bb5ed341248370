//! Bounded retry of store calls on transient failures.

use std::future::Future;

use crate::config::RetryPolicy;
use crate::storage::StoreResult;

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's retries are spent. The final error is returned unchanged.
///
/// Between attempts the task sleeps for the policy's fixed backoff without
/// blocking the runtime.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    model: &str,
    operation: &'static str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    model,
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    backoff_ms = u64::try_from(policy.backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            outcome => return outcome,
        }
    }
}
