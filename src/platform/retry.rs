use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{PrError, Result};

/// Run `op` with a per-attempt timeout, retrying `RateLimited` errors with backoff.
///
/// Exhausted retries and timeouts surface as `PlatformUnavailable`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(PrError::PlatformUnavailable(format!(
                "{operation} timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match result {
            Err(PrError::RateLimited(msg)) => {
                if attempt >= policy.max_attempts {
                    return Err(PrError::PlatformUnavailable(format!(
                        "{operation} still rate limited after {attempt} attempts: {msg}"
                    )));
                }
                let delay = policy.delay_for(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
