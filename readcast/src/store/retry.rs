//! Retry helper for transient infrastructure failures.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::Result;

const TRANSIENT_MAX_RETRIES: usize = 4;
const TRANSIENT_BASE_DELAY_MS: u64 = 50;
const TRANSIENT_MAX_DELAY_MS: u64 = 2000;

/// Run `op`, retrying with jittered exponential backoff while it fails with a
/// transient error. Other errors are returned immediately.
pub async fn retry_transient<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() || attempt >= TRANSIENT_MAX_RETRIES {
                    return Err(err);
                }

                let exp_backoff_ms = TRANSIENT_BASE_DELAY_MS.saturating_mul(1u64 << attempt);
                let capped_ms = exp_backoff_ms.min(TRANSIENT_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay =
                    Duration::from_millis((capped_ms + jitter_ms).min(TRANSIENT_MAX_DELAY_MS));

                debug!(
                    "Transient failure during {}: {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    err,
                    delay,
                    attempt + 1,
                    TRANSIENT_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
