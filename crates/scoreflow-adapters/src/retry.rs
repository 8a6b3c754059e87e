// Retry wrapper for transient adapter failures: 3 attempts with exponential
// backoff (1s, 2s, 4s).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{AdapterError, Result};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Run `operation`, retrying transient failures with exponential backoff.
/// Permanent failures, timeouts and cancellations propagate immediately.
pub async fn with_retries<T, F, Fut>(name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err @ AdapterError::Transient(_)) if attempt < MAX_ATTEMPTS => {
                let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                warn!(
                    operation = name,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %err,
                    "transient adapter failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
