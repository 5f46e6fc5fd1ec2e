use std::future::Future;
use std::time::Duration;

use errors::{Error, Result};
use log::debug;
use tokio::time::sleep;

pub const DEFAULT_ATTEMPTS: usize = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(500);

/// Retries a transient operation with exponential backoff. The last error
/// is returned once the attempt budget is exhausted.
pub async fn with_retries<T, F, Fut>(label: &str, attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = DEFAULT_BASE_DELAY;
    let mut last: Option<Error> = None;
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("{label} attempt {attempt}/{attempts} failed: {e}");
                last = Some(e);
                if attempt < attempts {
                    sleep(delay).await;
                    delay = (delay * 2).min(DEFAULT_MAX_DELAY);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::storage_unavailable(format!("{label}: no attempts made"))))
}
