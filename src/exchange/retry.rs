// =============================================================================
// Retry with exponential backoff
// =============================================================================
//
// Attempt n (1-based) failing sleeps base_delay * 2^(n-1) before attempt n+1.
// The last error is returned with the attempt count attached.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Upper bound on a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Sleep before retrying after failed attempt `attempt` (1-based).
pub fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base_delay.saturating_mul(factor).min(MAX_DELAY)
}

/// Run `op` up to `attempts` times (at least once).
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    label,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{label} failed after {attempts} attempts"))),
        }
    }
}
