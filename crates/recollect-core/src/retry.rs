//! Bounded retry with linearly growing delay.
//!
//! Every network call in the pipeline (embedding requests, vector-store
//! operations, PDF downloads) goes through this wrapper so failure recovery
//! behaves uniformly.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Run `op`, retrying on failure up to `max_retries` times.
///
/// The delay before retry `n` is `initial_delay * n` (linear, no jitter).
/// After the last retry fails, the final error is returned.
pub async fn with_retry<T, E, F, Fut>(
    mut op: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failures += 1;
                if failures > max_retries {
                    return Err(e);
                }
                let delay = initial_delay * failures;
                tracing::warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
