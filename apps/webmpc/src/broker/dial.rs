//! Fixed-delay redial loop shared by the broker and the watcher.

use std::future::Future;
use std::time::Duration;

use tokio::time;

use crate::error::UpstreamResult;

/// Delay between two dial attempts.
pub const DIAL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Call `attempt` until it succeeds, sleeping `delay` after each failure.
///
/// Attempts run strictly one after another. The loop never gives up on its
/// own; callers stop it by dropping or aborting the future.
pub async fn with_retry<T, F, Fut>(role: &'static str, delay: Duration, mut attempt: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UpstreamResult<T>>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(connection) => {
                tracing::info!(role, attempts, "connected to upstream");
                return connection;
            }
            Err(e) => {
                tracing::warn!(role, attempts, error = %e, retry_in = ?delay, "upstream unreachable");
                time::sleep(delay).await;
            }
        }
    }
}
