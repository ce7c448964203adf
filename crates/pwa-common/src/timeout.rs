//! Bounded waits.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| {
            warn!(?timeout, "Operation did not settle in time");
            crate::PwaError::Timeout(timeout)
        })
}
