//! Time bounds for provider and store calls.

use std::future::Future;
use std::time::Duration;

use ragweave_core::{Error, Result};

/// Run `fut`, failing with [`Error::Timeout`] once `limit` elapses.
pub async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            ms: limit.as_millis() as u64,
        }),
    }
}
