//! Fixed-backoff retry for transient connection failures

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::DbError;

/// Retry bound and backoff for connection-level failures.
///
/// Statement failures are never retried regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub const NONE: Self = Self {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    /// Run `op`, retrying while its error is transient and the bound allows.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        target: "scribedb_pool::retry",
                        label,
                        attempt,
                        backoff_ms = self.backoff.as_millis() as u64,
                        error = %err,
                        "transient database error, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
