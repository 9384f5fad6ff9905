//! Shared plumbing for moving batches: retry policy, timeouts, batch streams.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::Batch;
use crate::error::{MigrateError, Result};

/// Upper bound for a single backoff delay.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Batches flowing from a source, through a transformer, into a target.
pub type BatchStream = BoxStream<'static, Result<Batch>>;

/// Channel depth between extraction and load. Bounds memory to a few batches.
pub const READ_AHEAD_BATCHES: usize = 4;

/// Bounded retry of transiently failed batch writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,

    /// Delay before the first retry; doubles for each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Whether another attempt is allowed after `attempt` retries have been made.
    pub fn should_retry(&self, err: &MigrateError, attempt: u32) -> bool {
        attempt < self.max_retries && err.is_transient()
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base_ms.saturating_mul(factor)).min(BACKOFF_MAX)
    }
}

/// Run `fut`, failing with a timeout error naming `operation` if it takes longer than `limit`.
pub async fn with_timeout<T, F>(operation: impl Into<String>, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MigrateError::timeout(operation, limit)),
    }
}

/// Sleep for `delay` unless cancelled first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Adapt a batch channel into a stream.
pub fn receiver_stream(rx: mpsc::Receiver<Result<Batch>>) -> BatchStream {
    stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

/// Stream a fixed list of batches.
pub fn batches_stream(batches: Vec<Batch>) -> BatchStream {
    stream::iter(batches.into_iter().map(Ok)).boxed()
}
