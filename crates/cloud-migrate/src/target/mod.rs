//! Target database access and the batch load loop.

mod postgres;
mod tls;

pub use postgres::PostgresTarget;
pub use tls::SslMode;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TargetMode;
use crate::core::{Batch, TableRef, TargetColumn};
use crate::error::{MigrateError, Result};
use crate::source::ExtractRequest;
use crate::transfer::{sleep_or_cancel, BatchStream, RetryPolicy};

/// Settings for one table load.
#[derive(Debug, Clone)]
pub struct LoadContext {
    /// Upper bound for waiting on the next batch and for each batch write.
    pub timeout: Duration,

    /// Retry policy for transient write failures.
    pub retry: RetryPolicy,

    /// Run-level cancellation, honoured at batch boundaries.
    pub cancel: CancellationToken,

    /// Rows committed so far, readable while the load is running.
    pub progress: Arc<AtomicU64>,
}

impl LoadContext {
    pub fn new(timeout: Duration, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            retry,
            cancel,
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn rows_committed(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

/// Write access to the target store.
///
/// Implementations acquire connections lazily and must be safe to share
/// between concurrent table workers.
#[async_trait]
pub trait TargetLoader: Send + Sync {
    /// Establish (or verify) connectivity. Fails with a target connection error.
    async fn connect(&self) -> Result<()>;

    /// Create the table if absent; verify its shape if present.
    ///
    /// Idempotent: a second call against a correct table changes nothing.
    /// Fails with a schema error when an existing table lacks a column or
    /// has an incompatible type.
    async fn ensure_schema(&self, table: &TableRef, columns: &[TargetColumn]) -> Result<()>;

    /// Ready the table for loading according to `mode`.
    async fn prepare(&self, table: &TableRef, mode: TargetMode) -> Result<()>;

    /// Write one batch in a single transaction. Returns rows written.
    ///
    /// Either every row of the batch lands or none does.
    async fn write_batch(&self, table: &TableRef, batch: &Batch) -> Result<u64>;

    /// Exact row count, read fresh from the target.
    async fn row_count(&self, table: &TableRef) -> Result<u64>;

    /// Stream the requested columns of every row, for content checks.
    fn scan(&self, request: ExtractRequest) -> mpsc::Receiver<Result<Batch>>;

    /// Get the database type.
    fn db_type(&self) -> &str;

    /// Release all connections.
    async fn close(&self);

    /// Consume `batches`, writing each one transactionally. Returns total rows written.
    ///
    /// Transient write failures are retried per `ctx.retry` with exponential
    /// backoff. A write that outlives `ctx.timeout` is never retried. Anything
    /// else becomes a load error carrying the number of rows already committed. Errors arriving on the stream (extraction, mapping)
    /// are returned unchanged. Cancellation is observed between batches.
    async fn load(&self, table: &TableRef, mut batches: BatchStream, ctx: &LoadContext) -> Result<u64> {
        let name = table.to_string();
        let mut committed = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(MigrateError::Cancelled),
                next = tokio::time::timeout(ctx.timeout, batches.next()) => next,
            };
            let batch = match next {
                Err(_) => {
                    return Err(MigrateError::timeout(
                        format!("waiting for rows of {}", name),
                        ctx.timeout,
                    ))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(batch))) => batch,
            };
            if batch.is_empty() {
                continue;
            }

            let mut attempt = 0u32;
            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(MigrateError::Cancelled);
                }
                let write = match tokio::time::timeout(ctx.timeout, self.write_batch(table, &batch)).await {
                    Ok(write) => write,
                    // The batch may have committed before the deadline.
                    Err(_) => {
                        return Err(MigrateError::timeout(
                            format!("writing batch to {} (commit state unknown, not retried)", name),
                            ctx.timeout,
                        ))
                    }
                };
                match write {
                    Ok(written) => {
                        committed += written;
                        ctx.progress.fetch_add(written, Ordering::Relaxed);
                        debug!("{}: committed {} rows (total {})", name, written, committed);
                        break;
                    }
                    Err(e) if ctx.retry.should_retry(&e, attempt) => {
                        attempt += 1;
                        let delay = ctx.retry.backoff(attempt);
                        warn!(
                            "{}: batch write failed ({}), retry {}/{} in {:?}",
                            name, e, attempt, ctx.retry.max_retries, delay
                        );
                        sleep_or_cancel(delay, &ctx.cancel).await?;
                    }
                    Err(e @ MigrateError::Timeout { .. }) => return Err(e),
                    Err(MigrateError::Load { message, .. }) => {
                        return Err(MigrateError::Load {
                            table: name,
                            message,
                            rows_committed: committed,
                        })
                    }
                    Err(e) => {
                        return Err(MigrateError::Load {
                            table: name,
                            message: e.to_string(),
                            rows_committed: committed,
                        })
                    }
                }
            }
        }

        Ok(committed)
    }
}
