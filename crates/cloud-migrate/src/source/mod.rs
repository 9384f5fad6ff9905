//! Source database access.

mod mssql;

pub use mssql::MssqlSource;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::DataSourceSpec;
use crate::core::{Batch, Column, TableRef};
use crate::error::Result;

/// What to read for one table.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Table to read.
    pub table: TableRef,

    /// Columns to select, in output order.
    pub columns: Vec<String>,

    /// Ordering key; natural storage order when absent.
    pub order_by: Option<String>,

    /// Maximum rows per emitted batch.
    pub batch_size: usize,

    /// Upper bound for each network round trip.
    pub timeout: Duration,
}

impl ExtractRequest {
    /// Request every mapped source column of `spec`.
    pub fn for_spec(spec: &DataSourceSpec, timeout: Duration) -> Self {
        Self {
            table: spec.source.clone(),
            columns: spec.source_columns(),
            order_by: spec.order_by.clone(),
            batch_size: spec.batch_size,
            timeout,
        }
    }
}

/// Read access to the source database.
///
/// Implementations acquire connections lazily and must be safe to share
/// between concurrent table workers; each worker gets its own connection.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Establish (or verify) connectivity. Fails with a source connection error.
    async fn connect(&self) -> Result<()>;

    /// Column metadata for a table. Fails with an extraction error if the
    /// table does not exist.
    async fn describe(&self, table: &TableRef) -> Result<Vec<Column>>;

    /// Stream the requested rows in batches of at most `request.batch_size`.
    ///
    /// Rows arrive in a deterministic order. Extraction failures are delivered
    /// through the channel; dropping the receiver stops the read.
    fn extract(&self, request: ExtractRequest) -> mpsc::Receiver<Result<Batch>>;

    /// Exact row count, read fresh from the source.
    async fn row_count(&self, table: &TableRef) -> Result<u64>;

    /// Get the database type.
    fn db_type(&self) -> &str;

    /// Release all connections.
    async fn close(&self);
}
