//! Post-load verification of source against target.
//!
//! Row counts are always compared. With checksums enabled, both sides are
//! also streamed and folded into an order-independent content digest.
//! Nothing here writes to either database, and nothing here fails: an
//! unreadable side turns into `validation_passed = false` with a diagnostic.

mod checksum;

pub use checksum::{row_digest, TableDigest};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DataSourceSpec;
use crate::error::Result;
use crate::source::{ExtractRequest, SourceConnector};
use crate::target::TargetLoader;
use crate::transfer::receiver_stream;
use crate::transform::Transformer;

/// Outcome of comparing one table's source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub table: String,
    pub validation_passed: bool,

    /// `None` when the source could not be counted.
    pub source_count: Option<u64>,

    /// `None` when the target could not be counted.
    pub target_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_mismatch: Option<String>,

    pub diagnostic: String,
}

impl ValidationResult {
    /// A failed result that never reached either database.
    pub fn failed(table: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            validation_passed: false,
            source_count: None,
            target_count: None,
            checksum_mismatch: None,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Compares a table's state on both sides.
pub struct Validator {
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetLoader>,
    timeout: Duration,
    checksum: bool,
}

impl Validator {
    pub fn new(
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetLoader>,
        timeout: Duration,
        checksum: bool,
    ) -> Self {
        Self {
            source,
            target,
            timeout,
            checksum,
        }
    }

    /// Validate one table. Counts are re-read from both sides on every call.
    pub async fn validate(&self, spec: &Arc<DataSourceSpec>) -> ValidationResult {
        let name = spec.name.clone();

        let source_count = self.source.row_count(&spec.source).await;
        let target_count = self.target.row_count(&spec.target).await;

        let mut problems = Vec::new();
        if let Err(e) = &source_count {
            problems.push(format!("source count failed: {}", e));
        }
        if let Err(e) = &target_count {
            problems.push(format!("target count failed: {}", e));
        }
        let source_count = source_count.ok();
        let target_count = target_count.ok();

        let counts_match = match (source_count, target_count) {
            (Some(s), Some(t)) if s == t => true,
            (Some(s), Some(t)) => {
                problems.push(format!("row count mismatch: source {} != target {}", s, t));
                false
            }
            _ => false,
        };

        let mut checksum_mismatch = None;
        if self.checksum && counts_match {
            match self.compare_content(spec).await {
                Ok((source_digest, target_digest)) if source_digest == target_digest => {
                    debug!("{}: checksum {} matches", name, source_digest);
                }
                Ok((source_digest, target_digest)) => {
                    let detail = format!("source {} != target {}", source_digest, target_digest);
                    problems.push(format!("checksum mismatch: {}", detail));
                    checksum_mismatch = Some(detail);
                }
                Err(e) => problems.push(format!("checksum failed: {}", e)),
            }
        }

        let validation_passed = problems.is_empty();
        let diagnostic = if validation_passed {
            match source_count {
                Some(n) if self.checksum => format!("{} rows, counts and checksums match", n),
                Some(n) => format!("{} rows, counts match", n),
                None => String::new(),
            }
        } else {
            problems.join("; ")
        };

        if validation_passed {
            info!("{}: validation passed ({})", name, diagnostic);
        } else {
            warn!("{}: validation failed ({})", name, diagnostic);
        }

        ValidationResult {
            table: name,
            validation_passed,
            source_count,
            target_count,
            checksum_mismatch,
            diagnostic,
        }
    }

    /// Digest both sides over the mapped columns.
    async fn compare_content(&self, spec: &Arc<DataSourceSpec>) -> Result<(TableDigest, TableDigest)> {
        let transformer = Transformer::new(Arc::clone(spec));

        let source_rx = self.source.extract(ExtractRequest::for_spec(spec, self.timeout));
        let source_digest =
            TableDigest::of_stream(receiver_stream(source_rx), Some(&transformer), self.timeout)
                .await?;

        let target_rx = self.target.scan(ExtractRequest {
            table: spec.target.clone(),
            columns: transformer.target_columns().to_vec(),
            order_by: None,
            batch_size: spec.batch_size,
            timeout: self.timeout,
        });
        let target_digest = TableDigest::of_stream(receiver_stream(target_rx), None, self.timeout).await?;

        Ok((source_digest, target_digest))
    }
}
