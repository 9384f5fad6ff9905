//! Order-independent table digests.

use std::fmt;
use std::time::Duration;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::SqlValue;
use crate::error::Result;
use crate::transfer::{with_timeout, BatchStream};
use crate::transform::Transformer;

/// Separates cells of a canonical row.
const FIELD_SEPARATOR: u8 = 0x1f;

/// Aggregate of per-row hashes. Equal multisets of rows give equal digests
/// regardless of order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDigest {
    pub rows: u64,
    pub sum: u64,
}

impl TableDigest {
    pub fn add_row(&mut self, row: &[SqlValue]) {
        self.rows += 1;
        self.sum = self.sum.wrapping_add(row_digest(row));
    }

    /// Digest every row of `batches`, mapping each batch through `transformer` first if given.
    /// Waiting longer than `timeout` for any one batch fails with a timeout.
    pub async fn of_stream(
        mut batches: BatchStream,
        transformer: Option<&Transformer>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut digest = TableDigest::default();
        while let Some(batch) =
            with_timeout("reading rows for checksum", timeout, batches.try_next()).await?
        {
            let batch = match transformer {
                Some(t) => t.apply_batch(&batch)?,
                None => batch,
            };
            for row in &batch.rows {
                digest.add_row(row);
            }
        }
        Ok(digest)
    }
}

impl fmt::Display for TableDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}/{}", self.sum, self.rows)
    }
}

/// SHA-256 of a row's canonical text, truncated to 64 bits.
pub fn row_digest(row: &[SqlValue]) -> u64 {
    let mut hasher = Sha256::new();
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        if value.is_null() {
            hasher.update([0u8]);
        } else {
            hasher.update([1u8]);
            hasher.update(value.canonical_text().as_bytes());
        }
    }
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Batch, SqlNullType};
    use crate::transfer::batches_stream;
    use crate::error::MigrateError;
    use futures::{stream, StreamExt};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    fn batch(rows: Vec<Vec<SqlValue>>) -> Batch {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        Batch::new(columns, rows)
    }

    #[test]
    fn test_row_digest_distinguishes_null_and_text() {
        let null = vec![SqlValue::I32(1), SqlValue::Null(SqlNullType::String)];
        let empty = vec![SqlValue::I32(1), SqlValue::Text(String::new())];
        assert_ne!(row_digest(&null), row_digest(&empty));
    }

    #[test]
    fn test_row_digest_distinguishes_null_and_null_literal() {
        let null = vec![SqlValue::Null(SqlNullType::String)];
        let literal = vec![SqlValue::from("NULL")];
        assert_ne!(row_digest(&null), row_digest(&literal));
    }

    #[test]
    fn test_row_digest_respects_field_boundaries() {
        let a = vec![SqlValue::from("ab"), SqlValue::from("c")];
        let b = vec![SqlValue::from("a"), SqlValue::from("bc")];
        assert_ne!(row_digest(&a), row_digest(&b));
    }

    #[tokio::test]
    async fn test_digest_is_order_independent() {
        let r1 = vec![SqlValue::I32(1), SqlValue::from("alice")];
        let r2 = vec![SqlValue::I32(2), SqlValue::from("bob")];

        let forward = batches_stream(vec![batch(vec![r1.clone()]), batch(vec![r2.clone()])]);
        let reverse = batches_stream(vec![batch(vec![r2, r1])]);

        let a = TableDigest::of_stream(forward, None, WAIT).await.unwrap();
        let b = TableDigest::of_stream(reverse, None, WAIT).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rows, 2);
    }

    #[tokio::test]
    async fn test_digest_detects_changed_value() {
        let a = batches_stream(vec![batch(vec![vec![SqlValue::I32(1), SqlValue::from("alice")]])]);
        let b = batches_stream(vec![batch(vec![vec![SqlValue::I32(1), SqlValue::from("alicE")]])]);
        let a = TableDigest::of_stream(a, None, WAIT).await.unwrap();
        let b = TableDigest::of_stream(b, None, WAIT).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let row = vec![SqlValue::I32(1), SqlValue::from("a")];
        let first = stream::iter(vec![Ok::<_, MigrateError>(batch(vec![row]))]);
        let stalled: BatchStream = Box::pin(first.chain(stream::pending()));

        let started = std::time::Instant::now();
        let err = TableDigest::of_stream(stalled, None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
