//! SQL value types for database-agnostic data transfer.
//!
//! Rows travel from source to target as vectors of [`SqlValue`], grouped into
//! [`Batch`]es that share a single column list.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values to ensure correct target database encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint for correct wire format encoding.
    Null(SqlNullType),

    /// Boolean value.
    Bool(bool),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real/float4).
    F32(f32),

    /// 64-bit floating point (double precision/float8).
    F64(f64),

    /// Text/string data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value (for type-aware NULL encoding).
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Integer view of the value, widening smaller integer types.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(*v as i64),
            SqlValue::I32(v) => Some(*v as i64),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Canonical text form used for content checksums.
    ///
    /// Two values that a target stores identically must render identically
    /// here regardless of which driver produced them: integers of any width
    /// render the same, decimals drop trailing zeros, timestamps use a fixed
    /// microsecond format.
    pub fn canonical_text(&self) -> String {
        match self {
            SqlValue::Null(_) => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => format!("{:.6e}", v),
            SqlValue::F64(v) => format!("{:.15e}", v),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(b) => hex::encode(b),
            SqlValue::Uuid(u) => u.to_string(),
            SqlValue::Decimal(d) => d.normalize().to_string(),
            SqlValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            SqlValue::DateTimeOffset(dt) => dt
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.6fZ")
                .to_string(),
            SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            SqlValue::Time(t) => t.format("%H:%M:%S%.6f").to_string(),
        }
    }

    /// Total ordering used for deterministic extraction order.
    ///
    /// NULLs sort first. Values of the same kind compare naturally; mixed
    /// kinds fall back to their canonical text.
    pub fn compare(&self, other: &SqlValue) -> Ordering {
        match (self, other) {
            (SqlValue::Null(_), SqlValue::Null(_)) => Ordering::Equal,
            (SqlValue::Null(_), _) => Ordering::Less,
            (_, SqlValue::Null(_)) => Ordering::Greater,
            (a, b) if a.as_i64().is_some() && b.as_i64().is_some() => {
                a.as_i64().cmp(&b.as_i64())
            }
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a.cmp(b),
            (SqlValue::F32(a), SqlValue::F32(b)) => a.total_cmp(b),
            (SqlValue::F64(a), SqlValue::F64(b)) => a.total_cmp(b),
            (SqlValue::Text(a), SqlValue::Text(b)) => a.cmp(b),
            (SqlValue::Bytes(a), SqlValue::Bytes(b)) => a.cmp(b),
            (SqlValue::Uuid(a), SqlValue::Uuid(b)) => a.cmp(b),
            (SqlValue::Decimal(a), SqlValue::Decimal(b)) => a.cmp(b),
            (SqlValue::DateTime(a), SqlValue::DateTime(b)) => a.cmp(b),
            (SqlValue::DateTimeOffset(a), SqlValue::DateTimeOffset(b)) => a.cmp(b),
            (SqlValue::Date(a), SqlValue::Date(b)) => a.cmp(b),
            (SqlValue::Time(a), SqlValue::Time(b)) => a.cmp(b),
            (a, b) => a.canonical_text().cmp(&b.canonical_text()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

/// A bounded chunk of rows moved as one extraction/load unit.
///
/// All rows share `columns`; cloning the column list is a reference-count bump.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Column names, in row value order.
    pub columns: Arc<[String]>,

    /// Row data.
    pub rows: Vec<Vec<SqlValue>>,
}

impl Batch {
    /// Create a new batch with the given columns and rows.
    pub fn new(columns: Arc<[String]>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    /// Get the number of rows in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_is_null() {
        assert!(SqlValue::Null(SqlNullType::String).is_null());
        assert!(!SqlValue::I32(42).is_null());
    }

    #[test]
    fn test_canonical_text_widens_integers() {
        assert_eq!(SqlValue::I16(7).canonical_text(), SqlValue::I64(7).canonical_text());
        assert_eq!(SqlValue::Bool(true).canonical_text(), "1");
        assert_eq!(SqlValue::Null(SqlNullType::I32).canonical_text(), "NULL");
    }

    #[test]
    fn test_canonical_text_normalizes_decimals() {
        let a = SqlValue::Decimal(Decimal::new(150, 2));
        let b = SqlValue::Decimal(Decimal::new(15, 1));
        assert_eq!(a.canonical_text(), b.canonical_text());
    }

    #[test]
    fn test_compare_orders_nulls_first() {
        let mut values = vec![
            SqlValue::I64(3),
            SqlValue::Null(SqlNullType::I64),
            SqlValue::I32(1),
        ];
        values.sort_by(|a, b| a.compare(b));
        assert!(values[0].is_null());
        assert_eq!(values[1], SqlValue::I32(1));
        assert_eq!(values[2], SqlValue::I64(3));
    }

    #[test]
    fn test_batch_len() {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        let batch = Batch::new(columns, vec![vec![SqlValue::I32(1), "a".into()]]);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
    }
}
