//! Per-table and per-run outcome records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::verify::ValidationResult;

/// Terminal state of one table in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableStatus::Succeeded => write!(f, "succeeded"),
            TableStatus::Failed => write!(f, "failed"),
            TableStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Non-terminal table states, in the order a table passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePhase {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Validating,
}

impl fmt::Display for TablePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TablePhase::Pending => "pending",
            TablePhase::Extracting => "extracting",
            TablePhase::Transforming => "transforming",
            TablePhase::Loading => "loading",
            TablePhase::Validating => "validating",
        };
        f.write_str(s)
    }
}

/// Error category carried in a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Extraction,
    Mapping,
    Schema,
    Load,
    Timeout,
    Cancelled,
    Internal,
}

impl From<&MigrateError> for ErrorKind {
    fn from(err: &MigrateError) -> Self {
        match err {
            MigrateError::Config(_) | MigrateError::Yaml(_) => ErrorKind::Config,
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => ErrorKind::Connection,
            MigrateError::Extraction { .. } | MigrateError::Source(_) => ErrorKind::Extraction,
            MigrateError::Mapping { .. } => ErrorKind::Mapping,
            MigrateError::Schema { .. } => ErrorKind::Schema,
            MigrateError::Load { .. } | MigrateError::Target(_) => ErrorKind::Load,
            MigrateError::Timeout { .. } => ErrorKind::Timeout,
            MigrateError::Cancelled => ErrorKind::Cancelled,
            MigrateError::Io(_) | MigrateError::Json(_) => ErrorKind::Internal,
        }
    }
}

/// Why a table failed, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableError {
    pub kind: ErrorKind,

    /// Phase the table was in when the error occurred.
    pub phase: TablePhase,

    pub message: String,
}

impl TableError {
    pub fn new(err: &MigrateError, phase: TablePhase) -> Self {
        Self {
            kind: ErrorKind::from(err),
            phase,
            message: err.to_string(),
        }
    }
}

/// Outcome of one table's migration attempt.
///
/// `error` is present exactly when `status` is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub table: String,
    pub status: TableStatus,
    pub rows_migrated: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TableError>,
}

impl MigrationResult {
    pub fn succeeded(table: impl Into<String>, rows: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Succeeded,
            rows_migrated: rows,
            started_at,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(
        table: impl Into<String>,
        rows: u64,
        started_at: DateTime<Utc>,
        error: TableError,
    ) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Failed,
            rows_migrated: rows,
            started_at,
            completed_at: Utc::now(),
            error: Some(error),
        }
    }

    /// A table that never left `pending`.
    pub fn skipped(table: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            table: table.into(),
            status: TableStatus::Skipped,
            rows_migrated: 0,
            started_at: now,
            completed_at: now,
            error: None,
        }
    }
}

/// A table's migration result with the validation taken after it.
///
/// Skipped tables carry no validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOutcome {
    pub migration: MigrationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl TableOutcome {
    /// Succeeded and validated.
    pub fn passed(&self) -> bool {
        self.migration.status == TableStatus::Succeeded
            && self.validation.as_ref().is_some_and(|v| v.validation_passed)
    }
}

/// Result of a full migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,

    /// Hash of the configuration the run used.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// One entry per active table, in configuration order.
    pub tables: Vec<TableOutcome>,
}

impl RunReport {
    /// True iff every table succeeded and passed validation.
    pub fn succeeded(&self) -> bool {
        self.tables.iter().all(TableOutcome::passed)
    }

    /// Tables that did not succeed or did not validate.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| !t.passed())
            .map(|t| t.migration.table.as_str())
            .collect()
    }

    pub fn rows_migrated(&self) -> u64 {
        self.tables.iter().map(|t| t.migration.rows_migrated).sum()
    }

    pub fn count(&self, status: TableStatus) -> usize {
        self.tables
            .iter()
            .filter(|t| t.migration.status == status)
            .count()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of a validate-only run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub run_id: String,
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// One entry per active table, in configuration order.
    pub tables: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn all_passed(&self) -> bool {
        self.tables.iter().all(|t| t.validation_passed)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| !t.validation_passed)
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Side;

    fn validation(passed: bool) -> ValidationResult {
        ValidationResult {
            table: "t".into(),
            validation_passed: passed,
            source_count: Some(1),
            target_count: Some(if passed { 1 } else { 0 }),
            checksum_mismatch: None,
            diagnostic: String::new(),
        }
    }

    fn report(tables: Vec<TableOutcome>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: "r".into(),
            config_hash: "h".into(),
            started_at: now,
            completed_at: now,
            tables,
        }
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = MigrateError::connection(Side::Target, "refused");
        assert_eq!(ErrorKind::from(&err), ErrorKind::Connection);
        let err = MigrateError::Load {
            table: "t".into(),
            message: "boom".into(),
            rows_committed: 3,
        };
        assert_eq!(ErrorKind::from(&err), ErrorKind::Load);
        assert_eq!(ErrorKind::from(&MigrateError::Cancelled), ErrorKind::Cancelled);
    }

    #[test]
    fn test_run_succeeds_only_when_all_pass() {
        let ok = TableOutcome {
            migration: MigrationResult::succeeded("a", 1, Utc::now()),
            validation: Some(validation(true)),
        };
        assert!(report(vec![ok.clone()]).succeeded());

        let unvalidated = TableOutcome {
            migration: MigrationResult::succeeded("b", 1, Utc::now()),
            validation: Some(validation(false)),
        };
        assert!(!report(vec![ok.clone(), unvalidated]).succeeded());

        let skipped = TableOutcome {
            migration: MigrationResult::skipped("c"),
            validation: None,
        };
        let run = report(vec![ok, skipped]);
        assert!(!run.succeeded());
        assert_eq!(run.failed_tables(), vec!["c"]);
        assert_eq!(run.count(TableStatus::Skipped), 1);
    }

    #[test]
    fn test_empty_run_succeeds() {
        assert!(report(Vec::new()).succeeded());
    }

    #[test]
    fn test_result_json_shape() {
        let failed = MigrationResult::failed(
            "dbo.orders",
            5,
            Utc::now(),
            TableError::new(&MigrateError::schema("dbo.orders", "missing column"), TablePhase::Loading),
        );
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "schema");
        assert_eq!(json["error"]["phase"], "loading");

        let ok = serde_json::to_value(MigrationResult::succeeded("dbo.users", 1, Utc::now())).unwrap();
        assert!(ok.get("error").is_none());
    }
}
