//! Per-table structured records for the caller's log/report sink.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::orchestrator::{MigrationResult, TableStatus};
use crate::verify::ValidationResult;

/// One structured record per table outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    pub table: String,

    /// `succeeded`, `failed`, `skipped`, or for validate-only runs `passed` / `failed`.
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_migrated: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_passed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TableRecord {
    /// Record for a migrated table, with its validation verdict when one was taken.
    pub fn migration(result: &MigrationResult, validation: Option<&ValidationResult>) -> Self {
        let error = match (&result.error, validation) {
            (Some(e), _) => Some(e.message.clone()),
            (None, Some(v)) if !v.validation_passed => Some(v.diagnostic.clone()),
            _ => None,
        };
        Self {
            table: result.table.clone(),
            status: result.status.to_string(),
            rows_migrated: Some(result.rows_migrated),
            validation_passed: validation.map(|v| v.validation_passed),
            error,
            started_at: result.started_at,
            completed_at: result.completed_at,
        }
    }

    /// Record for a validate-only check.
    pub fn validation(
        result: &ValidationResult,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            table: result.table.clone(),
            status: if result.validation_passed { "passed" } else { "failed" }.to_string(),
            rows_migrated: None,
            validation_passed: Some(result.validation_passed),
            error: (!result.validation_passed).then(|| result.diagnostic.clone()),
            started_at,
            completed_at,
        }
    }
}

/// Receives one record per table as soon as its outcome is known.
pub trait ReportSink: Send + Sync {
    fn record(&self, record: &TableRecord);
}

/// Emits records as tracing events. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn record(&self, record: &TableRecord) {
        let rows = record.rows_migrated.unwrap_or(0);
        match (record.status.as_str(), &record.error) {
            ("succeeded" | "passed", _) => info!(
                table = %record.table,
                status = %record.status,
                rows,
                validation_passed = ?record.validation_passed,
                "table complete"
            ),
            ("skipped", _) => warn!(table = %record.table, status = %record.status, "table skipped"),
            (_, error) => error!(
                table = %record.table,
                status = %record.status,
                rows,
                error = error.as_deref().unwrap_or(""),
                "table failed"
            ),
        }
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ReportSink for JsonLinesSink {
    fn record(&self, record: &TableRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize report record for {}: {}", record.table, e);
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Failed to write report record for {}: {}", record.table, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{ErrorKind, TableError, TablePhase};
    use tempfile::NamedTempFile;

    fn succeeded() -> MigrationResult {
        let now = Utc::now();
        MigrationResult {
            table: "dbo.users".into(),
            status: TableStatus::Succeeded,
            rows_migrated: 100,
            started_at: now,
            completed_at: now,
            error: None,
        }
    }

    #[test]
    fn test_migration_record_carries_validation() {
        let validation = ValidationResult {
            table: "dbo.users".into(),
            validation_passed: true,
            source_count: Some(100),
            target_count: Some(100),
            checksum_mismatch: None,
            diagnostic: "100 rows, counts match".into(),
        };
        let record = TableRecord::migration(&succeeded(), Some(&validation));
        assert_eq!(record.status, "succeeded");
        assert_eq!(record.rows_migrated, Some(100));
        assert_eq!(record.validation_passed, Some(true));
        assert!(record.error.is_none());
    }

    #[test]
    fn test_failed_record_carries_error() {
        let mut result = succeeded();
        result.status = TableStatus::Failed;
        result.error = Some(TableError {
            kind: ErrorKind::Connection,
            phase: TablePhase::Loading,
            message: "target unreachable".into(),
        });
        let record = TableRecord::migration(&result, None);
        assert_eq!(record.status, "failed");
        assert_eq!(record.error.as_deref(), Some("target unreachable"));
    }

    #[test]
    fn test_json_lines_sink_appends_one_line_per_record() {
        let file = NamedTempFile::new().unwrap();
        let sink = JsonLinesSink::create(file.path()).unwrap();
        let record = TableRecord::migration(&succeeded(), None);
        sink.record(&record);
        sink.record(&record);

        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TableRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
    }
}
