//! Error types for the migration library.

use std::fmt;

use thiserror::Error;

/// Which side of the migration a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, invalid table spec)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or target unreachable, or authentication rejected
    #[error("Connection error ({side}): {message}")]
    Connection { side: Side, message: String },

    /// Reading rows from the source failed
    #[error("Extraction failed for table {table}: {message}")]
    Extraction { table: String, message: String },

    /// A column mapping or coercion could not be applied
    #[error("Mapping failed for table {table}, column {column}: {message}")]
    Mapping {
        table: String,
        column: String,
        message: String,
    },

    /// Target table exists with an incompatible shape
    #[error("Schema error for table {table}: {message}")]
    Schema { table: String, message: String },

    /// Writing a batch to the target failed
    #[error("Load failed for table {table} after {rows_committed} committed rows: {message}")]
    Load {
        table: String,
        message: String,
        rows_committed: u64,
    },

    /// A network call did not complete within the configured timeout
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Source database driver error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database driver error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connection error
    pub fn connection(side: Side, message: impl fmt::Display) -> Self {
        MigrateError::Connection {
            side,
            message: message.to_string(),
        }
    }

    /// Create an Extraction error
    pub fn extraction(table: impl Into<String>, message: impl fmt::Display) -> Self {
        MigrateError::Extraction {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a Mapping error
    pub fn mapping(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        MigrateError::Mapping {
            table: table.into(),
            column: column.into(),
            message: message.to_string(),
        }
    }

    /// Create a Schema error
    pub fn schema(table: impl Into<String>, message: impl fmt::Display) -> Self {
        MigrateError::Schema {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        MigrateError::Timeout {
            operation: operation.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Whether a batch that failed with this error may be retried.
    ///
    /// Only connectivity-level failures qualify. Data errors (mapping, schema,
    /// constraint violations reported by the driver) never succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Timeout { .. } | MigrateError::Pool { .. } => true,
            MigrateError::Connection { .. } => true,
            MigrateError::Io(_) => true,
            MigrateError::Target(e) => e.is_closed() || e.code().is_none(),
            MigrateError::Source(e) => matches!(e, tiberius::error::Error::Io { .. }),
            _ => false,
        }
    }

    /// Whether this error aborts the whole run rather than a single table.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Config(_)
                | MigrateError::Connection {
                    side: Side::Source,
                    ..
                }
        )
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(MigrateError::timeout("write batch", Duration::from_secs(5)).is_transient());
        assert!(MigrateError::connection(Side::Target, "reset by peer").is_transient());
        assert!(!MigrateError::mapping("users", "email", "bad value").is_transient());
        assert!(!MigrateError::schema("users", "missing column").is_transient());
        assert!(!MigrateError::Cancelled.is_transient());
    }

    #[test]
    fn test_run_fatal_classification() {
        assert!(MigrateError::Config("tables is empty".into()).is_run_fatal());
        assert!(MigrateError::connection(Side::Source, "refused").is_run_fatal());
        assert!(!MigrateError::connection(Side::Target, "refused").is_run_fatal());
        assert!(!MigrateError::timeout("connecting", Duration::from_secs(1)).is_run_fatal());
    }

    #[test]
    fn test_load_error_reports_committed_rows() {
        let err = MigrateError::Load {
            table: "public.orders".into(),
            message: "connection closed".into(),
            rows_committed: 2000,
        };
        let msg = err.to_string();
        assert!(msg.contains("public.orders"));
        assert!(msg.contains("2000"));
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml");
        let err = MigrateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
    }
}
