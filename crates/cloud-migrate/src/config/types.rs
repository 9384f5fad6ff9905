//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MSSQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Tables to migrate, in processing order.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Source database (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema applied to bare table names (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema applied to bare table names (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Tables migrated concurrently. 1 processes tables strictly in order.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rows per batch for tables that do not declare their own.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound for any single network call, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Retries of a transiently failed batch write before the table fails.
    #[serde(default)]
    pub max_retries: u32,

    /// Base delay for exponential backoff between batch retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Compare content checksums in addition to row counts.
    #[serde(default)]
    pub checksum: bool,

    /// What to do with rows already in the target table.
    #[serde(default)]
    pub target_mode: TargetMode,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            timeout_seconds: default_timeout_seconds(),
            max_retries: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            checksum: false,
            target_mode: TargetMode::default(),
        }
    }
}

impl MigrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Target mode for migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Empty the target table before loading.
    #[default]
    Truncate,

    /// Keep existing target rows and add to them.
    Append,
}

/// One `tables:` entry as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Source table identifier (`schema.table` or bare).
    pub source: String,

    /// Target table identifier; defaults to the source table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Rows per batch for this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Column giving a deterministic extraction order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,

    /// Source-to-target column mappings, in target column order.
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
}

/// Maps one source column to one target column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coerce: Option<Coercion>,
}

impl ColumnMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            coerce: None,
        }
    }

    pub fn with_coercion(mut self, coerce: Coercion) -> Self {
        self.coerce = Some(coerce);
        self
    }
}

/// Type conversion applied to a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    Text,
    Integer,
    Bigint,
    Float,
    Boolean,
    Decimal,
    Timestamp,
    Date,
    Uuid,
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Coercion::Text => "text",
            Coercion::Integer => "integer",
            Coercion::Bigint => "bigint",
            Coercion::Float => "float",
            Coercion::Boolean => "boolean",
            Coercion::Decimal => "decimal",
            Coercion::Timestamp => "timestamp",
            Coercion::Date => "date",
            Coercion::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    10_000
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_retry_base_delay_ms() -> u64 {
    500
}
