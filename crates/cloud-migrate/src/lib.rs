//! # cloud-migrate
//!
//! Table-by-table migration of a SQL Server database into a cloud-hosted
//! PostgreSQL target, with verification.
//!
//! The library owns the pipeline:
//!
//! - **Per-table isolation**: a failing table gets a `failed` result, its
//!   siblings carry on
//! - **Batched streaming** over bounded channels, loaded with COPY one
//!   transaction per batch
//! - **Batch-level retries** of transient write failures with exponential backoff
//! - **Validation** by row counts and optional order-independent checksums
//! - **Validate-only runs** that never write to the target
//! - **Bounded parallelism** across tables, never two workers on one target table
//!
//! ## Example
//!
//! ```rust,no_run
//! use cloud_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> cloud_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config)?;
//!     if !orchestrator.connect_source().await {
//!         std::process::exit(1);
//!     }
//!     let report = orchestrator.run_migration(&CancellationToken::new()).await;
//!     println!("Migrated {} rows", report.rows_migrated());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod report;
pub mod source;
pub mod target;
pub mod transfer;
pub mod transform;
pub mod typemap;
pub mod verify;

// Re-exports for convenient access
pub use config::{
    Coercion, ColumnMapping, Config, DataSourceSpec, DataSources, MigrationConfig, SourceConfig,
    TableConfig, TargetConfig, TargetMode,
};
pub use core::{Batch, Column, SqlValue, TableRef, TargetColumn};
pub use error::{MigrateError, Result, Side};
pub use memory::{MemoryDatabase, MemorySource, MemoryTarget};
pub use orchestrator::{
    ErrorKind, MigrationResult, Orchestrator, RunReport, TableOutcome, TableStatus,
    ValidationReport,
};
pub use report::{JsonLinesSink, ReportSink, TableRecord, TracingSink};
pub use source::{MssqlSource, SourceConnector};
pub use target::{PostgresTarget, TargetLoader};
pub use transform::Transformer;
pub use verify::{ValidationResult, Validator};
