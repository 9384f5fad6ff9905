//! Migration orchestrator - main workflow coordinator.
//!
//! Owns the resolved table list and both connectors, runs every table
//! through extract, transform, load and validate, and aggregates the
//! per-table outcomes. A table's failure is recorded in its own result and
//! never stops its siblings.

mod result;
mod table;

pub use result::{
    ErrorKind, MigrationResult, RunReport, TableError, TableOutcome, TablePhase, TableStatus,
    ValidationReport,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DataSources};
use crate::core::TableRef;
use crate::error::{MigrateError, Result, Side};
use crate::report::{ReportSink, TableRecord, TracingSink};
use crate::source::{MssqlSource, SourceConnector};
use crate::target::{PostgresTarget, TargetLoader};
use crate::transfer::RetryPolicy;
use crate::verify::{ValidationResult, Validator};
use table::{RunSettings, TableRunner};

/// Migration orchestrator.
///
/// Cheap to clone; clones share connectors and configuration.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    config_hash: String,
    sources: DataSources,
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetLoader>,
    validator: Arc<Validator>,
    sink: Arc<dyn ReportSink>,
}

/// A table slot in a run, in configuration order.
enum Slot {
    Done(TableOutcome),
    Running(String, JoinHandle<TableOutcome>),
}

impl Orchestrator {
    /// Create an orchestrator over MSSQL and PostgreSQL.
    ///
    /// Pools are sized to the worker count and connect lazily.
    pub fn new(config: Config) -> Result<Self> {
        let workers = config.migration.workers.max(1);
        let timeout = config.migration.timeout();
        let source = MssqlSource::new(&config.source, workers as u32, timeout);
        let target = PostgresTarget::new(&config.target, workers, timeout)?;
        Self::with_connectors(config, Arc::new(source), Arc::new(target))
    }

    /// Create an orchestrator over caller-supplied connectors.
    pub fn with_connectors(
        config: Config,
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetLoader>,
    ) -> Result<Self> {
        let sources = Self::load(&config)?;
        let validator = Arc::new(Validator::new(
            Arc::clone(&source),
            Arc::clone(&target),
            config.migration.timeout(),
            config.migration.checksum,
        ));
        Ok(Self {
            config_hash: config.hash(),
            config: Arc::new(config),
            sources,
            source,
            target,
            validator,
            sink: Arc::new(TracingSink),
        })
    }

    /// Resolve and check the configured table list.
    pub fn load(config: &Config) -> Result<DataSources> {
        DataSources::load(config)
    }

    /// Send per-table records to `sink` instead of the log.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The active table list.
    pub fn data_sources(&self) -> &DataSources {
        &self.sources
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A view narrowed to `names`. Names not in the configuration are
    /// logged and ignored; an empty set keeps every table.
    pub fn filter(&self, names: &HashSet<String>) -> Self {
        for missing in self.sources.missing(names) {
            warn!("Table '{}' is not in the configuration, ignoring", missing);
        }
        let mut view = self.clone();
        view.sources = self.sources.filter(names);
        view
    }

    /// Check source connectivity. Returns false instead of failing.
    pub async fn connect_source(&self) -> bool {
        match self.source.connect().await {
            Ok(()) => true,
            Err(e) => {
                let e = if e.is_run_fatal() {
                    e
                } else {
                    MigrateError::connection(Side::Source, e)
                };
                error!("Failed to connect to source ({}): {}", self.source.db_type(), e);
                false
            }
        }
    }

    /// Migrate every active table.
    ///
    /// Returns one outcome per active table in configuration order. If the
    /// source is unreachable every table is skipped. Once `cancel` fires the
    /// in-flight tables stop at their next batch boundary and tables not yet
    /// started are skipped.
    pub async fn run_migration(&self, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let workers = self.config.migration.workers.max(1);

        info!(
            "Starting migration run {} ({} tables, {} workers)",
            run_id,
            self.sources.len(),
            workers
        );

        let tables = if self.connect_source().await {
            self.run_tables(workers, cancel).await
        } else {
            error!("Source unavailable, skipping all tables");
            self.sources
                .iter()
                .map(|spec| {
                    let migration = MigrationResult::skipped(&spec.name);
                    self.sink.record(&TableRecord::migration(&migration, None));
                    TableOutcome {
                        migration,
                        validation: None,
                    }
                })
                .collect()
        };

        let report = RunReport {
            run_id,
            config_hash: self.config_hash.clone(),
            started_at,
            completed_at: Utc::now(),
            tables,
        };

        info!(
            "Migration run {} finished: {} succeeded, {} failed, {} skipped, {} rows",
            report.run_id,
            report.count(TableStatus::Succeeded),
            report.count(TableStatus::Failed),
            report.count(TableStatus::Skipped),
            report.rows_migrated()
        );
        report
    }

    async fn run_tables(&self, workers: usize, cancel: &CancellationToken) -> Vec<TableOutcome> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let settings = RunSettings {
            timeout: self.config.migration.timeout(),
            retry: RetryPolicy::new(
                self.config.migration.max_retries,
                self.config.migration.retry_base_delay(),
            ),
            target_mode: self.config.migration.target_mode,
        };

        // No two workers may touch the same target table at once.
        let mut table_locks: HashMap<TableRef, Arc<Mutex<()>>> = HashMap::new();
        let mut slots = Vec::with_capacity(self.sources.len());

        for spec in self.sources.iter() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                info!("{}: skipped, run cancelled", spec.name);
                let migration = MigrationResult::skipped(&spec.name);
                self.sink.record(&TableRecord::migration(&migration, None));
                slots.push(Slot::Done(TableOutcome {
                    migration,
                    validation: None,
                }));
                continue;
            };

            let lock = Arc::clone(table_locks.entry(spec.target.clone()).or_default());
            let runner = TableRunner {
                spec: Arc::clone(spec),
                source: Arc::clone(&self.source),
                target: Arc::clone(&self.target),
                validator: Arc::clone(&self.validator),
                settings: settings.clone(),
                cancel: cancel.clone(),
                sink: Arc::clone(&self.sink),
            };

            let handle = tokio::spawn(async move {
                let _guard = lock.lock().await;
                let outcome = runner.run().await;
                drop(permit);
                outcome
            });
            slots.push(Slot::Running(spec.name.clone(), handle));
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for slot in slots {
            let outcome = match slot {
                Slot::Done(outcome) => outcome,
                Slot::Running(name, handle) => match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("{}: worker task panicked - {}", name, e);
                        let error = TableError {
                            kind: ErrorKind::Internal,
                            phase: TablePhase::Pending,
                            message: format!("worker task panicked: {}", e),
                        };
                        let migration = MigrationResult::failed(&name, 0, Utc::now(), error);
                        self.sink.record(&TableRecord::migration(&migration, None));
                        TableOutcome {
                            migration,
                            validation: None,
                        }
                    }
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Validate one table without extracting or loading anything.
    ///
    /// A name outside the active list yields a failed result.
    pub async fn validate(&self, table: &str) -> ValidationResult {
        match self.sources.get(table) {
            Some(spec) => self.validator.validate(spec).await,
            None => ValidationResult::failed(table, "table is not in the active data-source list"),
        }
    }

    /// Validate every active table, in configuration order.
    pub async fn validate_all(&self) -> ValidationReport {
        let started_at = Utc::now();
        let mut tables = Vec::with_capacity(self.sources.len());

        for spec in self.sources.iter() {
            let table_started = Utc::now();
            let result = self.validator.validate(spec).await;
            self.sink
                .record(&TableRecord::validation(&result, table_started, Utc::now()));
            tables.push(result);
        }

        ValidationReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            config_hash: self.config_hash.clone(),
            started_at,
            completed_at: Utc::now(),
            tables,
        }
    }

    /// Release both connectors.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}
