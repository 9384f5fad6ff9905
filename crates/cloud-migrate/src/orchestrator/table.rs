//! One table's pass through extract, transform, load and validate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::result::{ErrorKind, MigrationResult, TableError, TableOutcome, TablePhase};
use crate::config::{DataSourceSpec, TargetMode};
use crate::core::TargetColumn;
use crate::error::{MigrateError, Result};
use crate::report::{ReportSink, TableRecord};
use crate::source::{ExtractRequest, SourceConnector};
use crate::target::{LoadContext, TargetLoader};
use crate::transfer::{receiver_stream, BatchStream, RetryPolicy};
use crate::transform::Transformer;
use crate::typemap;
use crate::verify::{ValidationResult, Validator};

/// Per-run settings shared by every table.
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub target_mode: TargetMode,
}

/// Everything one worker needs to process one table.
pub(crate) struct TableRunner {
    pub spec: Arc<DataSourceSpec>,
    pub source: Arc<dyn SourceConnector>,
    pub target: Arc<dyn TargetLoader>,
    pub validator: Arc<Validator>,
    pub settings: RunSettings,
    pub cancel: CancellationToken,
    pub sink: Arc<dyn ReportSink>,
}

impl TableRunner {
    /// Run the table to a terminal state and report it.
    ///
    /// Never fails: every error becomes part of the returned outcome.
    pub async fn run(self) -> TableOutcome {
        let name = self.spec.name.clone();

        if self.cancel.is_cancelled() {
            info!("{}: skipped, run cancelled before start", name);
            return self.finish(MigrationResult::skipped(&name), None);
        }

        let started_at = Utc::now();
        let ctx = LoadContext::new(self.settings.timeout, self.settings.retry, self.cancel.clone());
        info!("{}: starting migration", name);

        let migration = match self.migrate(&ctx).await {
            Ok(rows) => {
                info!("{}: loaded {} rows", name, rows);
                MigrationResult::succeeded(&name, rows, started_at)
            }
            Err((phase, e)) => {
                let rows = match &e {
                    MigrateError::Load { rows_committed, .. } => *rows_committed,
                    _ => ctx.rows_committed(),
                };
                error!("{}: failed while {}: {}", name, phase, e);
                MigrationResult::failed(&name, rows, started_at, TableError::new(&e, phase))
            }
        };

        let cancelled = matches!(
            migration.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Cancelled)
        );
        let validation = if cancelled {
            warn!("{}: cancelled mid-load, validation not attempted", name);
            None
        } else {
            debug!("{}: {}", name, TablePhase::Validating);
            Some(self.validator.validate(&self.spec).await)
        };

        self.finish(migration, validation)
    }

    fn finish(
        &self,
        migration: MigrationResult,
        validation: Option<ValidationResult>,
    ) -> TableOutcome {
        self.sink
            .record(&TableRecord::migration(&migration, validation.as_ref()));
        TableOutcome {
            migration,
            validation,
        }
    }

    /// Extract, transform and load. Returns rows committed.
    async fn migrate(&self, ctx: &LoadContext) -> std::result::Result<u64, (TablePhase, MigrateError)> {
        let spec = &self.spec;

        debug!("{}: {}", spec.name, TablePhase::Extracting);
        let source_columns = self
            .source
            .describe(&spec.source)
            .await
            .map_err(|e| (TablePhase::Extracting, e))?;

        debug!("{}: {}", spec.name, TablePhase::Transforming);
        let target_columns = typemap::target_columns(spec, &source_columns)
            .map_err(|e| (TablePhase::Transforming, e))?;

        debug!("{}: {}", spec.name, TablePhase::Loading);
        self.prepare_target(&target_columns)
            .await
            .map_err(|e| (TablePhase::Loading, e))?;

        let request = ExtractRequest::for_spec(spec, self.settings.timeout);
        let transformer = Transformer::new(Arc::clone(spec));
        let batches: BatchStream = receiver_stream(self.source.extract(request))
            .map(move |batch| batch.and_then(|b| transformer.apply_batch(&b)))
            .boxed();

        self.target
            .load(&spec.target, batches, ctx)
            .await
            .map_err(|e| (phase_of(&e), e))
    }

    async fn prepare_target(&self, columns: &[TargetColumn]) -> Result<()> {
        let table = &self.spec.target;
        self.target.connect().await?;
        self.target.ensure_schema(table, columns).await?;
        self.target.prepare(table, self.settings.target_mode).await
    }
}

/// Phase an error arriving during streaming belongs to.
fn phase_of(err: &MigrateError) -> TablePhase {
    match err {
        MigrateError::Extraction { .. } | MigrateError::Source(_) => TablePhase::Extracting,
        MigrateError::Mapping { .. } => TablePhase::Transforming,
        _ => TablePhase::Loading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Side;

    #[test]
    fn test_stream_errors_attribute_to_phase() {
        assert_eq!(
            phase_of(&MigrateError::extraction("t", "lost")),
            TablePhase::Extracting
        );
        assert_eq!(
            phase_of(&MigrateError::mapping("t", "c", "bad")),
            TablePhase::Transforming
        );
        assert_eq!(
            phase_of(&MigrateError::connection(Side::Target, "reset")),
            TablePhase::Loading
        );
    }
}
