//! Column mapping between source and target row shapes.

mod coerce;

pub use coerce::{coerce, null_type};

use std::sync::Arc;

use crate::config::{Coercion, DataSourceSpec};
use crate::core::{Batch, SqlValue};
use crate::error::{MigrateError, Result};

/// Applies one table's column mappings to extracted rows.
///
/// Stateless across calls: the same input always yields the same output.
/// Source columns without a mapping are dropped.
#[derive(Debug, Clone)]
pub struct Transformer {
    spec: Arc<DataSourceSpec>,
    target_columns: Arc<[String]>,
}

impl Transformer {
    pub fn new(spec: Arc<DataSourceSpec>) -> Self {
        let target_columns: Arc<[String]> =
            spec.columns.iter().map(|m| m.target.clone()).collect();
        Self {
            spec,
            target_columns,
        }
    }

    /// Target column names, in output row order.
    pub fn target_columns(&self) -> Arc<[String]> {
        Arc::clone(&self.target_columns)
    }

    /// Map one source row, laid out per `columns`, to a target row.
    pub fn apply(&self, columns: &[String], row: &[SqlValue]) -> Result<Vec<SqlValue>> {
        let plan = self.plan(columns)?;
        self.apply_planned(&plan, row)
    }

    /// Map every row of a batch. An empty batch maps to an empty batch.
    pub fn apply_batch(&self, batch: &Batch) -> Result<Batch> {
        if batch.is_empty() {
            return Ok(Batch::new(self.target_columns(), Vec::new()));
        }
        let plan = self.plan(&batch.columns)?;
        let rows = batch
            .rows
            .iter()
            .map(|row| self.apply_planned(&plan, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch::new(self.target_columns(), rows))
    }

    /// Resolve each mapping to its source column position.
    fn plan(&self, columns: &[String]) -> Result<Vec<(usize, Option<Coercion>)>> {
        self.spec
            .columns
            .iter()
            .map(|mapping| {
                columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(&mapping.source))
                    .map(|idx| (idx, mapping.coerce))
                    .ok_or_else(|| {
                        MigrateError::mapping(
                            &self.spec.name,
                            &mapping.source,
                            "source column not present in extracted rows",
                        )
                    })
            })
            .collect()
    }

    fn apply_planned(
        &self,
        plan: &[(usize, Option<Coercion>)],
        row: &[SqlValue],
    ) -> Result<Vec<SqlValue>> {
        plan.iter()
            .zip(self.spec.columns.iter())
            .map(|(&(idx, coercion), mapping)| {
                let value = row.get(idx).ok_or_else(|| {
                    MigrateError::mapping(&self.spec.name, &mapping.source, "row is too short")
                })?;
                match coercion {
                    None => Ok(value.clone()),
                    Some(c) => coerce(value, c).map_err(|reason| {
                        MigrateError::mapping(&self.spec.name, &mapping.source, reason)
                    }),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnMapping;
    use crate::core::{SqlNullType, TableRef};
    use chrono::NaiveDate;

    fn transformer(columns: Vec<ColumnMapping>) -> Transformer {
        Transformer::new(Arc::new(DataSourceSpec {
            name: "events".into(),
            source: TableRef::parse("events", "dbo").unwrap(),
            target: TableRef::parse("events", "public").unwrap(),
            columns,
            batch_size: 10,
            order_by: None,
        }))
    }

    fn source_columns() -> Arc<[String]> {
        vec!["id".to_string(), "happened".to_string(), "secret".to_string()].into()
    }

    #[test]
    fn test_apply_renames_reorders_and_drops() {
        let t = transformer(vec![
            ColumnMapping::new("happened", "occurred_on").with_coercion(Coercion::Date),
            ColumnMapping::new("id", "event_id"),
        ]);
        let row = vec![
            SqlValue::I32(5),
            SqlValue::from("2024-01-02 03:04:05"),
            SqlValue::from("hunter2"),
        ];
        let out = t.apply(&source_columns(), &row).unwrap();
        assert_eq!(
            out,
            vec![
                SqlValue::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
                SqlValue::I32(5),
            ]
        );
        assert_eq!(&*t.target_columns(), &["occurred_on".to_string(), "event_id".to_string()]);
    }

    #[test]
    fn test_apply_is_pure() {
        let t = transformer(vec![ColumnMapping::new("id", "id")]);
        let row = vec![SqlValue::I32(1), SqlValue::Null(SqlNullType::String), SqlValue::from("x")];
        let first = t.apply(&source_columns(), &row).unwrap();
        let second = t.apply(&source_columns(), &row).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_source_column_fails_on_first_row() {
        let t = transformer(vec![ColumnMapping::new("email", "email")]);
        let empty = Batch::new(source_columns(), vec![]);
        assert!(t.apply_batch(&empty).unwrap().is_empty());

        let batch = Batch::new(
            source_columns(),
            vec![vec![SqlValue::I32(1), SqlValue::from("x"), SqlValue::from("y")]],
        );
        let err = t.apply_batch(&batch).unwrap_err();
        assert!(matches!(err, MigrateError::Mapping { ref column, .. } if column == "email"));
    }

    #[test]
    fn test_coercion_failure_is_mapping_error() {
        let t = transformer(vec![
            ColumnMapping::new("happened", "happened").with_coercion(Coercion::Timestamp),
        ]);
        let batch = Batch::new(
            source_columns(),
            vec![vec![SqlValue::I32(1), SqlValue::from("not a date"), SqlValue::from("y")]],
        );
        let err = t.apply_batch(&batch).unwrap_err();
        assert!(err.to_string().contains("not a date"));
    }

    #[test]
    fn test_same_source_column_mapped_twice() {
        let t = transformer(vec![
            ColumnMapping::new("id", "id"),
            ColumnMapping::new("id", "legacy_id").with_coercion(Coercion::Text),
        ]);
        let batch = Batch::new(
            source_columns(),
            vec![vec![SqlValue::I32(9), SqlValue::from("x"), SqlValue::from("y")]],
        );
        let out = t.apply_batch(&batch).unwrap();
        assert_eq!(out.rows[0], vec![SqlValue::I32(9), SqlValue::from("9")]);
        assert_eq!(out.columns.len(), 2);
    }
}
