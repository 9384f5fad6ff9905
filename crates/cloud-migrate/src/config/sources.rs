//! The resolved, immutable list of tables a run operates on.

use std::collections::HashSet;
use std::sync::Arc;

use super::{ColumnMapping, Config, TableConfig};
use crate::core::{validate_identifier, TableRef};
use crate::error::{MigrateError, Result};

/// One table to migrate, with identifiers resolved against the configured schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceSpec {
    /// Identifier as written in the configuration; used in results and filters.
    pub name: String,

    /// Source table.
    pub source: TableRef,

    /// Target table.
    pub target: TableRef,

    /// Column mappings in target column order. Never empty.
    pub columns: Vec<ColumnMapping>,

    /// Rows per batch. Always positive.
    pub batch_size: usize,

    /// Column giving a deterministic extraction order.
    pub order_by: Option<String>,
}

impl DataSourceSpec {
    fn resolve(entry: &TableConfig, config: &Config) -> Result<Self> {
        let name = entry.source.trim().to_string();
        if name.is_empty() {
            return Err(MigrateError::Config("tables[].source is required".into()));
        }
        let invalid = |message: String| {
            MigrateError::Config(format!("table '{}': {}", name, message))
        };

        let source = TableRef::parse(&name, &config.source.schema)
            .map_err(|e| invalid(e.to_string()))?;
        let target = match entry.target.as_deref() {
            Some(target) => TableRef::parse(target, &config.target.schema),
            None => TableRef::parse(&source.name, &config.target.schema),
        }
        .map_err(|e| invalid(e.to_string()))?;

        if entry.columns.is_empty() {
            return Err(invalid("column mapping list is empty".into()));
        }
        let mut seen = HashSet::new();
        for mapping in &entry.columns {
            validate_identifier(&mapping.source)
                .and_then(|_| validate_identifier(&mapping.target))
                .map_err(|e| invalid(e.to_string()))?;
            if !seen.insert(mapping.target.as_str()) {
                return Err(invalid(format!(
                    "target column '{}' is mapped more than once",
                    mapping.target
                )));
            }
        }

        if let Some(order_by) = &entry.order_by {
            validate_identifier(order_by).map_err(|e| invalid(e.to_string()))?;
        }

        let batch_size = entry.batch_size.unwrap_or(config.migration.batch_size);
        if batch_size == 0 {
            return Err(invalid("batch_size must be at least 1".into()));
        }

        Ok(Self {
            name,
            source,
            target,
            columns: entry.columns.clone(),
            batch_size,
            order_by: entry.order_by.clone(),
        })
    }

    /// Whether `name` refers to this table by any of its identifiers.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim();
        self.name == name
            || self.source.name == name
            || self.source.to_string() == name
            || self.target.name == name
            || self.target.to_string() == name
    }

    /// Source column names in mapping order, without duplicates.
    pub fn source_columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .filter(|m| seen.insert(m.source.as_str()))
            .map(|m| m.source.clone())
            .collect()
    }
}

/// Ordered, immutable table list. Filtering produces a new view.
#[derive(Debug, Clone, Default)]
pub struct DataSources {
    specs: Vec<Arc<DataSourceSpec>>,
}

impl DataSources {
    /// Resolve and validate every `tables:` entry.
    pub fn load(config: &Config) -> Result<Self> {
        if config.tables.is_empty() {
            return Err(MigrateError::Config("no tables configured".into()));
        }

        let mut names = HashSet::new();
        let mut specs = Vec::with_capacity(config.tables.len());
        for entry in &config.tables {
            let spec = DataSourceSpec::resolve(entry, config)?;
            if !names.insert(spec.name.clone()) {
                return Err(MigrateError::Config(format!(
                    "table '{}' is listed more than once",
                    spec.name
                )));
            }
            specs.push(Arc::new(spec));
        }

        Ok(Self { specs })
    }

    /// Narrow to tables matching any of `names`, preserving configuration order.
    ///
    /// An empty set leaves the list unchanged.
    pub fn filter(&self, names: &HashSet<String>) -> Self {
        if names.is_empty() {
            return self.clone();
        }
        Self {
            specs: self
                .specs
                .iter()
                .filter(|spec| names.iter().any(|n| spec.matches(n)))
                .cloned()
                .collect(),
        }
    }

    /// Names from `names` that match no table in this list, sorted.
    pub fn missing(&self, names: &HashSet<String>) -> Vec<String> {
        let mut missing: Vec<String> = names
            .iter()
            .filter(|n| !self.specs.iter().any(|spec| spec.matches(n)))
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DataSourceSpec>> {
        self.specs.iter().find(|spec| spec.matches(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataSourceSpec>> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: mssql.internal
  database: Sales
  user: migrator
target:
  host: cloud.example.com
  database: sales
  user: loader
migration:
  batch_size: 2500
tables:
  - source: dbo.users
    columns:
      - { source: id, target: id }
      - { source: name, target: name }
  - source: orders
    target: archive.orders
    batch_size: 100
    order_by: order_id
    columns:
      - { source: order_id, target: id }
  - source: sales.invoices
    columns:
      - { source: invoice_no, target: invoice_no }
"#;

    fn load() -> DataSources {
        let config = Config::from_yaml(YAML).unwrap();
        DataSources::load(&config).unwrap()
    }

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_resolves_identifiers() {
        let sources = load();
        assert_eq!(sources.len(), 3);

        let users = sources.get("dbo.users").unwrap();
        assert_eq!(users.source.to_string(), "dbo.users");
        assert_eq!(users.target.to_string(), "public.users");
        assert_eq!(users.batch_size, 2500);

        let orders = sources.get("orders").unwrap();
        assert_eq!(orders.source.to_string(), "dbo.orders");
        assert_eq!(orders.target.to_string(), "archive.orders");
        assert_eq!(orders.batch_size, 100);
        assert_eq!(orders.order_by.as_deref(), Some("order_id"));
    }

    #[test]
    fn test_filter_empty_set_is_identity() {
        let sources = load();
        let filtered = sources.filter(&HashSet::new());
        assert_eq!(filtered.names(), sources.names());
    }

    #[test]
    fn test_filter_subset_preserves_order() {
        let sources = load();
        let filtered = sources.filter(&names(&["sales.invoices", "users"]));
        assert_eq!(filtered.names(), vec!["dbo.users", "sales.invoices"]);
        // The original view is untouched.
        assert_eq!(sources.len(), 3);
    }

    #[test]
    fn test_filter_ignores_unknown_names() {
        let sources = load();
        let wanted = names(&["orders", "ghost"]);
        let filtered = sources.filter(&wanted);
        assert_eq!(filtered.names(), vec!["orders"]);
        assert_eq!(sources.missing(&wanted), vec!["ghost"]);
    }

    #[test]
    fn test_empty_mapping_rejected() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.tables[0].columns.clear();
        let err = DataSources::load(&config).unwrap_err();
        assert!(err.to_string().contains("column mapping list is empty"));
    }

    #[test]
    fn test_duplicate_target_column_rejected() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.tables[0].columns.push(ColumnMapping::new("email", "name"));
        assert!(DataSources::load(&config).is_err());
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut config = Config::from_yaml(YAML).unwrap();
        let first = config.tables[0].clone();
        config.tables.push(first);
        let err = DataSources::load(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_no_tables_rejected() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.tables.clear();
        assert!(DataSources::load(&config).is_err());
    }

    #[test]
    fn test_zero_table_batch_size_rejected() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.tables[1].batch_size = Some(0);
        assert!(DataSources::load(&config).is_err());
    }
}
