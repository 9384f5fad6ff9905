//! Configuration loading and validation.

mod sources;
mod types;
mod validation;

pub use sources::{DataSourceSpec, DataSources};
pub use types::*;

use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| MigrateError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration, stamped on every run report.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source: { host: src, database: app, user: sa, password: pw }
target: { host: dst, database: app, user: pg, password: pw }
tables:
  - source: users
    columns: [{ source: id, target: id }]
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.source.schema, "dbo");
        assert!(config.source.encrypt);
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.target.ssl_mode, "require");
        assert_eq!(config.migration.workers, 1);
        assert_eq!(config.migration.batch_size, 10_000);
        assert_eq!(config.migration.timeout_seconds, 300);
        assert_eq!(config.migration.max_retries, 0);
        assert!(!config.migration.checksum);
        assert_eq!(config.migration.target_mode, TargetMode::Truncate);
    }

    #[test]
    fn test_coercion_parsing() {
        let yaml = MINIMAL.replace(
            "columns: [{ source: id, target: id }]",
            "columns: [{ source: id, target: id }, { source: created, target: created_at, coerce: timestamp }]",
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.tables[0].columns[1].coerce, Some(Coercion::Timestamp));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = Config::from_yaml("source: [").unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_missing_required_field_is_config_error() {
        let err = Config::from_yaml("source: { host: src }\n").unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.tables.len(), 1);
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let b = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);

        let mut c = b.clone();
        c.migration.batch_size = 5;
        assert_ne!(a.hash(), c.hash());
    }
}
