//! Connection and migration settings checks.
//!
//! Table entries are validated separately by [`super::DataSources::load`].

use super::Config;
use crate::error::{MigrateError, Result};
use crate::target::SslMode;

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MigrateError::Config(format!("{} is required", field)));
    }
    Ok(())
}

fn at_least_one(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(MigrateError::Config(format!("{} must be at least 1", field)));
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    let (source, target) = (&config.source, &config.target);

    for (field, value) in [
        ("source.host", &source.host),
        ("source.database", &source.database),
        ("source.user", &source.user),
        ("target.host", &target.host),
        ("target.database", &target.database),
        ("target.user", &target.user),
    ] {
        required(field, value)?;
    }
    target.ssl_mode.parse::<SslMode>()?;

    if source.host == target.host && source.port == target.port && source.database == target.database {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let migration = &config.migration;
    at_least_one("migration.workers", migration.workers as u64)?;
    at_least_one("migration.batch_size", migration.batch_size as u64)?;
    at_least_one("migration.timeout_seconds", migration.timeout_seconds)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_yaml(
            r#"
source: { host: mssql.internal, database: Sales, user: migrator, password: pw }
target: { host: sales.postgres.cloud, database: sales, user: loader, password: pw }
tables:
  - source: users
    columns: [{ source: id, target: id }]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&config()).is_ok());
    }

    #[test]
    fn test_blank_required_fields_named_in_error() {
        let mut c = config();
        c.source.host = "  ".into();
        assert!(validate(&c).unwrap_err().to_string().contains("source.host"));

        let mut c = config();
        c.target.user.clear();
        assert!(validate(&c).unwrap_err().to_string().contains("target.user"));
    }

    #[test]
    fn test_ssl_mode_checked() {
        let mut c = config();
        c.target.ssl_mode = "sometimes".into();
        assert!(validate(&c).is_err());

        c.target.ssl_mode = "VERIFY-FULL".into();
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut c = config();
        c.target.host = c.source.host.clone();
        c.target.port = c.source.port;
        c.target.database = c.source.database.clone();
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_zero_settings_rejected() {
        let mut c = config();
        c.migration.workers = 0;
        assert!(validate(&c).unwrap_err().to_string().contains("workers"));

        let mut c = config();
        c.migration.timeout_seconds = 0;
        assert!(validate(&c).unwrap_err().to_string().contains("timeout_seconds"));
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let mut c = config();
        c.source.password = "source-secret-123".into();
        c.target.password = "target-secret-456".into();
        let rendered = format!("{:?}", c);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("source-secret-123"));
        assert!(!rendered.contains("target-secret-456"));
    }
}
