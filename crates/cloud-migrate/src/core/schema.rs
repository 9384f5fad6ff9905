//! Table identifiers and column metadata.
//!
//! Table identifiers in configuration may be bare (`users`) or schema-qualified
//! (`dbo.users`); [`TableRef`] resolves them against a default schema and renders
//! them safely quoted for each dialect.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Maximum identifier length accepted in either dialect.
/// - PostgreSQL: 63 bytes (longer names are truncated by the server)
/// - SQL Server: 128 characters
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Reject identifiers that cannot be safely quoted.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(MigrateError::Config("identifier cannot be empty".to_string()));
    }
    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "identifier contains a null byte: {:?}",
            name
        )));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "identifier exceeds {} bytes: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }
    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded double quotes.
pub fn quote_pg(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL Server identifier, doubling embedded closing brackets.
pub fn quote_mssql(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// A resolved `schema.table` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    /// Parse a configured identifier, falling back to `default_schema` when bare.
    ///
    /// Only the first `.` separates schema from table; table names containing
    /// dots must be schema-qualified explicitly.
    pub fn parse(ident: &str, default_schema: &str) -> Result<Self> {
        let ident = ident.trim();
        let (schema, name) = match ident.split_once('.') {
            Some((schema, name)) => (schema.trim(), name.trim()),
            None => (default_schema, ident),
        };
        validate_identifier(schema)?;
        validate_identifier(name)?;
        Ok(Self {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }

    /// `"schema"."table"` for PostgreSQL.
    pub fn qualified_pg(&self) -> String {
        format!("{}.{}", quote_pg(&self.schema), quote_pg(&self.name))
    }

    /// `[schema].[table]` for SQL Server.
    pub fn qualified_mssql(&self) -> String {
        format!("{}.{}", quote_mssql(&self.schema), quote_mssql(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Source column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Data type (e.g., "int", "varchar", "datetime2").
    pub data_type: String,

    /// Maximum length for string/binary types (-1 for max).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,
}

impl Column {
    /// Shorthand for a column without length or precision.
    pub fn simple(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
        }
    }
}

/// A column as it should exist on the target, in target type vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}
