//! Type mapping between MSSQL and PostgreSQL.

use crate::config::{Coercion, DataSourceSpec};
use crate::core::{Column, TargetColumn};
use crate::error::{MigrateError, Result};

/// Map an MSSQL data type to PostgreSQL.
pub fn mssql_to_postgres(mssql_type: &str, max_length: i32, precision: i32, scale: i32) -> String {
    match mssql_type.to_lowercase().as_str() {
        // Boolean
        "bit" => "boolean".to_string(),

        // Integer types
        "tinyint" | "smallint" => "smallint".to_string(),
        "int" => "integer".to_string(),
        "bigint" => "bigint".to_string(),

        // Decimal/numeric
        "decimal" | "numeric" => {
            if precision > 0 {
                format!("numeric({},{})", precision, scale)
            } else {
                "numeric".to_string()
            }
        }
        "money" => "numeric(19,4)".to_string(),
        "smallmoney" => "numeric(10,4)".to_string(),

        // Floating point
        "float" => "double precision".to_string(),
        "real" => "real".to_string(),

        // String types
        "char" | "nchar" if max_length > 0 => format!("char({})", max_length),
        "varchar" | "nvarchar" if max_length > 0 && max_length <= 10_485_760 => {
            format!("varchar({})", max_length)
        }
        "char" | "nchar" | "varchar" | "nvarchar" | "text" | "ntext" => "text".to_string(),

        // Binary types
        "binary" | "varbinary" | "image" | "rowversion" | "timestamp" => "bytea".to_string(),

        // Date/time types
        "date" => "date".to_string(),
        "time" => "time".to_string(),
        "datetime" | "datetime2" | "smalldatetime" => "timestamp".to_string(),
        "datetimeoffset" => "timestamptz".to_string(),

        // GUID
        "uniqueidentifier" => "uuid".to_string(),

        // Spatial, xml, sql_variant and anything unknown travel as text
        _ => "text".to_string(),
    }
}

/// PostgreSQL type produced by an explicit coercion.
pub fn coercion_to_postgres(coercion: Coercion) -> &'static str {
    match coercion {
        Coercion::Text => "text",
        Coercion::Integer => "integer",
        Coercion::Bigint => "bigint",
        Coercion::Float => "double precision",
        Coercion::Boolean => "boolean",
        Coercion::Decimal => "numeric",
        Coercion::Timestamp => "timestamp",
        Coercion::Date => "date",
        Coercion::Uuid => "uuid",
    }
}

/// Derive the target column list for a table from its source metadata.
///
/// Fails with a mapping error naming the first mapped source column that
/// the source table does not have.
pub fn target_columns(spec: &DataSourceSpec, source: &[Column]) -> Result<Vec<TargetColumn>> {
    spec.columns
        .iter()
        .map(|mapping| {
            let column = source
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&mapping.source))
                .ok_or_else(|| {
                    MigrateError::mapping(
                        &spec.name,
                        &mapping.source,
                        format!("source column does not exist in {}", spec.source),
                    )
                })?;
            let data_type = match mapping.coerce {
                Some(coercion) => coercion_to_postgres(coercion).to_string(),
                None => mssql_to_postgres(
                    &column.data_type,
                    column.max_length,
                    column.precision,
                    column.scale,
                ),
            };
            Ok(TargetColumn {
                name: mapping.target.clone(),
                data_type,
                nullable: column.is_nullable,
            })
        })
        .collect()
}

/// Whether an existing target column type can receive values of `wanted`.
///
/// Comparison ignores length and precision modifiers and treats the
/// information_schema spellings as equal to their short forms.
pub fn compatible(existing: &str, wanted: &str) -> bool {
    fn base(t: &str) -> String {
        let t = t.to_lowercase();
        let t = t.split('(').next().unwrap_or("").trim().to_string();
        match t.as_str() {
            "character varying" | "varchar" | "character" | "char" | "bpchar" | "text" => {
                "text".to_string()
            }
            "timestamp without time zone" => "timestamp".to_string(),
            "timestamp with time zone" => "timestamptz".to_string(),
            "time without time zone" => "time".to_string(),
            "decimal" => "numeric".to_string(),
            "int" | "int4" => "integer".to_string(),
            "int8" => "bigint".to_string(),
            "int2" => "smallint".to_string(),
            "float8" => "double precision".to_string(),
            "bool" => "boolean".to_string(),
            other => other.to_string(),
        }
    }
    let existing = base(existing);
    let wanted = base(wanted);
    if existing == wanted || existing == "text" {
        return true;
    }
    // Integer widening is safe.
    matches!(
        (wanted.as_str(), existing.as_str()),
        ("smallint", "integer" | "bigint" | "numeric")
            | ("integer", "bigint" | "numeric")
            | ("bigint", "numeric")
            | ("real", "double precision")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnMapping;
    use crate::core::TableRef;

    fn spec(columns: Vec<ColumnMapping>) -> DataSourceSpec {
        DataSourceSpec {
            name: "users".into(),
            source: TableRef::parse("users", "dbo").unwrap(),
            target: TableRef::parse("users", "public").unwrap(),
            columns,
            batch_size: 100,
            order_by: None,
        }
    }

    #[test]
    fn test_integer_types() {
        assert_eq!(mssql_to_postgres("int", 0, 0, 0), "integer");
        assert_eq!(mssql_to_postgres("bigint", 0, 0, 0), "bigint");
        assert_eq!(mssql_to_postgres("tinyint", 0, 0, 0), "smallint");
    }

    #[test]
    fn test_string_types() {
        assert_eq!(mssql_to_postgres("varchar", 100, 0, 0), "varchar(100)");
        assert_eq!(mssql_to_postgres("nvarchar", -1, 0, 0), "text");
        assert_eq!(mssql_to_postgres("nchar", 10, 0, 0), "char(10)");
        assert_eq!(mssql_to_postgres("ntext", 0, 0, 0), "text");
    }

    #[test]
    fn test_numeric_and_temporal_types() {
        assert_eq!(mssql_to_postgres("decimal", 0, 18, 2), "numeric(18,2)");
        assert_eq!(mssql_to_postgres("money", 0, 0, 0), "numeric(19,4)");
        assert_eq!(mssql_to_postgres("datetime2", 0, 0, 0), "timestamp");
        assert_eq!(mssql_to_postgres("datetimeoffset", 0, 0, 0), "timestamptz");
        assert_eq!(mssql_to_postgres("uniqueidentifier", 0, 0, 0), "uuid");
        assert_eq!(mssql_to_postgres("geography", 0, 0, 0), "text");
    }

    #[test]
    fn test_target_columns_applies_mapping_and_coercion() {
        let spec = spec(vec![
            ColumnMapping::new("Id", "id"),
            ColumnMapping::new("Created", "created_at").with_coercion(Coercion::Timestamp),
        ]);
        let source = vec![
            Column::simple("id", "int"),
            Column::simple("created", "varchar"),
            Column::simple("ignored", "xml"),
        ];
        let cols = target_columns(&spec, &source).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "id");
        assert_eq!(cols[0].data_type, "integer");
        assert_eq!(cols[1].name, "created_at");
        assert_eq!(cols[1].data_type, "timestamp");
    }

    #[test]
    fn test_target_columns_missing_source_column() {
        let spec = spec(vec![ColumnMapping::new("email", "email")]);
        let err = target_columns(&spec, &[Column::simple("id", "int")]).unwrap_err();
        assert!(matches!(err, MigrateError::Mapping { ref column, .. } if column == "email"));
    }

    #[test]
    fn test_compatible_types() {
        assert!(compatible("character varying", "varchar(100)"));
        assert!(compatible("timestamp without time zone", "timestamp"));
        assert!(compatible("bigint", "integer"));
        assert!(compatible("text", "uuid"));
        assert!(!compatible("integer", "text"));
        assert!(!compatible("boolean", "timestamp"));
    }
}
