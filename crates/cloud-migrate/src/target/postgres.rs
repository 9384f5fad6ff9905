//! PostgreSQL target over tokio-postgres with a deadpool connection pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{SinkExt, TryStreamExt};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_postgres::types::Type;
use tokio_postgres::{Config as PgConfig, NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::tls::SslMode;
use super::TargetLoader;
use crate::config::{TargetConfig, TargetMode};
use crate::core::{quote_pg, Batch, SqlNullType, SqlValue, TableRef, TargetColumn};
use crate::error::{MigrateError, Result, Side};
use crate::source::ExtractRequest;
use crate::transfer::{with_timeout, READ_AHEAD_BATCHES};
use crate::typemap;

/// Rows buffered before each COPY flush.
const COPY_FLUSH_ROWS: usize = 10_000;

/// PostgreSQL target.
///
/// The pool is created without connecting; connections open on first use.
pub struct PostgresTarget {
    pool: Pool,
    config: TargetConfig,
    timeout: Duration,
}

impl PostgresTarget {
    pub fn new(config: &TargetConfig, pool_size: usize, timeout: Duration) -> Result<Self> {
        let ssl_mode: SslMode = config.ssl_mode.parse()?;

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.ssl_mode(ssl_mode.driver_mode());
        pg_config.connect_timeout(timeout);
        pg_config.application_name("cloud-migrate");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match ssl_mode.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?;

        Ok(Self {
            pool,
            config: config.clone(),
            timeout,
        })
    }

    /// Get a pooled connection. Failure to connect is a target connection error.
    async fn get_client(&self) -> Result<Object> {
        with_timeout("connecting to PostgreSQL", self.timeout, async {
            self.pool
                .get()
                .await
                .map_err(|e| MigrateError::connection(Side::Target, e))
        })
        .await
    }

    async fn existing_columns(&self, client: &Object, table: &TableRef) -> Result<Vec<(String, String)>> {
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&table.schema, &table.name],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }
}

/// Generate DDL for table creation.
fn create_table_ddl(table: &TableRef, columns: &[TargetColumn]) -> String {
    let body = columns
        .iter()
        .map(|c| {
            let nullable = if c.nullable { "" } else { " NOT NULL" };
            format!("    {} {}{}", quote_pg(&c.name), c.data_type, nullable)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", table.qualified_pg(), body)
}

#[async_trait]
impl TargetLoader for PostgresTarget {
    async fn connect(&self) -> Result<()> {
        let client = self.get_client().await?;
        with_timeout("probing PostgreSQL", self.timeout, async {
            client
                .simple_query("SELECT 1")
                .await
                .map_err(|e| MigrateError::connection(Side::Target, e))
        })
        .await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            self.config.host, self.config.port, self.config.database
        );
        Ok(())
    }

    async fn ensure_schema(&self, table: &TableRef, columns: &[TargetColumn]) -> Result<()> {
        let client = self.get_client().await?;
        let name = table.to_string();

        let work = async {
            client
                .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_pg(&table.schema)))
                .await?;

            let existing = self.existing_columns(&client, table).await?;
            if existing.is_empty() {
                let ddl = create_table_ddl(table, columns);
                debug!("{}: {}", name, ddl);
                client.batch_execute(&ddl).await?;
                info!("Created table {}", name);
                return Ok(());
            }

            for wanted in columns {
                let found = existing.iter().find(|(col, _)| col == &wanted.name);
                match found {
                    None => {
                        return Err(MigrateError::schema(
                            &name,
                            format!("existing table has no column '{}'", wanted.name),
                        ))
                    }
                    Some((_, data_type)) if !typemap::compatible(data_type, &wanted.data_type) => {
                        return Err(MigrateError::schema(
                            &name,
                            format!(
                                "column '{}' is {} but {} is required",
                                wanted.name, data_type, wanted.data_type
                            ),
                        ))
                    }
                    Some(_) => {}
                }
            }
            debug!("{}: existing table matches mapping", name);
            Ok::<_, MigrateError>(())
        };

        with_timeout(format!("preparing schema for {}", name), self.timeout, work)
            .await
            .map_err(|e| match e {
                MigrateError::Target(e) => MigrateError::schema(&name, e),
                other => other,
            })
    }

    async fn prepare(&self, table: &TableRef, mode: TargetMode) -> Result<()> {
        match mode {
            TargetMode::Append => Ok(()),
            TargetMode::Truncate => {
                let client = self.get_client().await?;
                let sql = format!("TRUNCATE TABLE {}", table.qualified_pg());
                with_timeout(format!("truncating {}", table), self.timeout, async {
                    Ok(client.batch_execute(&sql).await?)
                })
                .await?;
                debug!("Truncated {}", table);
                Ok(())
            }
        }
    }

    async fn write_batch(&self, table: &TableRef, batch: &Batch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut client = self.get_client().await?;

        let col_list = batch
            .columns
            .iter()
            .map(|c| quote_pg(c))
            .collect::<Vec<_>>()
            .join(", ");
        let copy_stmt = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            table.qualified_pg(),
            col_list
        );

        let tx = client.transaction().await?;
        let sink = tx.copy_in(copy_stmt.as_str()).await?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(1024 * 1024);
        let row_count = batch.rows.len();
        for (i, row) in batch.rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    buf.put_u8(b'\t');
                }
                buf.extend_from_slice(sql_value_to_copy_text(value).as_bytes());
            }
            buf.put_u8(b'\n');

            if (i + 1) % COPY_FLUSH_ROWS == 0 || i + 1 == row_count {
                sink.send(buf.split().freeze()).await?;
            }
        }

        let copied = sink.finish().await?;
        tx.commit().await?;
        Ok(copied)
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        let client = self.get_client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.qualified_pg());
        let count: i64 = with_timeout(format!("counting rows in {}", table), self.timeout, async {
            Ok(client.query_one(sql.as_str(), &[]).await?.get(0))
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    fn scan(&self, request: ExtractRequest) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_BATCHES);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            if let Err(e) = scan_table(pool, request, tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Stream a target table's rows into `tx` in batches.
async fn scan_table(pool: Pool, request: ExtractRequest, tx: mpsc::Sender<Result<Batch>>) -> Result<()> {
    let client = with_timeout("connecting to PostgreSQL", request.timeout, async {
        pool.get()
            .await
            .map_err(|e| MigrateError::connection(Side::Target, e))
    })
    .await?;

    let plain: Vec<String> = request.columns.iter().map(|c| quote_pg(c)).collect();
    let from = request.table.qualified_pg();
    let shape = with_timeout(format!("describing {}", request.table), request.timeout, async {
        Ok(client
            .prepare(&format!("SELECT {} FROM {}", plain.join(", "), from))
            .await?)
    })
    .await?;

    // Cast anything without a native decoding to text.
    let select: Vec<String> = plain
        .iter()
        .zip(shape.columns())
        .map(|(quoted, col)| {
            if is_native(col.type_()) {
                quoted.clone()
            } else {
                format!("{}::text", quoted)
            }
        })
        .collect();
    let sql = format!("SELECT {} FROM {}", select.join(", "), from);
    let stream = with_timeout(format!("querying {}", request.table), request.timeout, async {
        let stmt = client.prepare(&sql).await?;
        Ok(client.query_raw(&stmt, std::iter::empty::<&str>()).await?)
    })
    .await?;
    futures::pin_mut!(stream);

    let columns: Arc<[String]> = request.columns.clone().into();
    let mut rows = Vec::with_capacity(request.batch_size);
    loop {
        let next = with_timeout(format!("scanning {}", request.table), request.timeout, async {
            Ok(stream.try_next().await?)
        })
        .await?;
        let Some(row) = next else { break };

        rows.push((0..row.len()).map(|idx| pg_value(&row, idx)).collect::<std::result::Result<Vec<_>, _>>()?);
        if rows.len() >= request.batch_size {
            let batch = Batch::new(columns.clone(), std::mem::take(&mut rows));
            if tx.send(Ok(batch)).await.is_err() {
                return Ok(());
            }
        }
    }
    if !rows.is_empty() {
        let _ = tx.send(Ok(Batch::new(columns, rows))).await;
    }
    Ok(())
}

fn is_native(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::TEXT
            | Type::VARCHAR
            | Type::BPCHAR
            | Type::NAME
            | Type::BYTEA
            | Type::UUID
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::DATE
            | Type::TIME
    )
}

macro_rules! pg_cell {
    ($row:expr, $idx:expr, $ty:ty, $null:ident, $wrap:expr) => {
        $row.try_get::<_, Option<$ty>>($idx)?
            .map($wrap)
            .unwrap_or(SqlValue::Null(SqlNullType::$null))
    };
}

/// Decode one column of a target row. Columns outside [`is_native`] arrive as text.
fn pg_value(row: &Row, idx: usize) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    let value = match *row.columns()[idx].type_() {
        Type::BOOL => pg_cell!(row, idx, bool, Bool, SqlValue::Bool),
        Type::INT2 => pg_cell!(row, idx, i16, I16, SqlValue::I16),
        Type::INT4 => pg_cell!(row, idx, i32, I32, SqlValue::I32),
        Type::INT8 => pg_cell!(row, idx, i64, I64, SqlValue::I64),
        Type::FLOAT4 => pg_cell!(row, idx, f32, F32, SqlValue::F32),
        Type::FLOAT8 => pg_cell!(row, idx, f64, F64, SqlValue::F64),
        Type::NUMERIC => pg_cell!(row, idx, Decimal, Decimal, SqlValue::Decimal),
        Type::BYTEA => pg_cell!(row, idx, Vec<u8>, Bytes, SqlValue::Bytes),
        Type::UUID => pg_cell!(row, idx, Uuid, Uuid, SqlValue::Uuid),
        Type::TIMESTAMP => pg_cell!(row, idx, NaiveDateTime, DateTime, SqlValue::DateTime),
        Type::TIMESTAMPTZ => pg_cell!(
            row,
            idx,
            DateTime<FixedOffset>,
            DateTimeOffset,
            SqlValue::DateTimeOffset
        ),
        Type::DATE => pg_cell!(row, idx, NaiveDate, Date, SqlValue::Date),
        Type::TIME => pg_cell!(row, idx, NaiveTime, Time, SqlValue::Time),
        _ => pg_cell!(row, idx, String, String, SqlValue::Text),
    };
    Ok(value)
}

/// Convert SqlValue to text format for COPY.
/// Escapes special characters: backslash, tab, newline, carriage return.
fn sql_value_to_copy_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null(_) => "\\N".to_string(),
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(n) => n.to_string(),
        SqlValue::F64(n) => n.to_string(),
        SqlValue::Text(s) => escape_copy_text(s),
        SqlValue::Bytes(b) => format!("\\\\x{}", hex::encode(b)),
        SqlValue::Uuid(u) => u.to_string(),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        SqlValue::DateTimeOffset(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string(),
        SqlValue::Date(d) => d.to_string(),
        SqlValue::Time(t) => t.format("%H:%M:%S%.6f").to_string(),
    }
}

/// Escape special characters for COPY text format.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_config() -> TargetConfig {
        TargetConfig {
            host: "127.0.0.1".into(),
            port: 1,
            database: "app".into(),
            user: "loader".into(),
            password: "pw".into(),
            schema: "public".into(),
            ssl_mode: "disable".into(),
        }
    }

    #[test]
    fn test_copy_text_escaping() {
        assert_eq!(escape_copy_text("a\tb\nc\\d\re"), "a\\tb\\nc\\\\d\\re");
        assert_eq!(sql_value_to_copy_text(&SqlValue::Null(SqlNullType::I32)), "\\N");
        assert_eq!(sql_value_to_copy_text(&SqlValue::Bool(true)), "t");
        assert_eq!(sql_value_to_copy_text(&SqlValue::Bytes(vec![0xde, 0xad])), "\\\\xdead");
    }

    #[test]
    fn test_copy_text_truncates_to_microseconds() {
        let local = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_nano_opt(3, 4, 5, 123_456_700)
            .unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        let offset = DateTime::<FixedOffset>::from_naive_utc_and_offset(local, utc);

        assert_eq!(
            sql_value_to_copy_text(&SqlValue::DateTimeOffset(offset)),
            "2024-01-02 03:04:05.123456+00:00"
        );
        assert_eq!(
            sql_value_to_copy_text(&SqlValue::DateTime(local)),
            "2024-01-02 03:04:05.123456"
        );

        let east = FixedOffset::east_opt(2 * 3600).unwrap();
        let shifted = DateTime::<FixedOffset>::from_naive_utc_and_offset(local, east);
        assert_eq!(
            sql_value_to_copy_text(&SqlValue::DateTimeOffset(shifted)),
            "2024-01-02 05:04:05.123456+02:00"
        );
    }

    #[test]
    fn test_create_table_ddl() {
        let table = TableRef::parse("sales.orders", "public").unwrap();
        let ddl = create_table_ddl(
            &table,
            &[
                TargetColumn {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                },
                TargetColumn {
                    name: "note".into(),
                    data_type: "text".into(),
                    nullable: true,
                },
            ],
        );
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"sales\".\"orders\""));
        assert!(ddl.contains("\"id\" integer NOT NULL"));
        assert!(ddl.contains("\"note\" text\n"));
    }

    #[tokio::test]
    async fn test_unreachable_target_is_connection_error() {
        let target = PostgresTarget::new(&target_config(), 1, Duration::from_secs(2)).unwrap();
        let err = target.connect().await.unwrap_err();
        assert!(
            matches!(err, MigrateError::Connection { side: Side::Target, .. } | MigrateError::Timeout { .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_invalid_ssl_mode_rejected() {
        let mut config = target_config();
        config.ssl_mode = "bogus".into();
        assert!(PostgresTarget::new(&config, 1, Duration::from_secs(1)).is_err());
    }
}
