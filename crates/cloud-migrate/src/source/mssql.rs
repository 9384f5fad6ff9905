//! SQL Server source over tiberius with a bb8 connection pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExtractRequest, SourceConnector};
use crate::config::SourceConfig;
use crate::core::{quote_mssql, Batch, Column, SqlNullType, SqlValue, TableRef};
use crate::error::{MigrateError, Result, Side};
use crate::transfer::{with_timeout, READ_AHEAD_BATCHES};

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        // Encryption settings
        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server source.
///
/// The pool is created without connecting; the first call that needs a
/// connection opens one. Pool size bounds concurrent table workers.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
    config: SourceConfig,
    timeout: Duration,
}

impl MssqlSource {
    pub fn new(config: &SourceConfig, pool_size: u32, timeout: Duration) -> Self {
        let manager = TiberiusConnectionManager {
            config: config.clone(),
        };
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .test_on_check_out(false)
            .build_unchecked(manager);

        Self {
            pool,
            config: config.clone(),
            timeout,
        }
    }

    /// Get a pooled connection.
    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting MSSQL connection"))
    }
}

#[async_trait]
impl SourceConnector for MssqlSource {
    async fn connect(&self) -> Result<()> {
        let connect = async {
            let mut client = self.get_client().await?;
            client.simple_query("SELECT 1").await?.into_row().await?;
            Ok::<_, MigrateError>(())
        };
        with_timeout("connecting to MSSQL", self.timeout, connect)
            .await
            .map_err(|e| MigrateError::connection(Side::Source, e))?;

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            self.config.host,
            self.config.port,
            self.config.database,
            self.pool.state().connections
        );
        Ok(())
    }

    async fn describe(&self, table: &TableRef) -> Result<Vec<Column>> {
        let lookup = async {
            let mut client = self.get_client().await?;
            load_columns(&mut client, table).await
        };
        let columns = with_timeout(format!("describing {}", table), self.timeout, lookup)
            .await
            .map_err(|e| match e {
                MigrateError::Timeout { .. } => e,
                other => MigrateError::extraction(table.to_string(), other),
            })?;

        if columns.is_empty() {
            return Err(MigrateError::extraction(
                table.to_string(),
                "table not found or not visible to the source user",
            ));
        }
        Ok(columns)
    }

    fn extract(&self, request: ExtractRequest) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_BATCHES);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let table = request.table.to_string();
            if let Err(e) = read_table(pool, request, tx.clone()).await {
                let err = match e {
                    MigrateError::Timeout { .. } | MigrateError::Extraction { .. } => e,
                    other => MigrateError::extraction(table, other),
                };
                let _ = tx.send(Err(err)).await;
            }
        });

        rx
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        let count = async {
            let mut client = self.get_client().await?;
            let sql = format!("SELECT COUNT_BIG(*) FROM {}", table.qualified_mssql());
            let row = client.simple_query(sql).await?.into_row().await?;
            Ok::<_, MigrateError>(row.and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
        };
        let count = with_timeout(format!("counting rows in {}", table), self.timeout, count)
            .await
            .map_err(|e| match e {
                MigrateError::Timeout { .. } => e,
                other => MigrateError::extraction(table.to_string(), other),
            })?;
        Ok(count.max(0) as u64)
    }

    fn db_type(&self) -> &str {
        "mssql"
    }

    async fn close(&self) {
        // bb8 pool handles cleanup automatically
    }
}

/// Load column metadata for a table.
async fn load_columns(
    client: &mut Client<Compat<TcpStream>>,
    table: &TableRef,
) -> Result<Vec<Column>> {
    let query = r#"
        SELECT
            COLUMN_NAME,
            DATA_TYPE,
            CAST(ISNULL(CHARACTER_MAXIMUM_LENGTH, 0) AS INT),
            CAST(ISNULL(NUMERIC_PRECISION, 0) AS INT),
            CAST(ISNULL(NUMERIC_SCALE, 0) AS INT),
            CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
        ORDER BY ORDINAL_POSITION
    "#;

    let mut query = Query::new(query);
    query.bind(table.schema.as_str());
    query.bind(table.name.as_str());

    let rows = query.query(client).await?.into_first_result().await?;

    Ok(rows
        .iter()
        .map(|row| Column {
            name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
            data_type: row.get::<&str, _>(1).unwrap_or_default().to_string(),
            max_length: row.get::<i32, _>(2).unwrap_or(0),
            precision: row.get::<i32, _>(3).unwrap_or(0),
            scale: row.get::<i32, _>(4).unwrap_or(0),
            is_nullable: row.get::<i32, _>(5).unwrap_or(0) == 1,
        })
        .collect())
}

/// Stream a table's rows into `tx` in batches.
async fn read_table(
    pool: Pool<TiberiusConnectionManager>,
    request: ExtractRequest,
    tx: mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let table = request.table.to_string();
    let mut client = with_timeout(format!("connecting to read {}", table), request.timeout, async {
        pool.get_owned()
            .await
            .map_err(|e| MigrateError::pool(e, "getting connection for extract"))
    })
    .await?;

    let available = with_timeout(
        format!("reading column metadata for {}", table),
        request.timeout,
        load_columns(&mut client, &request.table),
    )
    .await?;
    if available.is_empty() {
        return Err(MigrateError::extraction(
            &table,
            "table not found or not visible to the source user",
        ));
    }

    // Resolve requested columns against metadata, keeping the requested spelling.
    let mut col_types = Vec::with_capacity(request.columns.len());
    let mut select_list = Vec::with_capacity(request.columns.len());
    for name in &request.columns {
        let column = available
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                MigrateError::extraction(&table, format!("column '{}' does not exist", name))
            })?;
        select_list.push(select_expr(&column.name, &column.data_type));
        col_types.push(column.data_type.to_lowercase());
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list.join(", "),
        request.table.qualified_mssql()
    );
    if let Some(order_by) = &request.order_by {
        sql.push_str(&format!(" ORDER BY {}", quote_mssql(order_by)));
    }
    debug!("{}: {}", table, sql);

    let columns: Arc<[String]> = request.columns.clone().into();
    let stream = with_timeout(format!("querying {}", table), request.timeout, async {
        Ok(client.simple_query(sql).await?)
    })
    .await?;
    let mut rows = stream.into_row_stream();

    let mut batch_rows = Vec::with_capacity(request.batch_size);
    let mut total = 0u64;
    loop {
        let next = with_timeout(format!("reading rows from {}", table), request.timeout, async {
            Ok(rows.try_next().await?)
        })
        .await?;

        match next {
            Some(row) => {
                let values = col_types
                    .iter()
                    .enumerate()
                    .map(|(idx, data_type)| {
                        read_cell(&row, idx, data_type).map_err(|e| {
                            MigrateError::extraction(
                                &table,
                                format!("column '{}': {}", request.columns[idx], e),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                batch_rows.push(values);

                if batch_rows.len() >= request.batch_size {
                    total += batch_rows.len() as u64;
                    let batch = Batch::new(columns.clone(), std::mem::take(&mut batch_rows));
                    if tx.send(Ok(batch)).await.is_err() {
                        return Ok(()); // Receiver dropped
                    }
                }
            }
            None => break,
        }
    }

    if !batch_rows.is_empty() {
        total += batch_rows.len() as u64;
        let _ = tx.send(Ok(Batch::new(columns, batch_rows))).await;
    }
    debug!("{}: extracted {} rows", table, total);
    Ok(())
}

/// SELECT expression for a column, casting types the driver cannot decode to text.
fn select_expr(name: &str, data_type: &str) -> String {
    let quoted = quote_mssql(name);
    match data_type.to_lowercase().as_str() {
        "xml" | "sql_variant" => format!("CAST({q} AS NVARCHAR(MAX)) AS {q}", q = quoted),
        "geometry" | "geography" => format!("{q}.STAsText() AS {q}", q = quoted),
        "hierarchyid" => format!("{q}.ToString() AS {q}", q = quoted),
        _ => quoted,
    }
}

/// Decode one cell, choosing the Rust type from the declared column type.
macro_rules! cell {
    ($row:expr, $idx:expr, $ty:ty, $null:ident, $wrap:expr) => {
        $row.try_get::<$ty, _>($idx)?
            .map($wrap)
            .unwrap_or(SqlValue::Null(SqlNullType::$null))
    };
}

/// Read cell `idx` of `row`. A value the driver cannot decode is an error, never NULL.
fn read_cell(row: &Row, idx: usize, data_type: &str) -> tiberius::Result<SqlValue> {
    let value = match data_type {
        "bit" => cell!(row, idx, bool, Bool, SqlValue::Bool),
        "tinyint" => cell!(row, idx, u8, I16, |v: u8| SqlValue::I16(i16::from(v))),
        "smallint" => cell!(row, idx, i16, I16, SqlValue::I16),
        "int" => cell!(row, idx, i32, I32, SqlValue::I32),
        "bigint" => cell!(row, idx, i64, I64, SqlValue::I64),
        "real" => cell!(row, idx, f32, F32, SqlValue::F32),
        "float" => cell!(row, idx, f64, F64, SqlValue::F64),
        "uniqueidentifier" => cell!(row, idx, Uuid, Uuid, SqlValue::Uuid),
        "datetime" | "datetime2" | "smalldatetime" => {
            cell!(row, idx, NaiveDateTime, DateTime, SqlValue::DateTime)
        }
        "datetimeoffset" => cell!(
            row,
            idx,
            DateTime<FixedOffset>,
            DateTimeOffset,
            SqlValue::DateTimeOffset
        ),
        "date" => cell!(row, idx, NaiveDate, Date, SqlValue::Date),
        "time" => cell!(row, idx, NaiveTime, Time, SqlValue::Time),
        "binary" | "varbinary" | "image" | "rowversion" | "timestamp" => {
            cell!(row, idx, &[u8], Bytes, |b: &[u8]| SqlValue::Bytes(b.to_vec()))
        }
        "decimal" | "numeric" => cell!(row, idx, Decimal, Decimal, SqlValue::Decimal),
        // The driver hands money back as a float.
        "money" | "smallmoney" => cell!(row, idx, f64, Decimal, |f: f64| {
            Decimal::try_from(f)
                .map(SqlValue::Decimal)
                .unwrap_or(SqlValue::F64(f))
        }),
        _ => cell!(row, idx, &str, String, |s: &str| SqlValue::Text(s.to_owned())),
    };
    Ok(value)
}
