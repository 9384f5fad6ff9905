//! In-process source and target backends.
//!
//! Both sides keep their tables in a [`MemoryDatabase`]. They honour the same
//! contracts as the database backends (deterministic extraction order,
//! transactional batch writes, idempotent schema creation) and add fault
//! injection so callers can exercise connection loss, mid-stream extraction
//! failures, transient write errors and slow calls without a server.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TargetMode;
use crate::core::{Batch, Column, SqlNullType, SqlValue, TableRef, TargetColumn};
use crate::error::{MigrateError, Result, Side};
use crate::source::{ExtractRequest, SourceConnector};
use crate::target::TargetLoader;
use crate::transfer::READ_AHEAD_BATCHES;
use crate::typemap;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<Column>,
    rows: Vec<Vec<SqlValue>>,
}

/// A set of tables shared between handles.
///
/// Cloning yields another handle onto the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<HashMap<TableRef, MemoryTable>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TableRef, MemoryTable>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create (or replace) a table.
    pub fn create_table(&self, table: &TableRef, columns: Vec<Column>) {
        self.lock().insert(
            table.clone(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Append rows laid out in the table's column order.
    pub fn insert_rows(&self, table: &TableRef, rows: impl IntoIterator<Item = Vec<SqlValue>>) {
        if let Some(t) = self.lock().get_mut(table) {
            t.rows.extend(rows);
        }
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        self.lock().contains_key(table)
    }

    pub fn columns(&self, table: &TableRef) -> Option<Vec<Column>> {
        self.lock().get(table).map(|t| t.columns.clone())
    }

    pub fn rows(&self, table: &TableRef) -> Option<Vec<Vec<SqlValue>>> {
        self.lock().get(table).map(|t| t.rows.clone())
    }

    pub fn row_count(&self, table: &TableRef) -> Option<u64> {
        self.lock().get(table).map(|t| t.rows.len() as u64)
    }

    /// Overwrite a single cell. Used to simulate drift between sides.
    pub fn set_value(&self, table: &TableRef, row: usize, column: &str, value: SqlValue) -> bool {
        let mut tables = self.lock();
        let Some(t) = tables.get_mut(table) else {
            return false;
        };
        let Some(idx) = t.columns.iter().position(|c| c.name.eq_ignore_ascii_case(column)) else {
            return false;
        };
        match t.rows.get_mut(row) {
            Some(r) => {
                r[idx] = value;
                true
            }
            None => false,
        }
    }

    /// Snapshot the requested columns of a table, ordered by `order_by` if given.
    fn select(&self, request: &ExtractRequest) -> std::result::Result<Vec<Vec<SqlValue>>, String> {
        let tables = self.lock();
        let t = tables
            .get(&request.table)
            .ok_or_else(|| format!("invalid object name '{}'", request.table))?;

        let positions = request
            .columns
            .iter()
            .map(|name| {
                t.columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| format!("invalid column name '{}'", name))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut rows = t.rows.clone();
        if let Some(key) = &request.order_by {
            let idx = t
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(key))
                .ok_or_else(|| format!("invalid column name '{}'", key))?;
            rows.sort_by(|a, b| a[idx].compare(&b[idx]));
        }

        Ok(rows
            .into_iter()
            .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }
}

/// Emit `rows` in batches, failing after `fail_after` rows if set.
async fn stream_rows(
    request: ExtractRequest,
    rows: Vec<Vec<SqlValue>>,
    fail_after: Option<u64>,
    delay: Duration,
    tx: mpsc::Sender<Result<Batch>>,
) {
    let columns: Arc<[String]> = request.columns.clone().into();
    let table = request.table.to_string();
    let mut sent = 0u64;
    let mut pending = rows.into_iter().peekable();

    loop {
        let mut limit = request.batch_size.max(1);
        if let Some(n) = fail_after {
            if sent >= n {
                let err = MigrateError::extraction(&table, format!("connection lost after {} rows", sent));
                let _ = tx.send(Err(err)).await;
                return;
            }
            limit = limit.min((n - sent) as usize);
        }

        let chunk: Vec<_> = pending.by_ref().take(limit).collect();
        if chunk.is_empty() {
            return;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        sent += chunk.len() as u64;
        if tx.send(Ok(Batch::new(columns.clone(), chunk))).await.is_err() {
            return;
        }
        if pending.peek().is_none() && fail_after.map_or(true, |n| sent < n) {
            return;
        }
    }
}

/// Read side over a [`MemoryDatabase`].
#[derive(Debug, Default)]
pub struct MemorySource {
    db: MemoryDatabase,
    refuse_connect: AtomicBool,
    fail_after: Mutex<HashMap<TableRef, u64>>,
    delays: Mutex<HashMap<TableRef, Duration>>,
    extract_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(db: MemoryDatabase) -> Self {
        Self {
            db,
            ..Default::default()
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    /// Make every later `connect` fail.
    pub fn refuse_connections(&self) {
        self.refuse_connect.store(true, Ordering::SeqCst);
    }

    /// Fail extraction of `table` once `rows` rows have been delivered.
    pub fn fail_extract_after(&self, table: &TableRef, rows: u64) {
        lock(&self.fail_after).insert(table.clone(), rows);
    }

    /// Sleep before delivering each batch of `table`.
    pub fn set_delay(&self, table: &TableRef, delay: Duration) {
        lock(&self.delays).insert(table.clone(), delay);
    }

    /// Number of `extract` calls so far.
    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn connect(&self) -> Result<()> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(MigrateError::connection(Side::Source, "login failed"));
        }
        Ok(())
    }

    async fn describe(&self, table: &TableRef) -> Result<Vec<Column>> {
        self.db.columns(table).ok_or_else(|| {
            MigrateError::extraction(table.to_string(), "table not found or not visible to the source user")
        })
    }

    fn extract(&self, request: ExtractRequest) -> mpsc::Receiver<Result<Batch>> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(READ_AHEAD_BATCHES);
        let selected = self.db.select(&request);
        let fail_after = lock(&self.fail_after).get(&request.table).copied();
        let delay = lock(&self.delays)
            .get(&request.table)
            .copied()
            .unwrap_or(Duration::ZERO);

        tokio::spawn(async move {
            match selected {
                Ok(rows) => stream_rows(request, rows, fail_after, delay, tx).await,
                Err(message) => {
                    let _ = tx
                        .send(Err(MigrateError::extraction(request.table.to_string(), message)))
                        .await;
                }
            }
        });
        rx
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        self.db
            .row_count(table)
            .ok_or_else(|| MigrateError::extraction(table.to_string(), "table not found"))
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// Write side over a [`MemoryDatabase`].
#[derive(Debug, Default)]
pub struct MemoryTarget {
    db: MemoryDatabase,
    refuse_connect: AtomicBool,
    unreachable: Mutex<HashSet<TableRef>>,
    transient_failures: AtomicU32,
    reject_after_batches: Mutex<Option<usize>>,
    write_delay_ms: AtomicU64,
    write_calls: AtomicUsize,
    mutations: AtomicUsize,
    active_writes: Mutex<HashMap<TableRef, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    overlapping_table_writes: AtomicBool,
}

impl MemoryTarget {
    pub fn new(db: MemoryDatabase) -> Self {
        Self {
            db,
            ..Default::default()
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    /// Make every later `connect` fail.
    pub fn refuse_connections(&self) {
        self.refuse_connect.store(true, Ordering::SeqCst);
    }

    /// Every operation on `table` fails with a target connection error.
    pub fn make_unreachable(&self, table: &TableRef) {
        lock(&self.unreachable).insert(table.clone());
    }

    /// The next `n` batch writes fail with a transient connection error.
    pub fn fail_next_writes(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Reject every batch write after the first `n` calls, permanently.
    pub fn reject_writes_after(&self, n: usize) {
        *lock(&self.reject_after_batches) = Some(n);
    }

    /// Sleep inside each batch write.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `write_batch` calls so far, failed ones included.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Number of calls that changed or could have changed target state.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Highest number of batch writes observed running at once.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Whether two writes ever overlapped on the same table.
    pub fn saw_overlapping_table_writes(&self) -> bool {
        self.overlapping_table_writes.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, table: &TableRef) -> Result<()> {
        if lock(&self.unreachable).contains(table) {
            return Err(MigrateError::connection(
                Side::Target,
                format!("could not reach target for {}", table),
            ));
        }
        Ok(())
    }

    fn begin_write<'a>(&'a self, table: &TableRef) -> WriteGuard<'a> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut active = lock(&self.active_writes);
        let count = active.entry(table.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.overlapping_table_writes.store(true, Ordering::SeqCst);
        }
        WriteGuard {
            target: self,
            table: table.clone(),
        }
    }

    fn end_write(&self, table: &TableRef) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = lock(&self.active_writes).get_mut(table) {
            *count = count.saturating_sub(1);
        }
    }

    fn apply_batch(&self, table: &TableRef, batch: &Batch) -> Result<u64> {
        let mut tables = self.db.lock();
        let t = tables.get_mut(table).ok_or_else(|| {
            MigrateError::schema(table.to_string(), "relation does not exist")
        })?;

        let positions = batch
            .columns
            .iter()
            .map(|name| {
                t.columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| {
                        MigrateError::schema(table.to_string(), format!("column '{}' does not exist", name))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let width = t.columns.len();
        for row in &batch.rows {
            let mut stored = vec![SqlValue::Null(SqlNullType::String); width];
            for (value, &pos) in row.iter().zip(&positions) {
                stored[pos] = value.clone();
            }
            t.rows.push(stored);
        }
        Ok(batch.rows.len() as u64)
    }
}

#[async_trait]
impl TargetLoader for MemoryTarget {
    async fn connect(&self) -> Result<()> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(MigrateError::connection(Side::Target, "connection refused"));
        }
        Ok(())
    }

    async fn ensure_schema(&self, table: &TableRef, columns: &[TargetColumn]) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(table)?;

        match self.db.columns(table) {
            None => {
                let columns = columns
                    .iter()
                    .map(|c| Column {
                        name: c.name.clone(),
                        data_type: c.data_type.clone(),
                        max_length: 0,
                        precision: 0,
                        scale: 0,
                        is_nullable: c.nullable,
                    })
                    .collect();
                self.db.create_table(table, columns);
                Ok(())
            }
            Some(existing) => {
                for wanted in columns {
                    let found = existing.iter().find(|c| c.name == wanted.name).ok_or_else(|| {
                        MigrateError::schema(
                            table.to_string(),
                            format!("existing table has no column '{}'", wanted.name),
                        )
                    })?;
                    if !typemap::compatible(&found.data_type, &wanted.data_type) {
                        return Err(MigrateError::schema(
                            table.to_string(),
                            format!(
                                "column '{}' is {} but {} is required",
                                wanted.name, found.data_type, wanted.data_type
                            ),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    async fn prepare(&self, table: &TableRef, mode: TargetMode) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(table)?;
        if mode == TargetMode::Truncate {
            if let Some(t) = self.db.lock().get_mut(table) {
                t.rows.clear();
            }
        }
        Ok(())
    }

    async fn write_batch(&self, table: &TableRef, batch: &Batch) -> Result<u64> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(table)?;

        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MigrateError::connection(Side::Target, "connection reset by peer"));
        }

        if let Some(limit) = *lock(&self.reject_after_batches) {
            if call >= limit {
                return Err(MigrateError::Load {
                    table: table.to_string(),
                    message: "duplicate key value violates unique constraint".into(),
                    rows_committed: 0,
                });
            }
        }

        let _active = self.begin_write(table);
        let delay = Duration::from_millis(self.write_delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.apply_batch(table, batch)
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        self.check_reachable(table)?;
        self.db
            .row_count(table)
            .ok_or_else(|| MigrateError::schema(table.to_string(), "relation does not exist"))
    }

    fn scan(&self, request: ExtractRequest) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_BATCHES);
        let selected = self
            .check_reachable(&request.table)
            .and_then(|_| {
                self.db
                    .select(&request)
                    .map_err(|m| MigrateError::schema(request.table.to_string(), m))
            });

        tokio::spawn(async move {
            match selected {
                Ok(rows) => stream_rows(request, rows, None, Duration::ZERO, tx).await,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        rx
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// Marks one batch write as running until dropped, including when the
/// write future is abandoned by a timeout.
struct WriteGuard<'a> {
    target: &'a MemoryTarget,
    table: TableRef,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.target.end_write(&self.table);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::receiver_stream;
    use futures::TryStreamExt;

    fn table() -> TableRef {
        TableRef::parse("dbo.items", "dbo").unwrap()
    }

    fn seeded(rows: i32) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(&table(), vec![Column::simple("id", "int"), Column::simple("name", "nvarchar")]);
        db.insert_rows(
            &table(),
            (0..rows).rev().map(|i| vec![SqlValue::I32(i), SqlValue::from(format!("item {}", i))]),
        );
        db
    }

    fn request(batch_size: usize) -> ExtractRequest {
        ExtractRequest {
            table: table(),
            columns: vec!["name".into(), "id".into()],
            order_by: Some("id".into()),
            batch_size,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_extract_orders_projects_and_batches() {
        let source = MemorySource::new(seeded(10));
        let batches: Vec<Batch> = receiver_stream(source.extract(request(4)))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(&*batches[0].columns, &["name".to_string(), "id".to_string()]);
        assert_eq!(batches[0].rows[0][1], SqlValue::I32(0));
        assert_eq!(batches[2].rows[1][1], SqlValue::I32(9));
    }

    #[tokio::test]
    async fn test_extract_fails_after_configured_rows() {
        let source = MemorySource::new(seeded(10));
        source.fail_extract_after(&table(), 5);

        let mut stream = receiver_stream(source.extract(request(4)));
        let mut rows = 0;
        let err = loop {
            match stream.try_next().await {
                Ok(Some(batch)) => rows += batch.len(),
                Ok(None) => panic!("stream ended without error"),
                Err(e) => break e,
            }
        };
        assert_eq!(rows, 5);
        assert!(matches!(err, MigrateError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_extract_missing_column() {
        let source = MemorySource::new(seeded(1));
        let mut req = request(10);
        req.columns.push("missing".into());
        let err = receiver_stream(source.extract(req))
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_consumed() {
        let target = MemoryTarget::new(MemoryDatabase::new());
        let cols = vec![TargetColumn {
            name: "id".into(),
            data_type: "integer".into(),
            nullable: false,
        }];
        target.ensure_schema(&table(), &cols).await.unwrap();
        target.fail_next_writes(1);

        let batch = Batch::new(vec!["id".to_string()].into(), vec![vec![SqlValue::I32(1)]]);
        let err = target.write_batch(&table(), &batch).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(target.write_batch(&table(), &batch).await.unwrap(), 1);
        assert_eq!(target.row_count(&table()).await.unwrap(), 1);
        assert_eq!(target.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_write_releases_table() {
        let target = MemoryTarget::new(MemoryDatabase::new());
        let cols = vec![TargetColumn {
            name: "id".into(),
            data_type: "integer".into(),
            nullable: false,
        }];
        target.ensure_schema(&table(), &cols).await.unwrap();
        let batch = Batch::new(vec!["id".to_string()].into(), vec![vec![SqlValue::I32(1)]]);

        target.set_write_delay(Duration::from_millis(200));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), target.write_batch(&table(), &batch)).await;
        assert!(abandoned.is_err());

        target.set_write_delay(Duration::ZERO);
        target.write_batch(&table(), &batch).await.unwrap();
        assert!(!target.saw_overlapping_table_writes());
        assert_eq!(target.max_concurrent_writes(), 1);
        assert_eq!(target.row_count(&table()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_table() {
        let target = MemoryTarget::new(MemoryDatabase::new());
        target.make_unreachable(&table());
        let err = target.ensure_schema(&table(), &[]).await.unwrap_err();
        assert!(matches!(err, MigrateError::Connection { side: Side::Target, .. }));
        assert!(target.row_count(&table()).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_source_connection_is_source_error() {
        let source = MemorySource::new(MemoryDatabase::new());
        source.refuse_connections();
        let err = source.connect().await.unwrap_err();
        assert!(matches!(err, MigrateError::Connection { side: Side::Source, .. }));
    }
}
