//! Relational store over SQLite.
//!
//! One physical table per logical table, named after it. The store is the
//! only component that talks to the database: it runs ingestions (see
//! [`crate::ingest`]), answers compiled [`Query`]s, drops tables and reports
//! sizes. Whether a table exists is always read from `sqlite_master`; there
//! is no separate manifest that could drift from the data.

use serde::Serialize;
use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::ingest::{self, IngestContext, IngestOptions, IngestReport};
use crate::models::{Record, Value};
use crate::progress::{IngestProgressReporter, NoProgress};
use crate::query::{compile_predicate, Predicate, Query};
use crate::schema::{quote_ident, ColumnSpec, ColumnType, PriorityClass, Registry, TableDescriptor, STAGING_PREFIX};
use crate::state::{IngestPermit, MaterializationState};

#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeOptions {
    /// Reload even when the table is already materialized.
    pub force: bool,
}

/// A claimed ingestion slot, ready to run.
#[derive(Debug)]
pub struct PreparedIngest {
    descriptor: TableDescriptor,
    permit: IngestPermit,
}

impl PreparedIngest {
    pub fn table(&self) -> &str {
        &self.descriptor.name
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub name: String,
    pub class: PriorityClass,
    pub materialized: bool,
    pub row_count: Option<u64>,
    /// Bytes used by the table and its indexes, when the store can tell.
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub db_path: String,
    pub db_size_bytes: u64,
    pub tables: Vec<TableStats>,
}

pub struct Store {
    pool: SqlitePool,
    registry: Arc<Registry>,
    state: Arc<MaterializationState>,
    options: IngestOptions,
    max_limit: u32,
    db_path: PathBuf,
    progress: Arc<dyn IngestProgressReporter>,
    /// Serializes write transactions across ingestions of different tables.
    write_gate: Mutex<()>,
}

impl Store {
    /// Connects, discards staging tables left by an interrupted run and
    /// reconciles `state` with the tables that physically exist.
    pub async fn open(
        config: &Config,
        registry: Arc<Registry>,
        state: Arc<MaterializationState>,
    ) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config).await?;
        let store = Self {
            pool,
            registry,
            state,
            options: IngestOptions::from(&config.ingest),
            max_limit: config.query.max_limit,
            db_path: config.db.path.clone(),
            progress: Arc::new(NoProgress),
            write_gate: Mutex::new(()),
        };
        store.drop_stale_staging().await?;
        store.reconcile_all().await?;
        Ok(store)
    }

    pub fn with_progress(mut self, progress: Arc<dyn IngestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &Arc<MaterializationState> {
        &self.state
    }

    pub fn max_limit(&self) -> u32 {
        self.max_limit
    }

    pub fn descriptor(&self, name: &str) -> EngineResult<&TableDescriptor> {
        self.registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    async fn drop_stale_staging(&self) -> EngineResult<()> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ? ESCAPE '\\'",
        )
        .bind(format!("{}%", STAGING_PREFIX.replace('_', "\\_")))
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let name: String = row.try_get(0)?;
            tracing::info!(table = %name, "dropping staging table left by an interrupted ingestion");
            ingest::drop_table_if_exists(&self.pool, &name).await?;
        }
        Ok(())
    }

    async fn reconcile_all(&self) -> EngineResult<()> {
        for table in self.registry.tables() {
            let exists = self.physical_exists(&table.name).await?;
            let rows = if exists {
                Some(self.count_rows(&table.name).await?)
            } else {
                None
            };
            self.state.reconcile(&table.name, exists, rows);
            tracing::debug!(table = %table.name, exists, "reconciled table state");
        }
        Ok(())
    }

    async fn physical_exists(&self, physical: &str) -> EngineResult<bool> {
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(physical)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn count_rows(&self, physical: &str) -> EngineResult<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(physical)))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Whether the table is physically present, refreshing the cached flag.
    pub async fn table_exists(&self, name: &str) -> EngineResult<bool> {
        let descriptor = self.descriptor(name)?;
        let exists = self.physical_exists(&descriptor.name).await?;
        let rows = match (exists, self.state.get(&descriptor.name)) {
            (true, Some(s)) if s.row_count.is_none() => {
                Some(self.count_rows(&descriptor.name).await?)
            }
            _ => None,
        };
        self.state.reconcile(&descriptor.name, exists, rows);
        Ok(exists)
    }

    /// Claims the ingestion slot for `name` without awaiting.
    ///
    /// Fails with [`EngineError::Busy`] when an ingestion of the same table is
    /// already running.
    pub fn prepare(&self, name: &str) -> EngineResult<PreparedIngest> {
        let descriptor = self.descriptor(name)?.clone();
        let permit = self.state.try_begin(&descriptor.name)?;
        Ok(PreparedIngest { descriptor, permit })
    }

    /// Runs a prepared ingestion to completion.
    pub async fn run_prepared(
        &self,
        prepared: PreparedIngest,
        options: MaterializeOptions,
    ) -> EngineResult<IngestReport> {
        let PreparedIngest { descriptor, permit } = prepared;
        if !options.force {
            let exists = match self.physical_exists(&descriptor.name).await {
                Ok(v) => v,
                Err(e) => {
                    permit.fail(&e.to_string());
                    return Err(e);
                }
            };
            if exists {
                let rows = match self.state.get(&descriptor.name).and_then(|s| s.row_count) {
                    Some(n) => n,
                    None => match self.count_rows(&descriptor.name).await {
                        Ok(n) => n,
                        Err(e) => {
                            permit.fail(&e.to_string());
                            return Err(e);
                        }
                    },
                };
                self.state.reconcile(&descriptor.name, true, Some(rows));
                permit.release_unchanged();
                tracing::info!(table = %descriptor.name, rows, "table already indexed; skipping load");
                return Ok(IngestReport::reused(&descriptor.name, rows));
            }
        }

        let ctx = IngestContext {
            pool: &self.pool,
            write_gate: &self.write_gate,
            options: &self.options,
            progress: self.progress.as_ref(),
        };
        ingest::run(ctx, &descriptor, permit).await
    }

    /// Materializes `name` from its source file.
    pub async fn materialize(
        &self,
        name: &str,
        options: MaterializeOptions,
    ) -> EngineResult<IngestReport> {
        let prepared = self.prepare(name)?;
        self.run_prepared(prepared, options).await
    }

    /// Drops the physical table. Fails with `Busy` during an ingestion.
    pub async fn drop_table(&self, name: &str) -> EngineResult<()> {
        let descriptor = self.descriptor(name)?;
        let permit = self.state.try_begin(&descriptor.name)?;
        let result = {
            let _gate = self.write_gate.lock().await;
            ingest::drop_table_if_exists(&self.pool, &descriptor.name).await
        };
        match result {
            Ok(()) => {
                permit.finish_dropped();
                tracing::info!(table = %descriptor.name, "table dropped");
                Ok(())
            }
            Err(e) => {
                permit.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn ensure_materialized<'a>(&'a self, name: &str) -> EngineResult<&'a TableDescriptor> {
        let descriptor = self.descriptor(name)?;
        if !self.state.is_materialized(&descriptor.name) {
            return Err(EngineError::NotIndexed {
                table: descriptor.name.clone(),
            });
        }
        Ok(descriptor)
    }

    /// A table can disappear between the state check and the read.
    fn map_read_error(&self, table: &str, err: sqlx::Error) -> EngineError {
        let missing = matches!(&err, sqlx::Error::Database(db) if db.message().contains("no such table"));
        if missing {
            self.state.reconcile(table, false, None);
            EngineError::NotIndexed {
                table: table.to_string(),
            }
        } else {
            EngineError::Store(err)
        }
    }

    /// Runs `query` against a materialized table.
    pub async fn query(&self, name: &str, query: &Query) -> EngineResult<Vec<Record>> {
        let descriptor = self.ensure_materialized(name)?;
        let compiled = query.compile(descriptor, self.max_limit)?;
        let mut q = sqlx::query(&compiled.sql);
        for param in compiled.params {
            q = bind_value(q, param);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_read_error(&descriptor.name, e))?;
        rows.iter()
            .map(|row| decode_record(row, &compiled.columns))
            .collect()
    }

    /// Returns every row matching `query`, paging past the limit.
    ///
    /// Only priority tables may be listed in full.
    pub async fn query_all(&self, name: &str, query: Query) -> EngineResult<Vec<Record>> {
        let descriptor = self.ensure_materialized(name)?;
        if descriptor.class != PriorityClass::Priority {
            return Err(EngineError::query(format!(
                "{} is too large to list in full; use a filtered query",
                descriptor.name
            )));
        }
        let page = self.max_limit;
        let mut out = Vec::new();
        let mut offset = query.offset;
        loop {
            let batch = self
                .query(name, &query.clone().limit(page).offset(offset))
                .await?;
            let n = batch.len();
            out.extend(batch);
            if n < page as usize {
                break;
            }
            offset += n as u64;
        }
        Ok(out)
    }

    pub async fn count(&self, name: &str, predicate: &Predicate) -> EngineResult<u64> {
        let descriptor = self.ensure_materialized(name)?;
        let mut params = Vec::new();
        let where_sql = compile_predicate(predicate, descriptor, &mut params)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(&descriptor.name),
            where_sql
        );
        let mut q = sqlx::query(&sql);
        for param in params {
            q = bind_value(q, param);
        }
        let row = q
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_read_error(&descriptor.name, e))?;
        let n: i64 = row.try_get(0)?;
        Ok(n.max(0) as u64)
    }

    /// Most frequent values of `column`, most frequent first.
    pub async fn group_count(
        &self,
        name: &str,
        column: &str,
        limit: u32,
    ) -> EngineResult<Vec<(Value, u64)>> {
        let descriptor = self.ensure_materialized(name)?;
        let col = descriptor
            .column(column)
            .ok_or_else(|| EngineError::query(format!("unknown column {} in table {}", column, descriptor.name)))?
            .clone();
        let limit = crate::query::effective_limit(limit, self.max_limit)?;
        let ident = quote_ident(&col.name);
        let sql = format!(
            "SELECT {ident}, COUNT(*) FROM {table} WHERE {ident} IS NOT NULL \
             GROUP BY {ident} ORDER BY COUNT(*) DESC, {ident} ASC LIMIT ?",
            ident = ident,
            table = quote_ident(&descriptor.name)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.map_read_error(&descriptor.name, e))?;
        rows.iter()
            .map(|row| {
                let value = decode_value(row, 0, &col)?;
                let n: i64 = row.try_get(1)?;
                Ok((value, n.max(0) as u64))
            })
            .collect()
    }

    /// Database size and per-table row counts and sizes.
    pub async fn stats(&self) -> EngineResult<StoreStats> {
        let mut tables = Vec::new();
        for descriptor in self.registry.tables() {
            let state = self.state.get(&descriptor.name).unwrap_or_default();
            let size_bytes = if state.materialized {
                self.table_size(descriptor).await
            } else {
                None
            };
            tables.push(TableStats {
                name: descriptor.name.clone(),
                class: descriptor.class,
                materialized: state.materialized,
                row_count: state.row_count,
                size_bytes,
            });
        }
        Ok(StoreStats {
            db_path: self.db_path.display().to_string(),
            db_size_bytes: file_size(&self.db_path) + file_size(&wal_path(&self.db_path)),
            tables,
        })
    }

    /// Page usage of the table plus its indexes. `None` when the SQLite
    /// build lacks the `dbstat` virtual table.
    async fn table_size(&self, descriptor: &TableDescriptor) -> Option<u64> {
        let result: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
            "SELECT SUM(pgsize) FROM dbstat WHERE name = ? \
             OR name IN (SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?)",
        )
        .bind(&descriptor.name)
        .bind(&descriptor.name)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(size) => size.map(|n| n.max(0) as u64),
            Err(e) => {
                tracing::debug!(table = %descriptor.name, error = %e, "table size unavailable");
                None
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn wal_path(db: &Path) -> PathBuf {
    let mut s = db.as_os_str().to_owned();
    s.push("-wal");
    PathBuf::from(s)
}

pub(crate) fn bind_value<'q>(
    q: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    value: Value,
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => q.bind(None::<String>),
        Value::Integer(n) => q.bind(n),
        Value::Text(s) => q.bind(s),
    }
}

fn decode_value(row: &SqliteRow, idx: usize, col: &ColumnSpec) -> EngineResult<Value> {
    let value = match col.ty {
        ColumnType::Integer => row.try_get::<Option<i64>, _>(idx)?.map(Value::Integer),
        ColumnType::Text | ColumnType::Date => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::Text)
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_record(row: &SqliteRow, columns: &[ColumnSpec]) -> EngineResult<Record> {
    let mut record = Record::new();
    for (idx, col) in columns.iter().enumerate() {
        record.push(col.name.clone(), decode_value(row, idx, col)?);
    }
    Ok(record)
}
