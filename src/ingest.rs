//! Ingestion pipeline orchestration.
//!
//! Materializes one source CSV into the store:
//!
//! 1. a blocking reader streams the file in bounded batches over a bounded
//!    channel, so memory use does not grow with file size;
//! 2. each row is coerced to the table's typed schema; malformed rows are
//!    skipped and counted, rows with a duplicate key are dropped and counted;
//! 3. batches are written to a staging table, one transaction per batch;
//! 4. if the malformed-row rate stays within `max_skip_ratio`, lookup indexes
//!    are built and a single transaction swaps the staging table in.
//!
//! Readers keep seeing the previous table until the swap commits. On failure
//! (or if the task is dropped) the staging table is discarded and the live
//! table is left exactly as it was.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

use crate::config::IngestConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::Value;
use crate::progress::{IngestProgressEvent, IngestProgressReporter, PROGRESS_EVERY_ROWS};
use crate::schema::{quote_ident, ColumnSpec, ColumnType, TableDescriptor};
use crate::state::{IngestOutcome, IngestPermit};
use crate::store::bind_value;

const READ_BUFFER_BYTES: usize = 1 << 20;
/// Batches buffered between the reader thread and the writer.
const CHANNEL_BATCHES: usize = 2;
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub max_skip_ratio: f64,
    pub batch_rows: usize,
    pub delimiter: u8,
}

impl From<&IngestConfig> for IngestOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_skip_ratio: config.max_skip_ratio,
            batch_rows: config.batch_rows.max(1),
            delimiter: config.delimiter as u8,
        }
    }
}

/// Result of a materialization request.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub table: String,
    pub rows: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub duration_ms: u64,
    /// The table was already materialized and was left untouched.
    pub reused_existing: bool,
}

impl IngestReport {
    pub(crate) fn reused(table: &str, rows: u64) -> Self {
        Self {
            table: table.to_string(),
            rows,
            skipped: 0,
            duplicates: 0,
            duration_ms: 0,
            reused_existing: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LoadCounts {
    rows: u64,
    skipped: u64,
    duplicates: u64,
}

impl LoadCounts {
    fn processed(&self) -> u64 {
        self.rows + self.skipped + self.duplicates
    }
}

#[derive(Debug, Default)]
struct ReadBatch {
    rows: Vec<Vec<Value>>,
    skipped: u64,
}

impl ReadBatch {
    fn with_capacity(n: usize) -> Self {
        Self {
            rows: Vec::with_capacity(n),
            skipped: 0,
        }
    }

    fn len(&self) -> usize {
        self.rows.len() + self.skipped as usize
    }
}

/// Everything one ingestion needs from the store.
pub(crate) struct IngestContext<'a> {
    pub pool: &'a SqlitePool,
    pub write_gate: &'a Mutex<()>,
    pub options: &'a IngestOptions,
    pub progress: &'a dyn IngestProgressReporter,
}

/// Runs a full ingestion of `descriptor` under an already-claimed permit.
pub(crate) async fn run(
    ctx: IngestContext<'_>,
    descriptor: &TableDescriptor,
    permit: IngestPermit,
) -> EngineResult<IngestReport> {
    let started = Instant::now();
    let table = descriptor.name.clone();
    tracing::info!(
        table = %table,
        source = %descriptor.source.display(),
        "ingestion started"
    );

    match load(&ctx, descriptor, &permit).await {
        Ok(counts) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            permit.succeed(IngestOutcome {
                rows: counts.rows,
                skipped: counts.skipped,
                duplicates: counts.duplicates,
                duration_ms,
            });
            ctx.progress.report(IngestProgressEvent::Finished {
                table: table.clone(),
                rows: counts.rows,
                skipped: counts.skipped,
                duplicates: counts.duplicates,
                duration_ms,
            });
            tracing::info!(
                table = %table,
                rows = counts.rows,
                skipped = counts.skipped,
                duplicates = counts.duplicates,
                duration_ms,
                "ingestion finished"
            );
            Ok(IngestReport {
                table,
                rows: counts.rows,
                skipped: counts.skipped,
                duplicates: counts.duplicates,
                duration_ms,
                reused_existing: false,
            })
        }
        Err(err) => {
            let staging = descriptor.staging_name();
            {
                let _gate = ctx.write_gate.lock().await;
                if let Err(e) = drop_table_if_exists(ctx.pool, &staging).await {
                    tracing::warn!(table = %table, error = %e, "could not drop staging table");
                }
            }
            let reason = match err {
                EngineError::Ingest { reason, .. } => reason,
                other => other.to_string(),
            };
            permit.fail(&reason);
            ctx.progress.report(IngestProgressEvent::Failed {
                table: table.clone(),
                reason: reason.clone(),
            });
            tracing::warn!(table = %table, reason = %reason, "ingestion failed; table left in prior state");
            Err(EngineError::Ingest { table, reason })
        }
    }
}

async fn load(
    ctx: &IngestContext<'_>,
    descriptor: &TableDescriptor,
    permit: &IngestPermit,
) -> EngineResult<LoadCounts> {
    let table = descriptor.name.as_str();
    let bytes = tokio::fs::metadata(&descriptor.source)
        .await
        .map_err(|e| {
            EngineError::ingest(
                table,
                format!("cannot read source file {}: {}", descriptor.source.display(), e),
            )
        })?
        .len();
    ctx.progress.report(IngestProgressEvent::Started {
        table: table.to_string(),
        bytes,
    });

    let staging = descriptor.staging_name();
    {
        let _gate = ctx.write_gate.lock().await;
        drop_table_if_exists(ctx.pool, &staging).await?;
        sqlx::query(&create_table_sql(descriptor, &staging))
            .execute(ctx.pool)
            .await?;
    }

    let (tx, mut rx) = mpsc::channel::<ReadBatch>(CHANNEL_BATCHES);
    let source = descriptor.source.clone();
    let columns = descriptor.columns.clone();
    let delimiter = ctx.options.delimiter;
    let batch_rows = ctx.options.batch_rows;
    let reader = tokio::task::spawn_blocking(move || {
        read_source(&source, &columns, delimiter, batch_rows, tx)
    });

    let insert = insert_sql(descriptor, &staging);
    let mut counts = LoadCounts::default();
    let mut next_report = PROGRESS_EVERY_ROWS;

    while let Some(batch) = rx.recv().await {
        counts.skipped += batch.skipped;
        {
            let _gate = ctx.write_gate.lock().await;
            let mut tx = ctx.pool.begin().await?;
            for row in batch.rows {
                let mut q = sqlx::query(&insert);
                for value in row {
                    q = bind_value(q, value);
                }
                let result = q.execute(&mut *tx).await?;
                if result.rows_affected() == 0 {
                    counts.duplicates += 1;
                } else {
                    counts.rows += 1;
                }
            }
            tx.commit().await?;
        }

        let processed = counts.processed();
        permit.record_progress(processed);
        if processed >= next_report {
            ctx.progress.report(IngestProgressEvent::Loading {
                table: table.to_string(),
                rows: processed,
                skipped: counts.skipped,
            });
            tracing::debug!(table = %table, rows = processed, skipped = counts.skipped, "ingestion progress");
            next_report = processed + PROGRESS_EVERY_ROWS;
        }
    }

    match reader.await {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => return Err(EngineError::ingest(table, reason)),
        Err(e) => return Err(EngineError::ingest(table, format!("reader task failed: {}", e))),
    }

    let total = counts.processed();
    let ratio = if total == 0 {
        0.0
    } else {
        counts.skipped as f64 / total as f64
    };
    if ratio > ctx.options.max_skip_ratio {
        return Err(EngineError::ingest(
            table,
            format!(
                "too many malformed rows: {} of {} ({:.1}%) exceeds the {:.1}% threshold",
                counts.skipped,
                total,
                ratio * 100.0,
                ctx.options.max_skip_ratio * 100.0
            ),
        ));
    }

    // Index names carry a generation so they never collide with the indexes
    // of the live table being replaced.
    let generation = Utc::now().timestamp_millis();
    {
        let _gate = ctx.write_gate.lock().await;
        for column in &descriptor.indexes {
            let index = format!(
                "idx_{}_{}_{}",
                table.to_ascii_lowercase(),
                column.to_ascii_lowercase(),
                generation
            );
            sqlx::query(&format!(
                "CREATE INDEX {} ON {} ({})",
                quote_ident(&index),
                quote_ident(&staging),
                quote_ident(column)
            ))
            .execute(ctx.pool)
            .await?;
        }
    }

    ctx.progress.report(IngestProgressEvent::Swapping {
        table: table.to_string(),
    });
    {
        let _gate = ctx.write_gate.lock().await;
        let mut tx = ctx.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&staging),
            quote_ident(table)
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
    }

    Ok(counts)
}

pub(crate) async fn drop_table_if_exists(pool: &SqlitePool, name: &str) -> EngineResult<()> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
        .execute(pool)
        .await?;
    Ok(())
}

fn create_table_sql(descriptor: &TableDescriptor, physical: &str) -> String {
    let columns = descriptor
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), c.ty.sql_type());
            if c.required {
                def.push_str(" NOT NULL");
            }
            if descriptor.key.as_deref() == Some(c.name.as_str()) {
                def.push_str(" UNIQUE");
            }
            def
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", quote_ident(physical), columns)
}

fn insert_sql(descriptor: &TableDescriptor, physical: &str) -> String {
    let names = descriptor
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; descriptor.columns.len()].join(", ");
    format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        quote_ident(physical),
        names,
        placeholders
    )
}

/// Streams `path` and sends coerced rows in batches of `batch_rows`.
///
/// Runs on a blocking thread. Returns early with "ingestion cancelled" once
/// the receiving side has gone away.
fn read_source(
    path: &Path,
    columns: &[ColumnSpec],
    delimiter: u8,
    batch_rows: usize,
    tx: mpsc::Sender<ReadBatch>,
) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::with_capacity(READ_BUFFER_BYTES, file));

    let headers = reader
        .headers()
        .map_err(|e| format!("cannot read header row: {}", e))?
        .clone();
    let mapping = map_columns(&headers, columns)?;
    let width = headers.len();

    let mut batch = ReadBatch::with_capacity(batch_rows);
    let mut record = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                if record.len() != width {
                    batch.skipped += 1;
                } else {
                    match coerce_row(&record, &mapping, columns) {
                        Some(row) => batch.rows.push(row),
                        None => batch.skipped += 1,
                    }
                }
            }
            Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => {
                return Err(format!("read error in {}: {}", path.display(), e));
            }
            // Invalid UTF-8 and similar per-record faults.
            Err(_) => batch.skipped += 1,
        }

        if batch.len() >= batch_rows {
            let full = std::mem::replace(&mut batch, ReadBatch::with_capacity(batch_rows));
            tx.blocking_send(full)
                .map_err(|_| "ingestion cancelled".to_string())?;
        }
    }

    if batch.len() > 0 {
        tx.blocking_send(batch)
            .map_err(|_| "ingestion cancelled".to_string())?;
    }
    Ok(())
}

/// Locates each declared column in the header row by case-insensitive name.
fn map_columns(
    headers: &csv::StringRecord,
    columns: &[ColumnSpec],
) -> Result<Vec<Option<usize>>, String> {
    let names: Vec<String> = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_uppercase())
        .collect();
    columns
        .iter()
        .map(|col| {
            let pos = names.iter().position(|h| *h == col.name);
            if pos.is_none() && col.required {
                Err(format!("source header is missing required column {}", col.name))
            } else {
                Ok(pos)
            }
        })
        .collect()
}

/// `None` means the row is malformed and must be skipped.
fn coerce_row(
    record: &csv::StringRecord,
    mapping: &[Option<usize>],
    columns: &[ColumnSpec],
) -> Option<Vec<Value>> {
    columns
        .iter()
        .zip(mapping)
        .map(|(col, pos)| {
            let raw = pos.and_then(|i| record.get(i)).unwrap_or("").trim();
            if raw.is_empty() {
                return if col.required { None } else { Some(Value::Null) };
            }
            coerce_field(raw, col.ty)
        })
        .collect()
}

pub(crate) fn coerce_field(raw: &str, ty: ColumnType) -> Option<Value> {
    match ty {
        ColumnType::Text => Some(Value::Text(raw.to_string())),
        ColumnType::Integer => raw.parse::<i64>().ok().map(Value::Integer),
        ColumnType::Date => {
            parse_date(raw).map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
        }
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}
