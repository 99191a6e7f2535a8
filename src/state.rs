//! Per-table materialization state.
//!
//! [`MaterializationState`] is created once by the engine and shared by
//! reference (`Arc`) with the store and the ingestion pipeline. Reads are open
//! to everyone; writes go through crate-private methods used by the pipeline
//! (via [`IngestPermit`]) and by store reconciliation.
//!
//! Each table moves through an explicit state machine:
//!
//! ```text
//! NotIndexed ──▶ Indexing ──▶ Indexed
//!     ▲              │
//!     │              ▼
//!     └─────────── Failed   (prior `materialized` flag preserved)
//! ```
//!
//! `materialized` is tracked separately from `status` so a failed re-ingestion
//! of an already loaded table keeps serving the previous data.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    NotIndexed,
    Indexing,
    Indexed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::NotIndexed => "not_indexed",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Indexed => "indexed",
            IndexStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableState {
    pub status: IndexStatus,
    /// Whether a physical table is currently queryable.
    pub materialized: bool,
    pub row_count: Option<u64>,
    pub skipped_rows: u64,
    pub duplicate_rows: u64,
    /// Rows read so far by an in-progress ingestion.
    pub rows_processed: u64,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Default for TableState {
    fn default() -> Self {
        Self {
            status: IndexStatus::NotIndexed,
            materialized: false,
            row_count: None,
            skipped_rows: 0,
            duplicate_rows: 0,
            rows_processed: 0,
            last_indexed_at: None,
            last_duration_ms: None,
            last_error: None,
            last_error_at: None,
        }
    }
}

/// Outcome counters written back when an ingestion swaps its table in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IngestOutcome {
    pub rows: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct MaterializationState {
    tables: RwLock<HashMap<String, TableState>>,
    in_flight: Mutex<HashSet<String>>,
}

impl MaterializationState {
    /// All tables start out not materialized; the store reconciles them
    /// against the physical database when it opens.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let tables = names
            .into_iter()
            .map(|n| (n.to_string(), TableState::default()))
            .collect();
        Self {
            tables: RwLock::new(tables),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, table: &str) -> Option<TableState> {
        self.read().get(table).cloned()
    }

    pub fn is_materialized(&self, table: &str) -> bool {
        self.read().get(table).map(|s| s.materialized).unwrap_or(false)
    }

    pub fn is_busy(&self, table: &str) -> bool {
        self.lock_in_flight().contains(table)
    }

    /// Claims the single ingestion slot for `table`.
    ///
    /// Returns [`EngineError::Busy`] when another ingestion holds it. The
    /// check and the claim happen under one lock, so of two racing callers
    /// exactly one wins.
    pub(crate) fn try_begin(self: &Arc<Self>, table: &str) -> EngineResult<IngestPermit> {
        {
            let mut in_flight = self.lock_in_flight();
            if !in_flight.insert(table.to_string()) {
                return Err(EngineError::Busy {
                    table: table.to_string(),
                });
            }
        }

        let mut tables = self.write();
        let entry = tables.entry(table.to_string()).or_default();
        let prior_materialized = entry.materialized;
        let prior_status = entry.status;
        entry.status = IndexStatus::Indexing;
        entry.rows_processed = 0;

        Ok(IngestPermit {
            state: Arc::clone(self),
            table: table.to_string(),
            prior_materialized,
            prior_status,
            finished: false,
        })
    }

    /// Aligns the cached flag with what the physical store holds.
    pub(crate) fn reconcile(&self, table: &str, exists: bool, row_count: Option<u64>) {
        let mut tables = self.write();
        let entry = tables.entry(table.to_string()).or_default();
        let indexing = entry.status == IndexStatus::Indexing;
        if exists {
            if row_count.is_some() {
                entry.row_count = row_count;
            }
            entry.materialized = true;
            if !indexing && entry.status == IndexStatus::NotIndexed {
                entry.status = IndexStatus::Indexed;
            }
        } else if entry.materialized {
            entry.materialized = false;
            entry.row_count = None;
            if !indexing {
                entry.status = IndexStatus::NotIndexed;
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TableState>> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TableState>> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-owner token for one table's ingestion.
///
/// Finishing through [`succeed`](IngestPermit::succeed) or
/// [`fail`](IngestPermit::fail) records the outcome. Dropping an unfinished
/// permit (task aborted, future dropped) marks the attempt abandoned and
/// restores the prior `materialized` flag. The slot is released either way.
#[derive(Debug)]
pub struct IngestPermit {
    state: Arc<MaterializationState>,
    table: String,
    prior_materialized: bool,
    prior_status: IndexStatus,
    finished: bool,
}

impl IngestPermit {
    pub(crate) fn record_progress(&self, rows_processed: u64) {
        let mut tables = self.state.write();
        if let Some(entry) = tables.get_mut(&self.table) {
            entry.rows_processed = rows_processed;
        }
    }

    pub(crate) fn succeed(mut self, outcome: IngestOutcome) {
        {
            let mut tables = self.state.write();
            let entry = tables.entry(self.table.clone()).or_default();
            entry.status = IndexStatus::Indexed;
            entry.materialized = true;
            entry.row_count = Some(outcome.rows);
            entry.skipped_rows = outcome.skipped;
            entry.duplicate_rows = outcome.duplicates;
            entry.rows_processed = outcome.rows + outcome.skipped + outcome.duplicates;
            entry.last_indexed_at = Some(Utc::now());
            entry.last_duration_ms = Some(outcome.duration_ms);
            entry.last_error = None;
            entry.last_error_at = None;
        }
        self.finished = true;
    }

    /// Releases the slot without having touched the table.
    pub(crate) fn release_unchanged(mut self) {
        {
            let mut tables = self.state.write();
            let entry = tables.entry(self.table.clone()).or_default();
            entry.status = match self.prior_status {
                IndexStatus::NotIndexed if entry.materialized => IndexStatus::Indexed,
                IndexStatus::Indexing => IndexStatus::NotIndexed,
                prior => prior,
            };
        }
        self.finished = true;
    }

    /// Records that the physical table was dropped under this permit.
    pub(crate) fn finish_dropped(mut self) {
        {
            let mut tables = self.state.write();
            let entry = tables.entry(self.table.clone()).or_default();
            entry.status = IndexStatus::NotIndexed;
            entry.materialized = false;
            entry.row_count = None;
            entry.rows_processed = 0;
        }
        self.finished = true;
    }

    pub(crate) fn fail(mut self, reason: &str) {
        self.record_failure(reason);
        self.finished = true;
    }

    fn record_failure(&self, reason: &str) {
        let mut tables = self.state.write();
        let entry = tables.entry(self.table.clone()).or_default();
        entry.status = IndexStatus::Failed;
        entry.materialized = self.prior_materialized;
        entry.last_error = Some(reason.to_string());
        entry.last_error_at = Some(Utc::now());
    }
}

impl Drop for IngestPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.record_failure("ingestion abandoned before completion");
        }
        self.state.lock_in_flight().remove(&self.table);
    }
}
