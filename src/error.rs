//! Engine error taxonomy.
//!
//! Every failure the engine can report is one of these variants. None of them
//! is process-fatal: each is recoverable by retrying the specific operation
//! (after indexing the missing table, waiting for a busy table, or fixing the
//! caller's parameters).

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Query against a table that has not been materialized.
    #[error("table {table} is not indexed")]
    NotIndexed { table: String },

    /// Another ingestion of the same table is already running.
    #[error("table {table} is busy: an ingestion is already in progress")]
    Busy { table: String },

    /// Ingestion failed; the table was left in its prior state.
    #[error("ingestion of {table} failed: {reason}")]
    Ingest { table: String, reason: String },

    /// Invalid predicate, projection, key or pagination parameters.
    #[error("invalid query: {0}")]
    Query(String),

    /// An entity service cannot run because a dependency is not materialized.
    #[error("{service} unavailable: tables not indexed: {}", missing.join(", "))]
    Unavailable {
        service: String,
        missing: Vec<String>,
    },

    /// Table name not present in the schema registry.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl EngineError {
    pub(crate) fn query(msg: impl Into<String>) -> Self {
        EngineError::Query(msg.into())
    }

    pub(crate) fn ingest(table: &str, reason: impl Into<String>) -> Self {
        EngineError::Ingest {
            table: table.to_string(),
            reason: reason.into(),
        }
    }

    /// Machine-readable code used by the HTTP surface and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotIndexed { .. } => "not_indexed",
            EngineError::Busy { .. } => "busy",
            EngineError::Ingest { .. } => "ingest_error",
            EngineError::Query(_) => "query_error",
            EngineError::Unavailable { .. } => "unavailable",
            EngineError::UnknownTable(_) => "not_found",
            EngineError::Store(_) => "internal",
        }
    }
}
