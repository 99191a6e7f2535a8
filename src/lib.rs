//! # PubLog Index
//!
//! On-demand indexing and query engine for PubLog logistics reference data
//! (stock numbers, contractor codes, supply classifications, item names).
//!
//! The source extracts are multi-gigabyte CSV files. Each logical table is
//! materialized into SQLite lazily, exactly once, and only when asked for;
//! lookups then run against the indexed copy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ CSV sources │──▶│  Ingestion  │──▶│  SQLite  │
//! │  (PubLog)   │   │ stage+swap  │   │  (WAL)   │
//! └─────────────┘   └─────────────┘   └────┬─────┘
//!                                          │
//!                         ┌────────────────┤
//!                         ▼                ▼
//!                  ┌────────────┐   ┌─────────────┐
//!                  │  Entity    │──▶│  Unified    │
//!                  │  services  │   │  search     │
//!                  └─────┬──────┘   └──────┬──────┘
//!                        └────────┬────────┘
//!                          ┌──────┴──────┐
//!                          ▼             ▼
//!                     ┌─────────┐   ┌─────────┐
//!                     │   CLI   │   │  HTTP   │
//!                     └─────────┘   └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`schema`] | Registry of known tables and their typed columns |
//! | [`state`] | Per-table materialization state and ingestion permits |
//! | [`db`] | Database connection |
//! | [`query`] | Parameterized lookups compiled to SQL |
//! | [`store`] | Store manager: materialize, query, drop, stats |
//! | [`ingest`] | Streaming CSV ingestion with atomic swap |
//! | [`progress`] | Ingestion progress reporting |
//! | [`services`] | Per-entity lookup services |
//! | [`search`] | Unified search coordinator |
//! | [`engine`] | Engine facade and background ingestion |
//! | [`server`] | JSON HTTP API |
//! | [`stats`] | Human-readable status reports |

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod query;
pub mod schema;
pub mod search;
pub mod server;
pub mod services;
pub mod state;
pub mod stats;
pub mod store;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
