//! The on-demand indexing and query engine.
//!
//! [`Engine`] owns the store, the shared materialization state, the entity
//! services and the search coordinator. It is the API the CLI and the HTTP
//! server call.
//!
//! Long ingestions can be started in the background with
//! [`Engine::trigger_materialize`]; the caller gets an immediate answer
//! (scheduled, or `Busy`) and follows progress through [`Engine::status`].

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::ingest::IngestReport;
use crate::models::Record;
use crate::progress::IngestProgressReporter;
use crate::query::{Predicate, Query};
use crate::schema::{ColumnSpec, PriorityClass, Registry, TableDescriptor};
use crate::search::{SearchCoordinator, UnifiedSearch};
use crate::services::{CageService, EntityService, FscService, ItemNameService, NsnService};
use crate::state::{MaterializationState, TableState};
use crate::store::{MaterializeOptions, Store, StoreStats};

/// Status of one registered table, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub name: String,
    pub class: PriorityClass,
    pub source: String,
    pub source_present: bool,
    #[serde(flatten)]
    pub state: TableState,
}

/// One table's layout together with its status. `row_count` is counted
/// live when the table is materialized.
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    #[serde(flatten)]
    pub status: TableStatus,
    pub key: Option<String>,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<String>,
}

/// Outcome of one table within a multi-table materialization.
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<IngestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parses a table-class selector: `priority`, `large`, or `all` (`None`).
pub fn parse_class_selector(selector: &str) -> EngineResult<Option<PriorityClass>> {
    match selector.trim().to_ascii_lowercase().as_str() {
        "priority" => Ok(Some(PriorityClass::Priority)),
        "large" => Ok(Some(PriorityClass::Large)),
        "all" | "" => Ok(None),
        other => Err(EngineError::query(format!(
            "unknown table class {:?}; use priority, large or all",
            other
        ))),
    }
}

pub struct Engine {
    store: Arc<Store>,
    search: SearchCoordinator,
    cage: CageService,
    fsc: FscService,
    nsn: NsnService,
    item_names: ItemNameService,
    default_limit: u32,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        Self::open_with_progress(config, None).await
    }

    pub async fn open_with_progress(
        config: &Config,
        progress: Option<Arc<dyn IngestProgressReporter>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::from_config(config));
        let state = Arc::new(MaterializationState::new(
            registry.tables().iter().map(|t| t.name.as_str()),
        ));
        let mut store = Store::open(config, registry, state).await?;
        if let Some(progress) = progress {
            store = store.with_progress(progress);
        }
        let store = Arc::new(store);

        let cage = CageService::new(Arc::clone(&store));
        let fsc = FscService::new(Arc::clone(&store));
        let nsn = NsnService::new(Arc::clone(&store));
        let item_names = ItemNameService::new(Arc::clone(&store));
        // Vector order is the unified-search service order.
        let services: Vec<Arc<dyn EntityService>> = vec![
            Arc::new(nsn.clone()),
            Arc::new(cage.clone()),
            Arc::new(fsc.clone()),
            Arc::new(item_names.clone()),
        ];

        tracing::info!(db = %config.db.path.display(), "engine ready");
        Ok(Self {
            search: SearchCoordinator::new(services, config.query.max_limit),
            store,
            cage,
            fsc,
            nsn,
            item_names,
            default_limit: config.query.default_limit,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        self.store.registry()
    }

    pub fn cage(&self) -> &CageService {
        &self.cage
    }

    pub fn fsc(&self) -> &FscService {
        &self.fsc
    }

    pub fn nsn(&self) -> &NsnService {
        &self.nsn
    }

    pub fn item_names(&self) -> &ItemNameService {
        &self.item_names
    }

    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }

    /// Materializes one table and waits for the outcome.
    pub async fn materialize(
        &self,
        table: &str,
        options: MaterializeOptions,
    ) -> EngineResult<IngestReport> {
        self.store.materialize(table, options).await
    }

    /// Starts materializing `table` in the background and returns its
    /// canonical name. `Busy` is reported here, before anything is spawned.
    pub fn trigger_materialize(
        &self,
        table: &str,
        options: MaterializeOptions,
    ) -> EngineResult<String> {
        let prepared = self.store.prepare(table)?;
        let name = prepared.table().to_string();
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            if let Err(e) = store.run_prepared(prepared, options).await {
                tracing::warn!(error = %e, "background materialization failed");
            }
        });
        self.track(handle);
        tracing::info!(table = %name, "materialization scheduled");
        Ok(name)
    }

    /// Tables of `class` (every table when `None`, priority ones first) in
    /// materialization order.
    pub fn tables_for(&self, class: Option<PriorityClass>) -> Vec<String> {
        let registry = self.store.registry();
        let classes = match class {
            Some(c) => vec![c],
            None => vec![PriorityClass::Priority, PriorityClass::Large],
        };
        classes
            .into_iter()
            .flat_map(|c| registry.by_class(c).map(|t| t.name.clone()))
            .collect()
    }

    /// Materializes every table of `class` one after another. A failure is
    /// recorded and the run moves on to the next table.
    pub async fn materialize_all(
        &self,
        class: Option<PriorityClass>,
        options: MaterializeOptions,
    ) -> Vec<TableOutcome> {
        materialize_sequence(&self.store, self.tables_for(class), options).await
    }

    /// Background form of [`materialize_all`](Engine::materialize_all).
    /// Returns the tables that will be visited.
    pub fn trigger_materialize_all(
        &self,
        class: Option<PriorityClass>,
        options: MaterializeOptions,
    ) -> Vec<String> {
        let tables = self.tables_for(class);
        let store = Arc::clone(&self.store);
        let order = tables.clone();
        let handle = tokio::spawn(async move {
            let outcomes = materialize_sequence(&store, order, options).await;
            let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
            tracing::info!(tables = outcomes.len(), failed, "background materialization finished");
        });
        self.track(handle);
        tables
    }

    pub async fn drop_table(&self, table: &str) -> EngineResult<()> {
        self.store.drop_table(table).await
    }

    pub fn status(&self) -> Vec<TableStatus> {
        self.store
            .registry()
            .tables()
            .iter()
            .map(|t| self.table_status(t))
            .collect()
    }

    pub async fn table_info(&self, table: &str) -> EngineResult<TableInfo> {
        let descriptor = self.store.descriptor(table)?;
        let mut status = self.table_status(descriptor);
        if status.state.materialized {
            match self.store.count(&descriptor.name, &Predicate::All).await {
                Ok(n) => status.state.row_count = Some(n),
                // Dropped since the state was read.
                Err(EngineError::NotIndexed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(TableInfo {
            status,
            key: descriptor.key.clone(),
            columns: descriptor.columns.clone(),
            indexes: descriptor.indexes.clone(),
        })
    }

    fn table_status(&self, t: &TableDescriptor) -> TableStatus {
        TableStatus {
            name: t.name.clone(),
            class: t.class,
            source: t.source.display().to_string(),
            source_present: t.source.is_file(),
            state: self.store.state().get(&t.name).unwrap_or_default(),
        }
    }

    pub async fn stats(&self) -> EngineResult<StoreStats> {
        self.store.stats().await
    }

    pub async fn search(&self, query: &str, limit: u32) -> EngineResult<UnifiedSearch> {
        self.search.search(query, limit).await
    }

    /// Direct parameterized query, for listing small tables.
    pub async fn query(&self, table: &str, query: &Query) -> EngineResult<Vec<Record>> {
        self.store.query(table, query).await
    }

    /// The shared materialization state.
    pub fn state(&self) -> &Arc<MaterializationState> {
        self.store.state()
    }

    /// Whether any background ingestion is still running.
    pub fn has_background_work(&self) -> bool {
        let mut handles = self.lock_background();
        handles.retain(|h| !h.is_finished());
        !handles.is_empty()
    }

    /// Aborts background ingestions and closes the store. Each aborted
    /// ingestion leaves its table in the last committed state.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_background());
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "background task ended abnormally");
                }
            }
        }
        self.store.close().await;
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.lock_background();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn materialize_sequence(
    store: &Store,
    tables: Vec<String>,
    options: MaterializeOptions,
) -> Vec<TableOutcome> {
    let mut outcomes = Vec::with_capacity(tables.len());
    for table in tables {
        let outcome = match store.materialize(&table, options).await {
            Ok(report) => TableOutcome {
                table,
                report: Some(report),
                error: None,
            },
            Err(e) => {
                if !matches!(e, EngineError::Ingest { .. }) {
                    tracing::warn!(table = %table, error = %e, "materialization skipped");
                }
                TableOutcome {
                    table,
                    report: None,
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
