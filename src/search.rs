//! Unified search across entity services.
//!
//! The query is fanned out to every registered service. A service whose
//! tables are not materialized is left out and listed in
//! [`UnifiedSearch::omitted`]; one that fails for any other reason is listed
//! in [`UnifiedSearch::failures`]. Neither aborts the search.
//!
//! Hits are merged by a fixed precedence, with no cross-entity score:
//! match kind (exact key, name, other), then service order, then key.

use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::error::{EngineError, EngineResult};
use crate::models::{EntityKind, SearchResult};
use crate::query::effective_limit;
use crate::services::EntityService;

#[derive(Debug, Clone, Serialize)]
pub struct OmittedService {
    pub kind: EntityKind,
    pub missing_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceFailure {
    pub kind: EntityKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnifiedSearch {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub omitted: Vec<OmittedService>,
    pub failures: Vec<ServiceFailure>,
}

pub struct SearchCoordinator {
    services: Vec<Arc<dyn EntityService>>,
    max_limit: u32,
}

impl SearchCoordinator {
    pub fn new(services: Vec<Arc<dyn EntityService>>, max_limit: u32) -> Self {
        Self {
            services,
            max_limit,
        }
    }

    pub async fn search(&self, query: &str, limit: u32) -> EngineResult<UnifiedSearch> {
        let limit = effective_limit(limit, self.max_limit)?;
        let text = query.trim().to_string();
        let mut out = UnifiedSearch {
            query: text.clone(),
            ..Default::default()
        };
        if text.is_empty() {
            return Ok(out);
        }

        let mut tasks = JoinSet::new();
        for service in &self.services {
            let service = Arc::clone(service);
            let text = text.clone();
            tasks.spawn(async move {
                let kind = service.kind();
                (kind, service.ranked_search(&text, limit).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (kind, outcome) = match joined {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "search task did not complete");
                    continue;
                }
            };
            match outcome {
                Ok(hits) => out.results.extend(hits),
                Err(EngineError::Unavailable { missing, .. }) => {
                    tracing::debug!(kind = %kind, missing = ?missing, "service omitted from search");
                    out.omitted.push(OmittedService {
                        kind,
                        missing_tables: missing,
                    });
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "service search failed");
                    out.failures.push(ServiceFailure {
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        out.results.sort_by(rank);
        out.results.truncate(limit as usize);
        out.omitted.sort_by_key(|o| o.kind);
        out.failures.sort_by_key(|f| f.kind);
        Ok(out)
    }
}

fn rank(a: &SearchResult, b: &SearchResult) -> Ordering {
    a.match_kind
        .cmp(&b.match_kind)
        .then(a.kind.cmp(&b.kind))
        .then_with(|| a.key.cmp(&b.key))
}

/// Prints results the way the CLI shows them.
pub fn print_results(search: &UnifiedSearch) {
    for omitted in &search.omitted {
        println!(
            "note: {} not searched (not indexed: {})",
            omitted.kind,
            omitted.missing_tables.join(", ")
        );
    }
    for failure in &search.failures {
        println!("warning: {} search failed: {}", failure.kind, failure.error);
    }
    if search.results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in search.results.iter().enumerate() {
        println!(
            "{}. [{}] {} {}",
            i + 1,
            hit.kind,
            hit.key,
            hit.title.as_deref().unwrap_or("(untitled)")
        );
        println!("    match: {:?}  table: {}", hit.match_kind, hit.source_table);
    }
}
