//! Contractor (CAGE) lookups over `P_CAGE`.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use super::{check_available, first, EntityService, Ranking, TextMatch};
use crate::error::EngineResult;
use crate::models::{EntityKind, Record, SearchResult, Value};
use crate::query::{OrderKey, Predicate, Query};
use crate::schema::tables;
use crate::store::Store;

const REQUIRED: &[&str] = &[tables::P_CAGE];
const KEY: &str = "CAGE_CODE";
const TITLE: &str = "COMPANY";
const TOP_COUNTRIES: u32 = 10;

/// Location criteria; unset fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct LocationFilter {
    pub state: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValueCount {
    pub value: Value,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CageStats {
    pub total_records: u64,
    pub by_status: Vec<ValueCount>,
    pub top_countries: Vec<ValueCount>,
}

#[derive(Clone)]
pub struct CageService {
    store: Arc<Store>,
}

impl CageService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn matcher<'a>(&self, text: &'a str) -> TextMatch<'a> {
        TextMatch {
            key_column: KEY,
            title_column: TITLE,
            exact_key: (!text.is_empty()).then(|| Value::Text(text.to_uppercase())),
            text,
        }
    }

    pub async fn get_by_code(&self, code: &str) -> EngineResult<Option<Record>> {
        check_available(&self.store, EntityKind::Cage, REQUIRED).await?;
        let code = code.trim().to_uppercase();
        let rows = self
            .store
            .query(tables::P_CAGE, &Query::new(Predicate::eq(KEY, code)).limit(1))
            .await?;
        Ok(first(rows))
    }

    /// Company, city or code containing `text`.
    pub async fn search(&self, text: &str, limit: u32, offset: u64) -> EngineResult<Vec<Record>> {
        self.find(text, Ranking::KeyOrder, limit, offset).await
    }

    async fn find(
        &self,
        text: &str,
        ranking: Ranking,
        limit: u32,
        offset: u64,
    ) -> EngineResult<Vec<Record>> {
        check_available(&self.store, EntityKind::Cage, REQUIRED).await?;
        let text = text.trim();
        let m = self.matcher(text);
        let filter = if text.is_empty() {
            Predicate::All
        } else {
            Predicate::Or(vec![
                Predicate::contains(TITLE, text),
                Predicate::contains("CITY", text),
                Predicate::contains(KEY, text),
            ])
        };
        self.store
            .query(tables::P_CAGE, &m.query(filter, ranking, limit, offset))
            .await
    }

    /// Contractors by state (exact), city and country (substring). No
    /// criteria yields no rows.
    pub async fn search_by_location(
        &self,
        filter: &LocationFilter,
        limit: u32,
    ) -> EngineResult<Vec<Record>> {
        check_available(&self.store, EntityKind::Cage, REQUIRED).await?;
        let mut parts = Vec::new();
        if let Some(state) = non_empty(&filter.state) {
            parts.push(Predicate::eq_ignore_case("STATE_PROVINCE", state));
        }
        if let Some(city) = non_empty(&filter.city) {
            parts.push(Predicate::contains("CITY", city));
        }
        if let Some(country) = non_empty(&filter.country) {
            parts.push(Predicate::contains("COUNTRY", country));
        }
        if parts.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::new(Predicate::And(parts))
            .order_by(OrderKey::Asc(TITLE.to_string()))
            .limit(limit);
        self.store.query(tables::P_CAGE, &query).await
    }

    pub async fn stats(&self) -> EngineResult<CageStats> {
        check_available(&self.store, EntityKind::Cage, REQUIRED).await?;
        let total_records = self.store.count(tables::P_CAGE, &Predicate::All).await?;
        let by_status = self
            .store
            .group_count(tables::P_CAGE, "CAGE_STATUS", self.store.max_limit())
            .await?;
        let top_countries = self
            .store
            .group_count(tables::P_CAGE, "COUNTRY", TOP_COUNTRIES)
            .await?;
        Ok(CageStats {
            total_records,
            by_status: to_counts(by_status),
            top_countries: to_counts(top_countries),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn to_counts(pairs: Vec<(Value, u64)>) -> Vec<ValueCount> {
    pairs
        .into_iter()
        .map(|(value, count)| ValueCount { value, count })
        .collect()
}

#[async_trait]
impl EntityService for CageService {
    fn kind(&self) -> EntityKind {
        EntityKind::Cage
    }

    fn required_tables(&self) -> &'static [&'static str] {
        REQUIRED
    }

    async fn ranked_search(&self, text: &str, limit: u32) -> EngineResult<Vec<SearchResult>> {
        let text = text.trim();
        let rows = self.find(text, Ranking::Relevance, limit, 0).await?;
        let m = self.matcher(text);
        Ok(rows
            .into_iter()
            .map(|r| m.to_result(EntityKind::Cage, tables::P_CAGE, r))
            .collect())
    }
}
