//! Federal Supply Classification lookups.
//!
//! Classes live in `V_H2_FSC`. Groups are the first two digits of a class
//! code; their titles come from `V_H2_FSG`, which lists one row per class.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{check_available, first, EntityService, Ranking, TextMatch};
use crate::error::{EngineError, EngineResult};
use crate::models::{EntityKind, Record, SearchResult, Value};
use crate::query::{OrderKey, Predicate, Query};
use crate::schema::tables;
use crate::store::Store;

const REQUIRED: &[&str] = &[tables::V_H2_FSC];
const GROUPS_REQUIRED: &[&str] = &[tables::V_H2_FSG];
const KEY: &str = "FSC";
const TITLE: &str = "FSC_TITLE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplyGroup {
    pub fsg: i64,
    pub title: Option<String>,
}

#[derive(Clone)]
pub struct FscService {
    store: Arc<Store>,
}

impl FscService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn matcher<'a>(&self, text: &'a str) -> TextMatch<'a> {
        TextMatch {
            key_column: KEY,
            title_column: TITLE,
            exact_key: text.parse::<i64>().ok().map(Value::Integer),
            text,
        }
    }

    /// Distinct supply groups in ascending order.
    pub async fn list_groups(&self) -> EngineResult<Vec<SupplyGroup>> {
        check_available(&self.store, EntityKind::Fsc, GROUPS_REQUIRED).await?;
        let rows = self.store.query_all(tables::V_H2_FSG, Query::all()).await?;
        let mut groups: BTreeMap<i64, Option<String>> = BTreeMap::new();
        for row in rows {
            if let Some(fsc) = row.get(KEY).and_then(Value::as_i64) {
                groups
                    .entry(fsc / 100)
                    .or_insert_with(|| row.text("FSG_TITLE"));
            }
        }
        Ok(groups
            .into_iter()
            .map(|(fsg, title)| SupplyGroup { fsg, title })
            .collect())
    }

    pub async fn list_classes(&self) -> EngineResult<Vec<Record>> {
        check_available(&self.store, EntityKind::Fsc, REQUIRED).await?;
        self.store.query_all(tables::V_H2_FSC, Query::all()).await
    }

    pub async fn get_class(&self, code: &str) -> EngineResult<Option<Record>> {
        check_available(&self.store, EntityKind::Fsc, REQUIRED).await?;
        let rows = self
            .store
            .query(
                tables::V_H2_FSC,
                &Query::new(Predicate::eq(KEY, code.trim())).limit(1),
            )
            .await?;
        Ok(first(rows))
    }

    /// Classes whose code starts with the two-digit group `fsg`.
    pub async fn classes_in_group(&self, fsg: &str) -> EngineResult<Vec<Record>> {
        let group: i64 = fsg
            .trim()
            .parse()
            .map_err(|_| EngineError::query(format!("supply group must be numeric, got {:?}", fsg)))?;
        if !(0..100).contains(&group) {
            return Err(EngineError::query(format!(
                "supply group must be two digits, got {}",
                group
            )));
        }
        check_available(&self.store, EntityKind::Fsc, REQUIRED).await?;
        let query = Query::new(Predicate::range(KEY, group * 100, (group + 1) * 100))
            .order_by(OrderKey::Asc(KEY.to_string()));
        self.store.query_all(tables::V_H2_FSC, query).await
    }

    /// Classes whose code equals `text` or whose title contains it.
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
        check_available(&self.store, EntityKind::Fsc, REQUIRED).await?;
        let text = text.trim();
        let m = self.matcher(text);
        let filter = match (&m.exact_key, text.is_empty()) {
            (_, true) => Predicate::All,
            (Some(code), false) => Predicate::Or(vec![
                Predicate::Eq(KEY.to_string(), code.clone()),
                Predicate::contains(TITLE, text),
            ]),
            (None, false) => Predicate::contains(TITLE, text),
        };
        self.store
            .query(tables::V_H2_FSC, &m.query(filter, ranking, limit, offset))
            .await
    }
}

#[async_trait]
impl EntityService for FscService {
    fn kind(&self) -> EntityKind {
        EntityKind::Fsc
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
            .map(|r| m.to_result(EntityKind::Fsc, tables::V_H2_FSC, r))
            .collect())
    }
}
