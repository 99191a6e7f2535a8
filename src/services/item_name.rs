//! Item name code (INC) lookups over `V_H6_NAME_INC`.

use async_trait::async_trait;
use std::sync::Arc;

use super::{check_available, first, EntityService, Ranking, TextMatch};
use crate::error::EngineResult;
use crate::models::{EntityKind, Record, SearchResult, Value};
use crate::query::{OrderKey, Predicate, Query};
use crate::schema::tables;
use crate::store::Store;

const REQUIRED: &[&str] = &[tables::V_H6_NAME_INC];
const KEY: &str = "INC";
const TITLE: &str = "FIIG_TITLE";

#[derive(Clone)]
pub struct ItemNameService {
    store: Arc<Store>,
}

impl ItemNameService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn matcher<'a>(&self, text: &'a str) -> TextMatch<'a> {
        TextMatch {
            key_column: KEY,
            title_column: TITLE,
            exact_key: (!text.is_empty()).then(|| Value::from(text)),
            text,
        }
    }

    pub async fn get_by_inc(&self, inc: &str) -> EngineResult<Option<Record>> {
        check_available(&self.store, EntityKind::ItemName, REQUIRED).await?;
        let rows = self
            .store
            .query(
                tables::V_H6_NAME_INC,
                &Query::new(Predicate::eq(KEY, inc.trim())).limit(1),
            )
            .await?;
        Ok(first(rows))
    }

    /// Title, definition or code containing `text`.
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
        check_available(&self.store, EntityKind::ItemName, REQUIRED).await?;
        let text = text.trim();
        let m = self.matcher(text);
        let filter = if text.is_empty() {
            Predicate::All
        } else {
            Predicate::Or(vec![
                Predicate::contains(TITLE, text),
                Predicate::contains("DEFINITION", text),
                Predicate::contains(KEY, text),
            ])
        };
        self.store
            .query(tables::V_H6_NAME_INC, &m.query(filter, ranking, limit, offset))
            .await
    }

    /// Item names ordered by title.
    pub async fn list_all(&self, limit: u32) -> EngineResult<Vec<Record>> {
        check_available(&self.store, EntityKind::ItemName, REQUIRED).await?;
        let query = Query::all()
            .order_by(OrderKey::Asc(TITLE.to_string()))
            .limit(limit);
        self.store.query(tables::V_H6_NAME_INC, &query).await
    }
}

#[async_trait]
impl EntityService for ItemNameService {
    fn kind(&self) -> EntityKind {
        EntityKind::ItemName
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
            .map(|r| m.to_result(EntityKind::ItemName, tables::V_H6_NAME_INC, r))
            .collect())
    }
}
