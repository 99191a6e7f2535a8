//! Entity lookup services.
//!
//! One service per entity class. Each declares the tables it depends on and
//! checks them against the physical store before running; a missing table is
//! reported as [`EngineError::Unavailable`] instead of attempting a degraded
//! query.
//!
//! Paged text searches return the row whose key equals the query first, then
//! the rest in ascending key order. Unified search ranks by relevance instead:
//! exact key, then title match, then everything else, each group in ascending
//! key order. [`TextMatch`] builds both the SQL ordering and the per-row
//! [`MatchKind`] from the same definition so the two never disagree.

pub mod cage;
pub mod fsc;
pub mod item_name;
pub mod nsn;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::models::{EntityKind, MatchKind, Record, SearchResult, Value};
use crate::query::{OrderKey, Predicate, Query};
use crate::store::Store;

pub use cage::{CageService, CageStats, LocationFilter, ValueCount};
pub use fsc::{FscService, SupplyGroup};
pub use item_name::ItemNameService;
pub use nsn::{normalize_niin, NsnDetail, NsnService};

/// A lookup service that takes part in unified search.
#[async_trait]
pub trait EntityService: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Tables that must be materialized before the service can run.
    fn required_tables(&self) -> &'static [&'static str];

    /// The best `limit` hits for `text`, already in rank order.
    async fn ranked_search(&self, text: &str, limit: u32) -> EngineResult<Vec<SearchResult>>;
}

/// Fails with `Unavailable` listing every table in `tables` that the store
/// does not hold.
pub(crate) async fn check_available(
    store: &Store,
    kind: EntityKind,
    tables: &[&str],
) -> EngineResult<()> {
    let mut missing = Vec::new();
    for table in tables {
        if !store.table_exists(table).await? {
            missing.push(table.to_string());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Unavailable {
            service: kind.as_str().to_string(),
            missing,
        })
    }
}

/// Returns the first record, for lookups that match at most one row.
pub(crate) fn first(records: Vec<Record>) -> Option<Record> {
    records.into_iter().next()
}

/// Row order for a text search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ranking {
    /// Exact key first, then ascending key.
    KeyOrder,
    /// Exact key, then title match, then the rest; ascending key within each.
    Relevance,
}

/// Ranking definition for one service's free-text search.
#[derive(Debug, Clone)]
pub(crate) struct TextMatch<'a> {
    pub key_column: &'a str,
    pub title_column: &'a str,
    /// The value the key column would hold if the text were an exact key.
    pub exact_key: Option<Value>,
    pub text: &'a str,
}

impl TextMatch<'_> {
    fn exact_predicate(&self) -> Option<Predicate> {
        self.exact_key
            .clone()
            .map(|v| Predicate::Eq(self.key_column.to_string(), v))
    }

    fn name_predicate(&self) -> Predicate {
        Predicate::contains(self.title_column, self.text)
    }

    pub fn query(&self, filter: Predicate, ranking: Ranking, limit: u32, offset: u64) -> Query {
        let mut ranks = Vec::new();
        ranks.extend(self.exact_predicate());
        if ranking == Ranking::Relevance && !self.text.is_empty() {
            ranks.push(self.name_predicate());
        }
        let mut query = Query::new(filter).limit(limit).offset(offset);
        if !ranks.is_empty() {
            query = query.order_by(OrderKey::FirstMatch(ranks));
        }
        query.order_by(OrderKey::Asc(self.key_column.to_string()))
    }

    pub fn classify(&self, record: &Record) -> MatchKind {
        if let (Some(exact), Some(value)) = (&self.exact_key, record.get(self.key_column)) {
            if exact == value {
                return MatchKind::ExactKey;
            }
        }
        let needle = self.text.to_uppercase();
        if !needle.is_empty() {
            if let Some(title) = record.text(self.title_column) {
                if title.to_uppercase().contains(&needle) {
                    return MatchKind::Name;
                }
            }
        }
        MatchKind::Other
    }

    pub fn to_result(&self, kind: EntityKind, table: &str, record: Record) -> SearchResult {
        SearchResult {
            kind,
            key: record.text(self.key_column).unwrap_or_default(),
            title: record.text(self.title_column),
            match_kind: self.classify(&record),
            source_table: table.to_string(),
            fields: record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str, company: &str) -> Record {
        let mut r = Record::new();
        r.push("CAGE_CODE", Value::from(code));
        r.push("COMPANY", Value::from(company));
        r
    }

    fn matcher(text: &str) -> TextMatch<'_> {
        TextMatch {
            key_column: "CAGE_CODE",
            title_column: "COMPANY",
            exact_key: Some(Value::from(text.to_uppercase())),
            text,
        }
    }

    #[test]
    fn classifies_exact_then_name_then_other() {
        let m = matcher("1abc2");
        assert_eq!(m.classify(&record("1ABC2", "ACME")), MatchKind::ExactKey);
        let m = matcher("acme");
        assert_eq!(m.classify(&record("1ABC2", "ACME CORP")), MatchKind::Name);
        assert_eq!(m.classify(&record("ACME9", "OTHER")), MatchKind::Other);
    }

    #[test]
    fn paged_query_orders_exact_then_key() {
        let m = matcher("acme");
        let q = m.query(Predicate::All, Ranking::KeyOrder, 10, 5);
        assert_eq!(q.offset, 5);
        assert_eq!(
            q.order,
            vec![
                OrderKey::FirstMatch(vec![Predicate::eq("CAGE_CODE", "ACME")]),
                OrderKey::Asc("CAGE_CODE".to_string()),
            ]
        );
    }

    #[test]
    fn relevance_query_orders_by_match_then_key() {
        let m = matcher("acme");
        let q = m.query(Predicate::All, Ranking::Relevance, 10, 0);
        assert_eq!(
            q.order,
            vec![
                OrderKey::FirstMatch(vec![
                    Predicate::eq("CAGE_CODE", "ACME"),
                    Predicate::contains("COMPANY", "acme"),
                ]),
                OrderKey::Asc("CAGE_CODE".to_string()),
            ]
        );
    }

    #[test]
    fn empty_text_orders_by_key_only() {
        let m = TextMatch {
            key_column: "INC",
            title_column: "FIIG_TITLE",
            exact_key: None,
            text: "",
        };
        let q = m.query(Predicate::All, Ranking::Relevance, 5, 0);
        assert_eq!(q.order, vec![OrderKey::Asc("INC".to_string())]);
    }
}
