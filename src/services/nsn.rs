//! National Stock Number lookups.
//!
//! Identification rows come from `P_FLIS_NSN`. When a NIIN is not there but
//! `FLISV` is materialized, the FLISV characteristics row is returned instead
//! (it has no FSC or item name). Detail views join the classification title
//! from `V_H2_FSC` on the FSC foreign key, one key at a time.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use super::{check_available, first, EntityService, Ranking, TextMatch};
use crate::error::{EngineError, EngineResult};
use crate::models::{EntityKind, Record, SearchResult, Value};
use crate::query::{Predicate, Query};
use crate::schema::tables;
use crate::store::Store;

const REQUIRED: &[&str] = &[tables::P_FLIS_NSN];
const KEY: &str = "NIIN";
const TITLE: &str = "ITEM_NAME";

/// Extracts the 9-digit NIIN from a NIIN, a 13-digit NSN or a dashed NSN
/// such as `5985-01-151-9535`.
pub fn normalize_niin(input: &str) -> Option<String> {
    let digits: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        9 => Some(digits),
        13 => Some(digits[4..].to_string()),
        _ => None,
    }
}

/// `FSC-NN-NNN-NNNN` for a class code and a 9-digit NIIN.
fn format_nsn(fsc: i64, niin: &str) -> Option<String> {
    if niin.len() != 9 || !(0..10_000).contains(&fsc) {
        return None;
    }
    Some(format!(
        "{:04}-{}-{}-{}",
        fsc,
        &niin[0..2],
        &niin[2..5],
        &niin[5..9]
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct NsnDetail {
    pub niin: String,
    pub nsn: Option<String>,
    pub source_table: String,
    pub record: Record,
    /// Classification row for the item's FSC, when that table is indexed.
    pub classification: Option<Record>,
}

#[derive(Clone)]
pub struct NsnService {
    store: Arc<Store>,
}

impl NsnService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn matcher<'a>(&self, text: &'a str) -> TextMatch<'a> {
        TextMatch {
            key_column: KEY,
            title_column: TITLE,
            exact_key: normalize_niin(text).map(Value::Text),
            text,
        }
    }

    fn parse_key(key: &str) -> EngineResult<String> {
        normalize_niin(key).ok_or_else(|| {
            EngineError::query(format!(
                "expected a 9-digit NIIN or 13-digit NSN, got {:?}",
                key
            ))
        })
    }

    async fn lookup(&self, niin: &str) -> EngineResult<Option<(Record, &'static str)>> {
        let by_key = Query::new(Predicate::eq(KEY, niin)).limit(1);
        if let Some(row) = first(self.store.query(tables::P_FLIS_NSN, &by_key).await?) {
            return Ok(Some((row, tables::P_FLIS_NSN)));
        }
        if self.store.table_exists(tables::FLISV).await? {
            if let Some(row) = first(self.store.query(tables::FLISV, &by_key).await?) {
                return Ok(Some((row, tables::FLISV)));
            }
        }
        Ok(None)
    }

    pub async fn get_by_niin(&self, key: &str) -> EngineResult<Option<Record>> {
        let niin = Self::parse_key(key)?;
        check_available(&self.store, EntityKind::Nsn, REQUIRED).await?;
        Ok(self.lookup(&niin).await?.map(|(row, _)| row))
    }

    /// Identification row plus its classification, when available.
    pub async fn detail(&self, key: &str) -> EngineResult<Option<NsnDetail>> {
        let niin = Self::parse_key(key)?;
        check_available(&self.store, EntityKind::Nsn, REQUIRED).await?;
        let Some((record, source)) = self.lookup(&niin).await? else {
            return Ok(None);
        };

        let fsc = record.get("FSC").and_then(Value::as_i64);
        let classification = match fsc {
            Some(code) if self.store.table_exists(tables::V_H2_FSC).await? => first(
                self.store
                    .query(
                        tables::V_H2_FSC,
                        &Query::new(Predicate::eq("FSC", code)).limit(1),
                    )
                    .await?,
            ),
            _ => None,
        };

        Ok(Some(NsnDetail {
            nsn: fsc.and_then(|code| format_nsn(code, &niin)),
            niin,
            source_table: source.to_string(),
            record,
            classification,
        }))
    }

    /// NIIN or item name containing `text`, optionally within one FSC.
    pub async fn search(
        &self,
        text: &str,
        fsc: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> EngineResult<Vec<Record>> {
        self.find(text, fsc, Ranking::KeyOrder, limit, offset).await
    }

    async fn find(
        &self,
        text: &str,
        fsc: Option<&str>,
        ranking: Ranking,
        limit: u32,
        offset: u64,
    ) -> EngineResult<Vec<Record>> {
        check_available(&self.store, EntityKind::Nsn, REQUIRED).await?;
        let text = text.trim();
        let m = self.matcher(text);
        let mut parts = Vec::new();
        if !text.is_empty() {
            let mut any = vec![
                Predicate::contains(KEY, text),
                Predicate::contains(TITLE, text),
            ];
            if let Some(niin) = &m.exact_key {
                any.push(Predicate::Eq(KEY.to_string(), niin.clone()));
            }
            parts.push(Predicate::Or(any));
        }
        if let Some(fsc) = fsc.map(str::trim).filter(|s| !s.is_empty()) {
            parts.push(Predicate::eq("FSC", fsc));
        }
        self.store
            .query(
                tables::P_FLIS_NSN,
                &m.query(Predicate::And(parts), ranking, limit, offset),
            )
            .await
    }

    pub async fn by_fsc(&self, fsc: &str, limit: u32, offset: u64) -> EngineResult<Vec<Record>> {
        check_available(&self.store, EntityKind::Nsn, REQUIRED).await?;
        let query = Query::new(Predicate::eq("FSC", fsc.trim()))
            .limit(limit)
            .offset(offset);
        self.store.query(tables::P_FLIS_NSN, &query).await
    }

    pub async fn management(&self, key: &str) -> EngineResult<Vec<Record>> {
        self.rows_for(key, tables::V_FLIS_MANAGEMENT).await
    }

    pub async fn characteristics(&self, key: &str) -> EngineResult<Vec<Record>> {
        self.rows_for(key, tables::V_CHARACTERISTICS).await
    }

    async fn rows_for(&self, key: &str, table: &'static str) -> EngineResult<Vec<Record>> {
        let niin = Self::parse_key(key)?;
        check_available(&self.store, EntityKind::Nsn, &[table]).await?;
        let query = Query::new(Predicate::eq(KEY, niin)).limit(self.store.max_limit());
        self.store.query(table, &query).await
    }
}

#[async_trait]
impl EntityService for NsnService {
    fn kind(&self) -> EntityKind {
        EntityKind::Nsn
    }

    fn required_tables(&self) -> &'static [&'static str] {
        REQUIRED
    }

    async fn ranked_search(&self, text: &str, limit: u32) -> EngineResult<Vec<SearchResult>> {
        let text = text.trim();
        let rows = self.find(text, None, Ranking::Relevance, limit, 0).await?;
        let m = self.matcher(text);
        Ok(rows
            .into_iter()
            .map(|r| m.to_result(EntityKind::Nsn, tables::P_FLIS_NSN, r))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_niin_and_nsn_forms() {
        assert_eq!(normalize_niin("011519535").as_deref(), Some("011519535"));
        assert_eq!(normalize_niin("5985011519535").as_deref(), Some("011519535"));
        assert_eq!(normalize_niin("5985-01-151-9535").as_deref(), Some("011519535"));
        assert_eq!(normalize_niin(" 01-151-9535 ").as_deref(), Some("011519535"));
        assert_eq!(normalize_niin("RADOME"), None);
        assert_eq!(normalize_niin("12345"), None);
        assert_eq!(normalize_niin(""), None);
    }

    #[test]
    fn formats_nsn_from_parts() {
        assert_eq!(
            format_nsn(5985, "011519535").as_deref(),
            Some("5985-01-151-9535")
        );
        assert_eq!(format_nsn(5985, "0115"), None);
    }
}
