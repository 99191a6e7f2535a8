//! Core data models shared by the store, the entity services and the search
//! coordinator.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A scalar cell value. Dates are carried as ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

/// One row of an entity table, in declared column order.
///
/// Optional columns are present with [`Value::Null`] when the source had no
/// value; a projection only carries the projected columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.fields.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    }

    /// Text rendering of a column; `None` when absent or null.
    pub fn text(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::Null => None,
            v => Some(v.to_string()),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Entity classes served by the lookup services, in unified-search order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Nsn,
    Cage,
    Fsc,
    #[serde(rename = "inc")]
    ItemName,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Nsn => "nsn",
            EntityKind::Cage => "cage",
            EntityKind::Fsc => "fsc",
            EntityKind::ItemName => "inc",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a row matched a free-text query. Declaration order is rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    ExactKey,
    Name,
    Other,
}

/// A single hit in a unified search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub kind: EntityKind,
    pub key: String,
    pub title: Option<String>,
    pub match_kind: MatchKind,
    pub source_table: String,
    pub fields: Record,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_in_column_order() {
        let mut record = Record::new();
        record.push("NIIN", Value::from("011519535"));
        record.push("FSC", Value::from(5985));
        record.push("ITEM_NAME", Value::Null);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"NIIN":"011519535","FSC":5985,"ITEM_NAME":null}"#);
    }

    #[test]
    fn record_text_skips_nulls() {
        let mut record = Record::new();
        record.push("COMPANY", Value::from("ACME"));
        record.push("CITY", Value::Null);
        assert_eq!(record.text("company").as_deref(), Some("ACME"));
        assert_eq!(record.text("CITY"), None);
        assert_eq!(record.text("MISSING"), None);
    }

    #[test]
    fn match_kind_orders_exact_first() {
        let mut kinds = vec![MatchKind::Other, MatchKind::ExactKey, MatchKind::Name];
        kinds.sort();
        assert_eq!(kinds, vec![MatchKind::ExactKey, MatchKind::Name, MatchKind::Other]);
    }
}
