//! Parameterized lookups against a materialized table.
//!
//! A [`Query`] is a fixed-shape request: a [`Predicate`] tree, an optional
//! projection, an ordering, and limit/offset. It is compiled against the
//! table's [`TableDescriptor`] so every column reference is checked and every
//! value is bound as a parameter. There is no free-form SQL.

use crate::error::{EngineError, EngineResult};
use crate::models::Value;
use crate::schema::{quote_ident, ColumnSpec, ColumnType, TableDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    All,
    Eq(String, Value),
    EqIgnoreCase(String, String),
    /// Case-insensitive substring match.
    Contains(String, String),
    /// Case-insensitive prefix match.
    StartsWith(String, String),
    /// Integer range `lo <= column < hi`.
    Range { column: String, lo: i64, hi: i64 },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.to_string(), value.into())
    }

    pub fn eq_ignore_case(column: &str, text: &str) -> Self {
        Predicate::EqIgnoreCase(column.to_string(), text.to_string())
    }

    pub fn contains(column: &str, text: &str) -> Self {
        Predicate::Contains(column.to_string(), text.to_string())
    }

    pub fn starts_with(column: &str, text: &str) -> Self {
        Predicate::StartsWith(column.to_string(), text.to_string())
    }

    pub fn range(column: &str, lo: i64, hi: i64) -> Self {
        Predicate::Range {
            column: column.to_string(),
            lo,
            hi,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKey {
    Asc(String),
    Desc(String),
    /// Ranks rows by the index of the first predicate they satisfy; rows
    /// matching none sort last.
    FirstMatch(Vec<Predicate>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub predicate: Predicate,
    pub projection: Option<Vec<String>>,
    pub order: Vec<OrderKey>,
    pub limit: u32,
    pub offset: u64,
}

impl Query {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            projection: None,
            order: Vec::new(),
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }

    pub fn all() -> Self {
        Self::new(Predicate::All)
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.projection = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, key: OrderKey) -> Self {
        self.order.push(key);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// SQL text, positional parameters and the columns each row will carry.
#[derive(Debug)]
pub(crate) struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<ColumnSpec>,
}

/// Clamps the caller's limit to `max_limit`; zero is a caller error.
pub fn effective_limit(limit: u32, max_limit: u32) -> EngineResult<u32> {
    if limit == 0 {
        return Err(EngineError::query("limit must be >= 1"));
    }
    if limit > max_limit {
        tracing::debug!(limit, max_limit, "clamping query limit");
        return Ok(max_limit);
    }
    Ok(limit)
}

impl Query {
    pub(crate) fn compile(
        &self,
        table: &TableDescriptor,
        max_limit: u32,
    ) -> EngineResult<CompiledQuery> {
        let limit = effective_limit(self.limit, max_limit)?;
        let offset = i64::try_from(self.offset)
            .map_err(|_| EngineError::query("offset out of range"))?;

        let columns: Vec<ColumnSpec> = match &self.projection {
            None => table.columns.clone(),
            Some(names) if names.is_empty() => {
                return Err(EngineError::query("projection must name at least one column"))
            }
            Some(names) => names
                .iter()
                .map(|n| resolve(table, n).cloned())
                .collect::<EngineResult<_>>()?,
        };

        let mut params = Vec::new();
        let where_sql = compile_predicate(&self.predicate, table, &mut params)?;

        let mut order_sql = Vec::new();
        let mut has_tiebreak = false;
        for key in &self.order {
            match key {
                OrderKey::Asc(c) | OrderKey::Desc(c) => {
                    let col = resolve(table, c)?;
                    if col.name == table.order_column() {
                        has_tiebreak = true;
                    }
                    let dir = if matches!(key, OrderKey::Asc(_)) { "ASC" } else { "DESC" };
                    order_sql.push(format!("{} {}", quote_ident(&col.name), dir));
                }
                OrderKey::FirstMatch(preds) => {
                    let mut case = String::from("CASE");
                    for (rank, p) in preds.iter().enumerate() {
                        let cond = compile_predicate(p, table, &mut params)?;
                        case.push_str(&format!(" WHEN {} THEN {}", cond, rank));
                    }
                    case.push_str(&format!(" ELSE {} END", preds.len()));
                    order_sql.push(case);
                }
            }
        }
        if !has_tiebreak {
            order_sql.push(format!("{} ASC", quote_ident(table.order_column())));
        }
        order_sql.push("rowid ASC".to_string());

        let select_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            select_list,
            quote_ident(&table.name),
            where_sql,
            order_sql.join(", ")
        );
        params.push(Value::Integer(i64::from(limit)));
        params.push(Value::Integer(offset));

        Ok(CompiledQuery {
            sql,
            params,
            columns,
        })
    }
}

fn resolve<'a>(table: &'a TableDescriptor, name: &str) -> EngineResult<&'a ColumnSpec> {
    table.column(name).ok_or_else(|| {
        EngineError::query(format!("unknown column {} in table {}", name, table.name))
    })
}

pub(crate) fn compile_predicate(
    predicate: &Predicate,
    table: &TableDescriptor,
    params: &mut Vec<Value>,
) -> EngineResult<String> {
    Ok(match predicate {
        Predicate::All => "1=1".to_string(),
        Predicate::Eq(c, value) => {
            let col = resolve(table, c)?;
            match value {
                Value::Null => format!("{} IS NULL", quote_ident(&col.name)),
                v => {
                    params.push(coerce_for(col, v)?);
                    format!("{} = ?", quote_ident(&col.name))
                }
            }
        }
        Predicate::EqIgnoreCase(c, text) => {
            let col = resolve(table, c)?;
            params.push(Value::Text(text.to_uppercase()));
            format!("{} = ?", upper_text(col))
        }
        Predicate::Contains(c, text) => {
            let col = resolve(table, c)?;
            params.push(Value::Text(format!("%{}%", escape_like(&text.to_uppercase()))));
            format!("{} LIKE ? ESCAPE '\\'", upper_text(col))
        }
        Predicate::StartsWith(c, text) => {
            let col = resolve(table, c)?;
            params.push(Value::Text(format!("{}%", escape_like(&text.to_uppercase()))));
            format!("{} LIKE ? ESCAPE '\\'", upper_text(col))
        }
        Predicate::Range { column, lo, hi } => {
            let col = resolve(table, column)?;
            if col.ty != ColumnType::Integer {
                return Err(EngineError::query(format!(
                    "range predicate requires an integer column, {} is {:?}",
                    col.name, col.ty
                )));
            }
            params.push(Value::Integer(*lo));
            params.push(Value::Integer(*hi));
            let ident = quote_ident(&col.name);
            format!("({} >= ? AND {} < ?)", ident, ident)
        }
        Predicate::And(parts) => join(parts, " AND ", "1=1", table, params)?,
        Predicate::Or(parts) => join(parts, " OR ", "1=0", table, params)?,
    })
}

fn join(
    parts: &[Predicate],
    sep: &str,
    empty: &str,
    table: &TableDescriptor,
    params: &mut Vec<Value>,
) -> EngineResult<String> {
    if parts.is_empty() {
        return Ok(empty.to_string());
    }
    let compiled = parts
        .iter()
        .map(|p| compile_predicate(p, table, params))
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(format!("({})", compiled.join(sep)))
}

fn upper_text(col: &ColumnSpec) -> String {
    match col.ty {
        ColumnType::Integer => format!("CAST({} AS TEXT)", quote_ident(&col.name)),
        ColumnType::Text | ColumnType::Date => format!("UPPER({})", quote_ident(&col.name)),
    }
}

/// Binds a comparison value with the column's storage type.
fn coerce_for(col: &ColumnSpec, value: &Value) -> EngineResult<Value> {
    match (col.ty, value) {
        (ColumnType::Integer, Value::Integer(_)) => Ok(value.clone()),
        (ColumnType::Integer, Value::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| EngineError::query(format!("{} expects an integer, got {:?}", col.name, s))),
        (_, Value::Integer(n)) => Ok(Value::Text(n.to_string())),
        _ => Ok(value.clone()),
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
