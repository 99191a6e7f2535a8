//! Schema registry: the PubLog tables the engine knows about.
//!
//! The builtin tables carry typed layouts the entity services rely on. Further
//! tables of the extract can be declared in configuration; their columns are
//! all text.
//!
//! Each [`TableDescriptor`] names a logical table, the CSV file it is loaded
//! from, its typed column layout, the column that uniquely identifies a row
//! (if any), the columns that get a lookup index, and whether the table is a
//! small priority table or a multi-gigabyte large table indexed on demand.
//!
//! Column names are canonical upper case; lookups by table or column name are
//! case-insensitive.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::{Config, TableConfig};

/// Logical table names referenced by the entity services.
pub mod tables {
    pub const P_CAGE: &str = "P_CAGE";
    pub const V_H2_FSC: &str = "V_H2_FSC";
    pub const V_H2_FSG: &str = "V_H2_FSG";
    pub const V_H6_NAME_INC: &str = "V_H6_NAME_INC";
    pub const P_FLIS_NSN: &str = "P_FLIS_NSN";
    pub const FLISV: &str = "FLISV";
    pub const V_FLIS_MANAGEMENT: &str = "V_FLIS_MANAGEMENT";
    pub const V_CHARACTERISTICS: &str = "V_CHARACTERISTICS";
}

/// Prefix of the physical table an ingestion writes before the swap.
pub const STAGING_PREFIX: &str = "__staging__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    /// Small, frequently used; indexed first.
    Priority,
    /// Multi-gigabyte; indexed on demand, usually in the background.
    Large,
}

impl PriorityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Priority => "priority",
            PriorityClass::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    /// Stored as ISO-8601 `YYYY-MM-DD` text.
    Date,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Date => "date",
        }
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text | ColumnType::Date => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    /// Rows with an empty or unparseable required field are skipped.
    pub required: bool,
}

impl ColumnSpec {
    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnType::Date)
    }

    fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            ty,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub source: PathBuf,
    pub columns: Vec<ColumnSpec>,
    /// Unique key; later rows with a duplicate key are dropped on ingest.
    pub key: Option<String>,
    /// Columns that get a lookup index after loading.
    pub indexes: Vec<String>,
    pub class: PriorityClass,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column used as the final tie-break when ordering rows.
    pub fn order_column(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.columns[0].name)
    }

    pub fn staging_name(&self) -> String {
        format!("{}{}", STAGING_PREFIX, self.name)
    }
}

/// Quotes an identifier for use in SQL. Names come from the registry, but the
/// quoting keeps odd characters from ever reaching the statement unescaped.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

struct BuiltinTable {
    name: &'static str,
    path: &'static str,
    class: PriorityClass,
    key: Option<&'static str>,
    indexes: &'static [&'static str],
    columns: fn() -> Vec<ColumnSpec>,
}

const BUILTIN_TABLES: &[BuiltinTable] = &[
    BuiltinTable {
        name: tables::P_CAGE,
        path: "CAGE/P_CAGE.CSV",
        class: PriorityClass::Priority,
        key: Some("CAGE_CODE"),
        indexes: &["COMPANY", "CITY", "STATE_PROVINCE"],
        columns: || {
            vec![
                ColumnSpec::text("CAGE_CODE").required(),
                ColumnSpec::text("COMPANY"),
                ColumnSpec::text("CITY"),
                ColumnSpec::text("STATE_PROVINCE"),
                ColumnSpec::text("ZIP_POSTAL_ZONE"),
                ColumnSpec::text("COUNTRY"),
                ColumnSpec::text("CAO"),
                ColumnSpec::text("CAGE_STATUS"),
                ColumnSpec::text("TYPE"),
            ]
        },
    },
    BuiltinTable {
        name: tables::V_H2_FSC,
        path: "H-SERIES/V_H2_FSC.CSV",
        class: PriorityClass::Priority,
        key: Some("FSC"),
        indexes: &["FSC_TITLE"],
        columns: || {
            vec![
                ColumnSpec::integer("FSC").required(),
                ColumnSpec::text("FSC_TITLE").required(),
                ColumnSpec::text("FSC_NOTES"),
            ]
        },
    },
    BuiltinTable {
        name: tables::V_H2_FSG,
        path: "H-SERIES/V_H2_FSG.CSV",
        class: PriorityClass::Priority,
        key: Some("FSC"),
        indexes: &[],
        columns: || {
            vec![
                ColumnSpec::integer("FSC").required(),
                ColumnSpec::text("FSG_TITLE").required(),
            ]
        },
    },
    BuiltinTable {
        name: tables::V_H6_NAME_INC,
        path: "H-SERIES/V_H6_NAME_INC.CSV",
        class: PriorityClass::Priority,
        key: Some("INC"),
        indexes: &["FIIG_TITLE"],
        columns: || {
            vec![
                ColumnSpec::text("INC").required(),
                ColumnSpec::text("FIIG_TITLE"),
                ColumnSpec::text("DEFINITION"),
                ColumnSpec::text("INC_STATUS"),
                ColumnSpec::text("FIIG"),
                ColumnSpec::text("CONCEPT_NO"),
                ColumnSpec::text("TYPE_CODE"),
                ColumnSpec::text("COND_CODE"),
                ColumnSpec::date("DT_ESTB_CANC"),
            ]
        },
    },
    BuiltinTable {
        name: tables::P_FLIS_NSN,
        path: "IDENTIFICATION/P_FLIS_NSN.CSV",
        class: PriorityClass::Large,
        key: Some("NIIN"),
        indexes: &["FSC", "ITEM_NAME", "INC"],
        columns: || {
            vec![
                ColumnSpec::text("NIIN").required(),
                ColumnSpec::integer("FSC").required(),
                ColumnSpec::text("ITEM_NAME"),
                ColumnSpec::text("INC"),
                ColumnSpec::date("DT_NIIN_ASGMT"),
            ]
        },
    },
    BuiltinTable {
        name: tables::FLISV,
        path: "FLISV.CSV",
        class: PriorityClass::Large,
        key: None,
        indexes: &["NIIN"],
        columns: || {
            vec![
                ColumnSpec::text("NIIN").required(),
                ColumnSpec::text("MRC"),
                ColumnSpec::text("REQUIREMENTS_STATEMENT"),
                ColumnSpec::text("CLEAR_TEXT_REPLY"),
            ]
        },
    },
    BuiltinTable {
        name: tables::V_FLIS_MANAGEMENT,
        path: "MANAGEMENT/V_FLIS_MANAGEMENT.CSV",
        class: PriorityClass::Large,
        key: None,
        indexes: &["NIIN"],
        columns: || {
            vec![
                ColumnSpec::text("NIIN").required(),
                ColumnSpec::date("EFFECTIVE_DATE"),
                ColumnSpec::text("MOE"),
                ColumnSpec::text("SOS"),
                ColumnSpec::text("AAC"),
                ColumnSpec::integer("QUP"),
                ColumnSpec::text("UI"),
                ColumnSpec::text("UNIT_PRICE"),
            ]
        },
    },
    BuiltinTable {
        name: tables::V_CHARACTERISTICS,
        path: "V_CHARACTERISTICS-2.CSV",
        class: PriorityClass::Large,
        key: None,
        indexes: &["NIIN"],
        columns: || {
            vec![
                ColumnSpec::text("NIIN").required(),
                ColumnSpec::text("MRC"),
                ColumnSpec::text("REQUIREMENTS_STATEMENT"),
                ColumnSpec::text("CLEAR_TEXT_REPLY"),
            ]
        },
    },
];

/// Whether `name` is one of the builtin tables.
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_TABLES
        .iter()
        .any(|t| t.name.eq_ignore_ascii_case(name))
}

/// Immutable registry of every table the engine can materialize.
#[derive(Debug, Clone)]
pub struct Registry {
    tables: Vec<TableDescriptor>,
}

impl Registry {
    /// Builds the registry: the builtin tables, then every extra table
    /// declared under `[tables.<NAME>]`. Source paths resolve against
    /// `data.root`; a configured `path` replaces a builtin's default.
    pub fn from_config(config: &Config) -> Self {
        let mut tables: Vec<TableDescriptor> = BUILTIN_TABLES
            .iter()
            .map(|t| {
                let path = config
                    .tables
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(t.name))
                    .map(|(_, o)| o.path.as_path())
                    .unwrap_or_else(|| Path::new(t.path));
                TableDescriptor {
                    name: t.name.to_string(),
                    source: config.data.root.join(path),
                    columns: (t.columns)(),
                    key: t.key.map(str::to_string),
                    indexes: t.indexes.iter().map(|s| s.to_string()).collect(),
                    class: t.class,
                }
            })
            .collect();

        for (name, declared) in &config.tables {
            if is_builtin(name) || declared.columns.is_empty() {
                continue;
            }
            tables.push(declared_table(config, name, declared));
        }
        Self { tables }
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn by_class(&self, class: PriorityClass) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter().filter(move |t| t.class == class)
    }
}

fn declared_table(config: &Config, name: &str, declared: &TableConfig) -> TableDescriptor {
    let key = declared.key.as_deref().map(|k| k.trim().to_ascii_uppercase());
    let columns = declared
        .columns
        .iter()
        .map(|c| {
            let spec = ColumnSpec::text(c.trim());
            if key.as_deref() == Some(spec.name.as_str()) {
                spec.required()
            } else {
                spec
            }
        })
        .collect();
    TableDescriptor {
        name: name.to_ascii_uppercase(),
        source: config.data.root.join(&declared.path),
        columns,
        indexes: declared
            .indexes
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .collect(),
        key,
        class: declared.class.unwrap_or(PriorityClass::Priority),
    }
}
