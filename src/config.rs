use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::schema::{self, PriorityClass};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Source path overrides for builtin tables and declarations of extra
    /// tables, keyed by logical table name.
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Directory holding the PubLog CSV extract (CAGE/, H-SERIES/, ...).
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Fraction of malformed rows tolerated before an ingestion is failed.
    #[serde(default = "default_max_skip_ratio")]
    pub max_skip_ratio: f64,
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_skip_ratio: default_max_skip_ratio(),
            batch_rows: default_batch_rows(),
            delimiter: default_delimiter(),
        }
    }
}

fn default_max_skip_ratio() -> f64 {
    0.05
}
fn default_batch_rows() -> usize {
    5000
}
fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_limit() -> u32 {
    50
}
fn default_max_limit() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// A `[tables.<NAME>]` section. For a builtin table only `path` may be set.
/// Any other name declares an extra table whose columns are all text.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TableConfig {
    /// Source file; relative paths resolve against `data.root`.
    pub path: PathBuf,
    pub class: Option<PriorityClass>,
    /// Unique key column. Rows with an empty key are skipped.
    pub key: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    /// Columns that get a lookup index after loading.
    #[serde(default)]
    pub indexes: Vec<String>,
}

impl TableConfig {
    fn declares_schema(&self) -> bool {
        self.class.is_some()
            || self.key.is_some()
            || !self.columns.is_empty()
            || !self.indexes.is_empty()
    }

    fn validate(&self, name: &str) -> Result<()> {
        if schema::is_builtin(name) {
            if self.declares_schema() {
                anyhow::bail!(
                    "tables.{}: builtin table schema is fixed; only `path` may be set",
                    name
                );
            }
            return Ok(());
        }
        let staging = schema::STAGING_PREFIX.to_ascii_uppercase();
        if name.trim().is_empty() || name.to_ascii_uppercase().starts_with(&staging) {
            anyhow::bail!("tables.{}: invalid table name", name);
        }
        if self.columns.is_empty() {
            anyhow::bail!("tables.{}: `columns` must list the source columns", name);
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if column.trim().is_empty() || !seen.insert(column.trim().to_ascii_uppercase()) {
                anyhow::bail!("tables.{}: column {:?} is empty or repeated", name, column);
            }
        }
        for column in self.key.iter().chain(&self.indexes) {
            if !seen.contains(&column.trim().to_ascii_uppercase()) {
                anyhow::bail!("tables.{}: {} is not a declared column", name, column);
            }
        }
        Ok(())
    }
}

impl Config {
    /// Builds a config with defaults for everything except the two locations.
    pub fn with_paths(db_path: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            data: DataConfig {
                root: data_root.into(),
            },
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            server: ServerConfig::default(),
            tables: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ingest.max_skip_ratio) {
            anyhow::bail!("ingest.max_skip_ratio must be in [0.0, 1.0]");
        }
        if self.ingest.batch_rows == 0 {
            anyhow::bail!("ingest.batch_rows must be > 0");
        }
        if !self.ingest.delimiter.is_ascii() {
            anyhow::bail!("ingest.delimiter must be a single ASCII character");
        }
        if self.query.max_limit == 0 {
            anyhow::bail!("query.max_limit must be >= 1");
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            anyhow::bail!("query.default_limit must be in [1, query.max_limit]");
        }
        let mut names = std::collections::HashSet::new();
        for (name, table) in &self.tables {
            if !names.insert(name.to_ascii_uppercase()) {
                anyhow::bail!("tables.{} is configured twice", name);
            }
            table.validate(name)?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
