//! # PubLog Index CLI (`publog`)
//!
//! The `publog` binary indexes PubLog CSV extracts on demand and answers
//! lookups against them, from the command line or over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! publog --config ./config/publog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `publog init` | Create the store and reconcile table state |
//! | `publog tables` | List registered tables and their source files |
//! | `publog tables <table>` | Columns, status and row count of one table |
//! | `publog index <table>` | Materialize one table (`--force` to reload) |
//! | `publog index --class priority` | Materialize a class of tables |
//! | `publog status` | Per-table indexing status |
//! | `publog stats` | Store and table sizes |
//! | `publog search "<query>"` | Unified search across entity types |
//! | `publog cage <code>` | Contractor by CAGE code |
//! | `publog nsn <niin>` | Stock number detail by NIIN or NSN |
//! | `publog fsc <code>` | Supply class by code |
//! | `publog inc <code>` | Item name by INC |
//! | `publog serve` | Start the JSON HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! # Index the small tables first
//! publog index --class priority
//!
//! # Index the stock number table, with JSON progress on stderr
//! publog --progress json index P_FLIS_NSN
//!
//! # Search everything that is indexed
//! publog search "radome" --limit 10
//! ```
//!
//! Logs go to stderr and honour `RUST_LOG`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use publog_index::config::{self, Config};
use publog_index::engine::{parse_class_selector, Engine, TableInfo, TableOutcome};
use publog_index::progress::{IngestProgressReporter, ProgressMode};
use publog_index::search::print_results;
use publog_index::server;
use publog_index::stats;
use publog_index::store::MaterializeOptions;

/// PubLog Index CLI: on-demand indexing and lookup of PubLog reference data.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/publog.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "publog",
    about = "PubLog Index: on-demand indexing and lookup of PubLog reference data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/publog.toml")]
    config: PathBuf,

    /// Ingestion progress on stderr: off, human or json. Defaults to human
    /// when stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<String>,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and reconcile table state.
    ///
    /// Idempotent: an existing store is opened and left as is.
    Init,

    /// List registered tables, or describe one table.
    Tables {
        /// Show this table's columns, status and row count.
        table: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Materialize tables from their source files.
    ///
    /// Tables already in the store are skipped unless `--force` is given.
    Index {
        /// Table name (e.g. `P_CAGE`). Mutually exclusive with `--class`.
        table: Option<String>,

        /// Table class: `priority`, `large` or `all`.
        #[arg(long, conflicts_with = "table")]
        class: Option<String>,

        /// Reload even when the table is already materialized.
        #[arg(long)]
        force: bool,

        /// Print the ingestion report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show per-table indexing status.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show store and table sizes.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Search every indexed entity type.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        json: bool,
    },

    /// Look up a contractor by CAGE code.
    Cage { code: String },

    /// Look up a stock number by NIIN or NSN.
    Nsn { niin: String },

    /// Look up a supply class by code.
    Fsc { code: String },

    /// Look up an item name by INC.
    Inc { code: String },

    /// Start the JSON HTTP API on `[server].bind`.
    Serve {
        /// Override the bind address.
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_logging(verbose: bool, default_level: &str) {
    let filter = if verbose {
        EnvFilter::new("publog_index=debug,publog=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("publog_index={}", default_level)))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn progress_reporter(flag: Option<&str>) -> Result<Arc<dyn IngestProgressReporter>> {
    let mode = match flag {
        Some(s) => ProgressMode::parse(s)
            .with_context(|| format!("invalid --progress value {:?}; use off, human or json", s))?,
        None => ProgressMode::default_for_tty(),
    };
    Ok(mode.reporter())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_lookup<T: Serialize>(value: Option<T>, what: &str, key: &str) -> Result<()> {
    match value {
        Some(v) => print_json(&v),
        None => bail!("{} {} not found", what, key),
    }
}

fn print_outcomes(outcomes: &[TableOutcome]) {
    for o in outcomes {
        match (&o.report, &o.error) {
            (Some(r), _) if r.reused_existing => {
                println!("{:<20} already indexed ({} rows)", o.table, r.rows)
            }
            (Some(r), _) => println!(
                "{:<20} indexed {} rows ({} skipped, {} duplicates) in {} ms",
                o.table, r.rows, r.skipped, r.duplicates, r.duration_ms
            ),
            (None, Some(e)) => println!("{:<20} failed: {}", o.table, e),
            (None, None) => {}
        }
    }
}

fn print_tables(engine: &Engine) {
    println!(
        "  {:<24} {:<9} {:<11} {}",
        "TABLE", "CLASS", "KEY", "SOURCE"
    );
    println!("  {}", "-".repeat(80));
    for t in engine.registry().tables() {
        println!(
            "  {:<24} {:<9} {:<11} {}",
            t.name,
            t.class.as_str(),
            t.key.as_deref().unwrap_or("-"),
            t.source.display()
        );
    }
}

fn print_table_info(info: &TableInfo) {
    let status = &info.status;
    println!("{} ({})", status.name, status.class.as_str());
    println!("  source:  {}", status.source);
    println!("  status:  {}", status.state.status.as_str());
    if let Some(rows) = status.state.row_count {
        println!("  rows:    {}", rows);
    }
    println!();
    println!("  {:<28} {:<8} {}", "COLUMN", "TYPE", "NOTES");
    for c in &info.columns {
        let mut notes = Vec::new();
        if info.key.as_deref() == Some(c.name.as_str()) {
            notes.push("key");
        } else if c.required {
            notes.push("required");
        }
        if info.indexes.iter().any(|i| i == &c.name) {
            notes.push("indexed");
        }
        println!("  {:<28} {:<8} {}", c.name, c.ty.as_str(), notes.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Commands::Index { .. } | Commands::Serve { .. } | Commands::Init => "info",
        _ => "warn",
    };
    init_logging(cli.verbose, default_level);

    let cfg = config::load_config(&cli.config)?;
    let progress = progress_reporter(cli.progress.as_deref())?;
    let engine = Arc::new(Engine::open_with_progress(&cfg, Some(progress)).await?);

    let result = run(&cli, &cfg, Arc::clone(&engine)).await;
    if !matches!(cli.command, Commands::Serve { .. }) {
        engine.shutdown().await;
    }
    result
}

async fn run(cli: &Cli, cfg: &Config, engine: Arc<Engine>) -> Result<()> {
    match &cli.command {
        Commands::Init => {
            println!("Store ready at {}", cfg.db.path.display());
        }
        Commands::Tables { table, json } => match table {
            Some(t) => {
                let info = engine.table_info(t).await?;
                if *json {
                    print_json(&info)?;
                } else {
                    print_table_info(&info);
                }
            }
            None if *json => print_json(&engine.registry().tables())?,
            None => print_tables(&engine),
        },
        Commands::Index {
            table,
            class,
            force,
            json,
        } => {
            let options = MaterializeOptions { force: *force };
            let outcomes = match (table, class) {
                (Some(t), _) => {
                    let report = engine.materialize(t, options).await?;
                    vec![TableOutcome {
                        table: report.table.clone(),
                        report: Some(report),
                        error: None,
                    }]
                }
                (None, Some(c)) => {
                    let class = parse_class_selector(c)?;
                    engine.materialize_all(class, options).await
                }
                (None, None) => bail!("give a table name or --class priority|large|all"),
            };
            if *json {
                print_json(&outcomes)?;
            } else {
                print_outcomes(&outcomes);
            }
            let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
            if failed > 0 {
                bail!("{} of {} tables failed to index", failed, outcomes.len());
            }
        }
        Commands::Status { json } => {
            if *json {
                print_json(&engine.status())?;
            } else {
                stats::run_status(&engine);
            }
        }
        Commands::Stats { json } => {
            if *json {
                print_json(&engine.stats().await?)?;
            } else {
                stats::run_stats(&engine).await?;
            }
        }
        Commands::Search { query, limit, json } => {
            let limit = limit.unwrap_or(engine.default_limit());
            let results = engine.search(query, limit).await?;
            if *json {
                print_json(&results)?;
            } else {
                print_results(&results);
            }
        }
        Commands::Cage { code } => {
            print_lookup(engine.cage().get_by_code(code).await?, "CAGE", code)?;
        }
        Commands::Nsn { niin } => {
            print_lookup(engine.nsn().detail(niin).await?, "NIIN", niin)?;
        }
        Commands::Fsc { code } => {
            print_lookup(engine.fsc().get_class(code).await?, "FSC", code)?;
        }
        Commands::Inc { code } => {
            print_lookup(engine.item_names().get_by_inc(code).await?, "INC", code)?;
        }
        Commands::Serve { bind } => {
            let bind = bind.clone().unwrap_or_else(|| cfg.server.bind.clone());
            server::run_server(engine, &bind).await?;
        }
    }
    Ok(())
}
