//! Ingestion progress reporting.
//!
//! Reports observable progress while a source file is being materialized so
//! operators can see how far a multi-gigabyte load has got. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts. The same
//! counters are also recorded in the table's state and surfaced by `status`.

use std::io::Write;
use std::sync::Arc;

/// Rows between two `Loading` events for the same table.
pub const PROGRESS_EVERY_ROWS: u64 = 100_000;

/// A single progress event for one table's ingestion.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Source file opened; size known, row count not.
    Started { table: String, bytes: u64 },
    /// Rows read so far (loaded + duplicates + skipped).
    Loading {
        table: String,
        rows: u64,
        skipped: u64,
    },
    /// Staging table complete; swapping it in.
    Swapping { table: String },
    Finished {
        table: String,
        rows: u64,
        skipped: u64,
        duplicates: u64,
        duration_ms: u64,
    },
    Failed { table: String, reason: String },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "index P_FLIS_NSN  loading  1,200,000 rows (3 skipped)".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Started { table, bytes } => {
                format!("index {}  started  ({} bytes)\n", table, format_number(*bytes))
            }
            IngestProgressEvent::Loading {
                table,
                rows,
                skipped,
            } => format!(
                "index {}  loading  {} rows ({} skipped)\n",
                table,
                format_number(*rows),
                format_number(*skipped)
            ),
            IngestProgressEvent::Swapping { table } => format!("index {}  swapping\n", table),
            IngestProgressEvent::Finished {
                table,
                rows,
                skipped,
                duplicates,
                duration_ms,
            } => format!(
                "index {}  done  {} rows, {} skipped, {} duplicates in {} ms\n",
                table,
                format_number(*rows),
                format_number(*skipped),
                format_number(*duplicates),
                duration_ms
            ),
            IngestProgressEvent::Failed { table, reason } => {
                format!("index {}  failed  {}\n", table, reason)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Started { table, bytes } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "started",
                "bytes": bytes
            }),
            IngestProgressEvent::Loading {
                table,
                rows,
                skipped,
            } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "loading",
                "rows": rows,
                "skipped": skipped
            }),
            IngestProgressEvent::Swapping { table } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "swapping"
            }),
            IngestProgressEvent::Finished {
                table,
                rows,
                skipped,
                duplicates,
                duration_ms,
            } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "finished",
                "rows": rows,
                "skipped": skipped,
                "duplicates": duplicates,
                "duration_ms": duration_ms
            }),
            IngestProgressEvent::Failed { table, reason } => serde_json::json!({
                "event": "progress",
                "table": table,
                "phase": "failed",
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode. The store hands it to every ingestion.
    pub fn reporter(&self) -> Arc<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parse() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
