//! Status and statistics reports.
//!
//! Human-readable summaries of what is indexed: per-table state, row counts,
//! skipped rows, last indexing time and error, plus store and table sizes.
//! Used by `publog status` and `publog stats`.

use chrono::{DateTime, Utc};

use crate::engine::{Engine, TableStatus};
use crate::error::EngineResult;
use crate::progress::format_number;
use crate::state::IndexStatus;
use crate::store::StoreStats;

/// Print per-table materialization status.
pub fn print_status(tables: &[TableStatus]) {
    println!("PubLog Index — Table Status");
    println!("===========================");
    println!();
    println!(
        "  {:<20} {:<9} {:<12} {:>12} {:>9}   {}",
        "TABLE", "CLASS", "STATUS", "ROWS", "SKIPPED", "LAST INDEXED"
    );
    println!("  {}", "-".repeat(84));

    for t in tables {
        let s = &t.state;
        let rows = match (s.status, s.row_count) {
            (IndexStatus::Indexing, _) => format!("{}…", format_number(s.rows_processed)),
            (_, Some(n)) => format_number(n),
            (_, None) => "-".to_string(),
        };
        let when = s
            .last_indexed_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<20} {:<9} {:<12} {:>12} {:>9}   {}",
            t.name,
            t.class.as_str(),
            status_label(s.status, s.materialized),
            rows,
            format_number(s.skipped_rows),
            when
        );
        if !t.source_present && !s.materialized {
            println!("      source missing: {}", t.source);
        }
        if let Some(err) = &s.last_error {
            println!("      last error: {}", err);
        }
    }
    println!();
}

fn status_label(status: IndexStatus, materialized: bool) -> String {
    match (status, materialized) {
        // A failed re-index still serves the previous table.
        (IndexStatus::Failed, true) => "failed*".to_string(),
        _ => status.as_str().to_string(),
    }
}

/// Print store size and per-table sizes.
pub fn print_stats(stats: &StoreStats) {
    println!("PubLog Index — Database Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", stats.db_path);
    println!("  Size:        {}", format_bytes(stats.db_size_bytes));
    let indexed = stats.tables.iter().filter(|t| t.materialized).count();
    println!("  Indexed:     {} / {} tables", indexed, stats.tables.len());
    println!();
    println!("  {:<20} {:<9} {:>12} {:>10}", "TABLE", "CLASS", "ROWS", "SIZE");
    println!("  {}", "-".repeat(56));
    for t in &stats.tables {
        let rows = t
            .row_count
            .map(format_number)
            .unwrap_or_else(|| "-".to_string());
        let size = t
            .size_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:<9} {:>12} {:>10}",
            t.name,
            t.class.as_str(),
            rows,
            size
        );
    }
    println!();
}

/// Run the status command.
pub fn run_status(engine: &Engine) {
    print_status(&engine.status());
}

/// Run the stats command.
pub async fn run_stats(engine: &Engine) -> EngineResult<()> {
    let stats = engine.stats().await?;
    print_stats(&stats);
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    relative_to(ts, Utc::now())
}

fn relative_to(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn bytes_are_scaled() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(relative_to(now - Duration::seconds(5), now), "just now");
        assert_eq!(relative_to(now - Duration::minutes(1), now), "1 min ago");
        assert_eq!(relative_to(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(relative_to(now - Duration::days(2), now), "2 days ago");
        let old = now - Duration::days(90);
        assert_eq!(relative_to(old, now), format_ts_iso(old));
    }

    #[test]
    fn failed_reindex_is_flagged() {
        assert_eq!(status_label(IndexStatus::Failed, true), "failed*");
        assert_eq!(status_label(IndexStatus::Failed, false), "failed");
        assert_eq!(status_label(IndexStatus::Indexed, true), "indexed");
    }
}
