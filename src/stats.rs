//! Reservation database overview.
//!
//! Summarises delivery state: reservations per status and the most recently
//! completed files with their counters. Used by `airq stats` to confirm that
//! runs are making progress and to spot files with failed rows.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::models::ProcessingStats;
use crate::reservation::SqliteReservationStore;

const RECENT_FILES: i64 = 20;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteReservationStore::new(pool.clone(), config.db.reclaim_failed);

    let status_counts = store.status_counts().await?;
    let recent = store.recent_file_stats(RECENT_FILES).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("airq — Delivery Stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    let total: i64 = status_counts.iter().map(|(_, n)| n).sum();
    println!("  Reserved rows: {}", total);
    for (status, n) in &status_counts {
        println!("    {:<10} {:>10}", status, n);
    }

    if !recent.is_empty() {
        let mut overall = ProcessingStats::default();
        for record in &recent {
            overall.absorb(&record.stats);
        }

        println!();
        println!("  Recent files:");
        println!(
            "  {:<48} {:>7} {:>7} {:>7} {:>7}   {}",
            "FILE", "TOTAL", "OK", "FAILED", "SKIPPED", "COMPLETED"
        );
        println!("  {}", "-".repeat(100));
        for record in &recent {
            println!(
                "  {:<48} {:>7} {:>7} {:>7} {:>7}   {}",
                display_file_id(&record.file_id),
                record.stats.total_rows,
                record.stats.successful_rows,
                record.stats.failed_rows,
                record.stats.skipped_rows,
                format_ts_relative(record.completed_at.timestamp())
            );
        }
        println!(
            "  {:<48} {:>7} {:>7} {:>7} {:>7}",
            "(shown)",
            overall.total_rows,
            overall.successful_rows,
            overall.failed_rows,
            overall.skipped_rows
        );
    }

    println!();

    pool.close().await;
    Ok(())
}

/// The path part of a fingerprint, shortened from the left to fit the column.
fn display_file_id(file_id: &str) -> String {
    let path = file_id.split('|').next().unwrap_or(file_id);
    let chars: Vec<char> = path.chars().collect();
    if chars.len() <= 48 {
        path.to_string()
    } else {
        let tail: String = chars[chars.len() - 45..].iter().collect();
        format!("...{}", tail)
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

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

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
