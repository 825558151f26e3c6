//! Entry points for the `airq` subcommands that drive the pipeline.
//!
//! Each prints a short human-readable report to stdout ending in `ok`;
//! logs and progress go to stderr.

use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::pipeline::{open_object_store, CycleFilter, CycleSummary, Delivery, Pipeline, RunMode};
use crate::progress::{format_number, ProgressMode};

/// `airq list`: candidate files, oldest first.
pub async fn run_list(config: &Config) -> Result<()> {
    let pipeline = Pipeline::new(config, open_object_store(config)?)?;
    let files = pipeline.candidates().await;

    println!(
        "{:<48} {:>10}   {:<20}   {}",
        "PATH", "SIZE", "LAST MODIFIED", "DEVICE"
    );
    for file in &files {
        let device = pipeline
            .device_for(&file.path)
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "{:<48} {:>10}   {:<20}   {}",
            file.path,
            format_number(file.size),
            file.last_modified.format("%Y-%m-%d %H:%M:%S"),
            device
        );
        println!("  fingerprint: {}", file.fingerprint().fingerprint);
    }
    println!("{} candidate file(s)", files.len());
    Ok(())
}

/// `airq run`: one polling cycle.
pub async fn run_once(
    config: &Config,
    filter: &CycleFilter,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<()> {
    let pipeline = Pipeline::new(config, open_object_store(config)?)?;
    let reporter = progress.reporter();

    let summary = if dry_run {
        pipeline
            .run_cycle(filter, RunMode::DryRun, reporter.as_ref())
            .await
    } else {
        let delivery = Delivery::from_config(config).await?;
        pipeline
            .run_cycle(filter, RunMode::Deliver(&delivery), reporter.as_ref())
            .await
    };

    print_summary(&summary, dry_run);
    Ok(())
}

/// `airq watch`: poll until Ctrl-C.
pub async fn run_watch(
    config: &Config,
    interval_secs: Option<u64>,
    progress: ProgressMode,
) -> Result<()> {
    let pipeline = Pipeline::new(config, open_object_store(config)?)?;
    let delivery = Delivery::from_config(config).await?;
    let interval = Duration::from_secs(interval_secs.unwrap_or(config.poll.interval_secs).max(1));

    pipeline
        .watch(
            interval,
            &CycleFilter::default(),
            RunMode::Deliver(&delivery),
            progress.reporter().as_ref(),
        )
        .await?;
    println!("ok");
    Ok(())
}

fn print_summary(summary: &CycleSummary, dry_run: bool) {
    if dry_run {
        println!("run {} (dry-run)", summary.run_id);
    } else {
        println!("run {}", summary.run_id);
    }
    println!("  candidate files: {}", summary.candidates);
    println!("  files processed: {}", summary.processed);
    println!("  files failed: {}", summary.failed);
    if dry_run {
        println!("  rows to send: {}", summary.stats.total_rows);
    } else {
        println!("  rows total: {}", summary.stats.total_rows);
        println!("  rows sent: {}", summary.stats.successful_rows);
        println!("  rows failed: {}", summary.stats.failed_rows);
        println!("  rows skipped: {}", summary.stats.skipped_rows);
    }
    println!("  rows dropped: {}", summary.dropped_rows);
    println!("ok");
}
