//! # airq CLI (`airq`)
//!
//! The `airq` binary drives the ingestion pipeline: it lists sensor CSV
//! exports in object storage, streams them through validation and
//! transformation, and delivers each row to the telemetry API exactly once
//! per content.
//!
//! ## Usage
//!
//! ```bash
//! airq --config ./config/airq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `airq init` | Create the SQLite reservation database |
//! | `airq list` | Show candidate files, oldest first, with fingerprints |
//! | `airq run` | Run one polling cycle (`--dry-run` to validate only) |
//! | `airq watch` | Poll on an interval until Ctrl-C |
//! | `airq stats` | Show reservation counts and recent per-file stats |
//!
//! ## Examples
//!
//! ```bash
//! # Create the database
//! airq init --config ./config/airq.toml
//!
//! # Check what would be sent for last week's uploads
//! airq run --dry-run --since 2024-03-01 --until 2024-03-07
//!
//! # Keep ingesting every 5 minutes
//! airq watch --interval 300
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use airq_ingest::pipeline::CycleFilter;
use airq_ingest::progress::ProgressMode;
use airq_ingest::{commands, config, logging, migrate, stats};

/// airq: streaming air-quality CSV ingestion.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/airq.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "airq",
    about = "Stream sensor CSV exports from object storage into the telemetry API",
    version,
    long_about = "airq discovers CSV exports in S3 (or a local directory), validates and \
    transforms each row into a telemetry payload, and delivers it to the ingestion API \
    exactly once per content, using a SQLite reservation store that survives restarts."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/airq.toml`.
    #[arg(long, global = true, default_value = "./config/airq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the reservation database.
    ///
    /// Creates the SQLite file and its tables. Running it again is safe.
    Init,

    /// List candidate files.
    ///
    /// Prints the files the next run would consider, oldest first, with
    /// their size, modification time, device, and fingerprint.
    List,

    /// Run one polling cycle.
    ///
    /// Processes every candidate file. Rows already reserved by an earlier
    /// run are skipped, so re-running is safe.
    Run {
        /// Validate and transform only; reserve and send nothing.
        #[arg(long)]
        dry_run: bool,

        /// Only process files modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only process files modified on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress on stderr: `off`, `human`, or `json`. Defaults to
        /// `human` on a terminal, otherwise `off`.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Poll for new files until interrupted.
    Watch {
        /// Seconds between cycles. Overrides `[poll] interval_secs`.
        #[arg(long)]
        interval: Option<u64>,

        /// Progress on stderr: `off`, `human`, or `json`.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Show delivery statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::List => {
            commands::run_list(&cfg).await?;
        }
        Commands::Run {
            dry_run,
            since,
            until,
            limit,
            progress,
        } => {
            let filter = CycleFilter::parse(since.as_deref(), until.as_deref(), limit)?;
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_once(&cfg, &filter, dry_run, progress).await?;
        }
        Commands::Watch { interval, progress } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_watch(&cfg, interval, progress).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
