//! Polling-cycle progress reporting.
//!
//! Reports what `airq run` is doing (listing, which file, how far through
//! the candidate set) so operators can follow a long backlog. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::ProcessingStats;

/// A single progress event for one polling cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleProgressEvent {
    /// Listing the bucket. Total unknown.
    Listing { prefix: String },
    /// File `n` of `total` is being processed.
    Processing { path: String, n: u64, total: u64 },
    /// A file finished; `dropped` rows never reached the sender.
    FileDone {
        path: String,
        stats: ProcessingStats,
        dropped: u64,
    },
    /// A file was aborted.
    FileFailed { path: String, error: String },
}

/// Reports cycle progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: CycleProgressEvent);
}

/// Human-friendly progress on stderr: "run  processing  3 / 1,204 files  dev1/a.csv".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: CycleProgressEvent) {
        let line = match &event {
            CycleProgressEvent::Listing { prefix } => {
                format!("run  listing '{}'...\n", prefix)
            }
            CycleProgressEvent::Processing { path, n, total } => format!(
                "run  processing  {} / {} files  {}\n",
                format_number(*n),
                format_number(*total),
                path
            ),
            CycleProgressEvent::FileDone {
                path,
                stats,
                dropped,
            } => format!(
                "run  done  {}  sent {}  failed {}  skipped {}  dropped {}\n",
                path,
                format_number(stats.successful_rows),
                format_number(stats.failed_rows),
                format_number(stats.skipped_rows),
                format_number(*dropped)
            ),
            CycleProgressEvent::FileFailed { path, error } => {
                format!("run  failed  {}  {}\n", path, error)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &CycleProgressEvent) -> serde_json::Value {
        match event {
            CycleProgressEvent::Listing { prefix } => serde_json::json!({
                "event": "progress",
                "phase": "listing",
                "prefix": prefix
            }),
            CycleProgressEvent::Processing { path, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "path": path,
                "n": n,
                "total": total
            }),
            CycleProgressEvent::FileDone {
                path,
                stats,
                dropped,
            } => serde_json::json!({
                "event": "file_done",
                "path": path,
                "total_rows": stats.total_rows,
                "successful_rows": stats.successful_rows,
                "failed_rows": stats.failed_rows,
                "skipped_rows": stats.skipped_rows,
                "dropped_rows": dropped
            }),
            CycleProgressEvent::FileFailed { path, error } => serde_json::json!({
                "event": "file_failed",
                "path": path,
                "error": error
            }),
        }
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: CycleProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: CycleProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
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

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}' (expected off, human, or json)",
                other
            )),
        }
    }
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

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
