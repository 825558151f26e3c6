//! Ingestion pipeline orchestration.
//!
//! Coordinates one polling cycle: list → filter → per file
//! (download → validate → transform → send) → summary. Files are processed
//! sequentially, oldest first, and a failure in one file never stops the
//! cycle. Within a file everything is pull-based: the CSV reader only asks
//! the download stream for more bytes when the sender has accepted the
//! previous row, so memory use is bounded by one batch.
//!
//! `watch` repeats the cycle on a fixed interval until Ctrl-C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::NaiveDate;
use tokio_util::io::StreamReader;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::{HttpIngestApi, IngestApi};
use crate::config::{Config, PipelineConfig, SensorMap};
use crate::db;
use crate::error::IngestError;
use crate::listing::{ByteStream, Lister, ObjectStore};
use crate::migrate;
use crate::models::{FileFingerprint, ProcessingStats, StorageFile};
use crate::progress::{CycleProgressEvent, ProgressReporter};
use crate::reservation::{ReservationStore, SqliteReservationStore};
use crate::sender::BatchedSender;
use crate::storage_fs::LocalStore;
use crate::storage_s3::S3Store;
use crate::transform::PayloadTransformer;
use crate::validate::RowReader;

/// Outcome of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub fingerprint: FileFingerprint,
    pub stats: ProcessingStats,
    /// Rows that failed validation or transformation. Not part of `stats`.
    pub dropped_rows: u64,
}

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub run_id: String,
    pub candidates: usize,
    pub processed: usize,
    pub failed: usize,
    pub stats: ProcessingStats,
    pub dropped_rows: u64,
}

/// Optional narrowing of a cycle's candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleFilter {
    /// Only files last modified on or after this day (UTC).
    pub since: Option<NaiveDate>,
    /// Only files last modified on or before this day (UTC).
    pub until: Option<NaiveDate>,
    /// Process at most this many files, oldest first.
    pub limit: Option<usize>,
}

impl CycleFilter {
    /// Build from CLI strings (`YYYY-MM-DD`).
    pub fn parse(since: Option<&str>, until: Option<&str>, limit: Option<usize>) -> Result<Self> {
        let day = |s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
        };
        let filter = Self {
            since: since.map(day).transpose()?,
            until: until.map(day).transpose()?,
            limit,
        };
        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since > until {
                bail!("--since {} is after --until {}", since, until);
            }
        }
        Ok(filter)
    }

    pub fn apply(&self, files: &mut Vec<StorageFile>) {
        if let Some(since) = self.since {
            files.retain(|f| f.last_modified.date_naive() >= since);
        }
        if let Some(until) = self.until {
            files.retain(|f| f.last_modified.date_naive() <= until);
        }
        if let Some(limit) = self.limit {
            files.truncate(limit);
        }
    }
}

/// Where prepared rows go: the reservation store and the remote API.
#[derive(Clone)]
pub struct Delivery {
    pub reservations: Arc<dyn ReservationStore>,
    pub api: Arc<dyn IngestApi>,
}

impl Delivery {
    /// SQLite reservations at `[db] path` and the HTTP API from `[api]`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let reservations = SqliteReservationStore::new(pool, config.db.reclaim_failed);
        let api = HttpIngestApi::new(&config.api)?;
        Ok(Self {
            reservations: Arc::new(reservations),
            api: Arc::new(api),
        })
    }
}

/// Whether a cycle sends or only validates and transforms.
#[derive(Clone, Copy)]
pub enum RunMode<'a> {
    DryRun,
    Deliver(&'a Delivery),
}

/// Build the object store selected by `[storage] kind`.
pub fn open_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.kind.as_str() {
        "s3" => {
            let s3 = config
                .storage
                .s3
                .clone()
                .context("[storage.s3] section is required when kind = \"s3\"")?;
            Ok(Arc::new(S3Store::new(s3)?))
        }
        "local" => {
            let local = config
                .storage
                .local
                .as_ref()
                .context("[storage.local] section is required when kind = \"local\"")?;
            Ok(Arc::new(LocalStore::new(local.root.clone())))
        }
        other => bail!("Unknown storage kind: '{}'. Available: s3, local", other),
    }
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    lister: Lister,
    sensors: SensorMap,
    settings: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        Ok(Self {
            store,
            lister: Lister::new(&config.storage.prefix, &config.storage.include_globs)?,
            sensors: config.sensors.clone(),
            settings: config.pipeline.clone(),
        })
    }

    /// Candidates, oldest first. Empty when listing fails.
    pub async fn candidates(&self) -> Vec<StorageFile> {
        self.lister.list_candidates(self.store.as_ref()).await
    }

    /// Device that produced `path`: the configured device, or else the
    /// file's parent directory name.
    pub fn device_for(&self, path: &str) -> Result<String, IngestError> {
        if let Some(ref device) = self.settings.device_id {
            return Ok(device.clone());
        }
        Path::new(path)
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| IngestError::UnknownDevice(path.to_string()))
    }

    /// Run one file end to end and persist its stats.
    pub async fn process_file(
        &self,
        file: &StorageFile,
        delivery: &Delivery,
    ) -> Result<FileReport, IngestError> {
        let fingerprint = file.fingerprint();
        let span = info_span!("file", path = %file.path, file_id = %fingerprint.fingerprint);

        async {
            let transformer = self.transformer_for(&file.path)?;
            let mut rows = self.open_rows(file, &fingerprint).await?;
            let mut sender = BatchedSender::new(
                delivery.reservations.clone(),
                delivery.api.clone(),
                &fingerprint.fingerprint,
                self.settings.batch_size,
            );

            let mut untransformable = 0u64;
            while let Some(row) = rows.next_row().await? {
                match transformer.transform(&row) {
                    Some(prepared) => sender.push(prepared).await,
                    None => untransformable += 1,
                }
            }

            let stats = sender.finish().await?;
            let dropped_rows = rows.dropped() + untransformable;
            info!(
                total = stats.total_rows,
                successful = stats.successful_rows,
                failed = stats.failed_rows,
                skipped = stats.skipped_rows,
                dropped = dropped_rows,
                "file complete"
            );

            Ok::<_, IngestError>(FileReport {
                fingerprint: fingerprint.clone(),
                stats,
                dropped_rows,
            })
        }
        .instrument(span)
        .await
    }

    /// Validate and transform one file without reserving or sending.
    /// `stats.total_rows` is the number of rows that would be sent.
    pub async fn preview_file(&self, file: &StorageFile) -> Result<FileReport, IngestError> {
        let fingerprint = file.fingerprint();
        let transformer = self.transformer_for(&file.path)?;
        let mut rows = self.open_rows(file, &fingerprint).await?;

        let mut stats = ProcessingStats::default();
        let mut untransformable = 0u64;
        while let Some(row) = rows.next_row().await? {
            match transformer.transform(&row) {
                Some(_) => stats.total_rows += 1,
                None => untransformable += 1,
            }
        }

        Ok(FileReport {
            dropped_rows: rows.dropped() + untransformable,
            fingerprint,
            stats,
        })
    }

    /// One polling cycle over the current candidates.
    pub async fn run_cycle(
        &self,
        filter: &CycleFilter,
        mode: RunMode<'_>,
        progress: &dyn ProgressReporter,
    ) -> CycleSummary {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("cycle", run_id = %run_id);

        async {
            progress.report(CycleProgressEvent::Listing {
                prefix: self.lister.prefix().to_string(),
            });
            let mut files = self.candidates().await;
            filter.apply(&mut files);

            let mut summary = CycleSummary {
                run_id: run_id.clone(),
                candidates: files.len(),
                ..CycleSummary::default()
            };
            info!(candidates = files.len(), "cycle started");

            let total = files.len() as u64;
            for (i, file) in files.iter().enumerate() {
                progress.report(CycleProgressEvent::Processing {
                    path: file.path.clone(),
                    n: i as u64 + 1,
                    total,
                });

                let result = match mode {
                    RunMode::DryRun => self.preview_file(file).await,
                    RunMode::Deliver(delivery) => self.process_file(file, delivery).await,
                };

                match result {
                    Ok(report) => {
                        summary.processed += 1;
                        summary.stats.absorb(&report.stats);
                        summary.dropped_rows += report.dropped_rows;
                        progress.report(CycleProgressEvent::FileDone {
                            path: file.path.clone(),
                            stats: report.stats,
                            dropped: report.dropped_rows,
                        });
                    }
                    Err(e) => {
                        summary.failed += 1;
                        if e.is_configuration() {
                            error!(path = %file.path, error = %e, "file skipped: configuration error");
                        } else {
                            warn!(path = %file.path, error = %e, "file aborted");
                        }
                        progress.report(CycleProgressEvent::FileFailed {
                            path: file.path.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }

            info!(
                processed = summary.processed,
                failed = summary.failed,
                total_rows = summary.stats.total_rows,
                successful_rows = summary.stats.successful_rows,
                "cycle finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Run a cycle every `interval` until Ctrl-C. A cycle in progress is
    /// allowed to finish.
    pub async fn watch(
        &self,
        interval: Duration,
        filter: &CycleFilter,
        mode: RunMode<'_>,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "watching for new files");
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("failed to listen for Ctrl-C")?;
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            self.run_cycle(filter, mode, progress).await;
        }
    }

    fn transformer_for(&self, path: &str) -> Result<PayloadTransformer, IngestError> {
        let device_id = self.device_for(path)?;
        PayloadTransformer::new(&device_id, &self.sensors, self.settings.metrics)
    }

    async fn open_rows(
        &self,
        file: &StorageFile,
        fingerprint: &FileFingerprint,
    ) -> Result<RowReader<StreamReader<ByteStream, Bytes>>, IngestError> {
        let stream = self
            .store
            .download(&file.path)
            .await
            .map_err(|source| IngestError::Download {
                path: file.path.clone(),
                source,
            })?;
        RowReader::open(StreamReader::new(stream), &fingerprint.fingerprint).await
    }
}
