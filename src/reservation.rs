//! Durable per-row work claims.
//!
//! The [`ReservationStore`] is the pipeline's exactly-once boundary: a row is
//! only sent after `reserve` returns `true`, and at most one reservation can
//! exist per `(file_id, row_index)`. Whether a `failed` reservation may be
//! claimed again by a later run is the store's policy (`reclaim_failed`),
//! not the sender's.
//!
//! Two implementations:
//! - [`SqliteReservationStore`]: the production store, survives restarts.
//! - [`InMemoryReservationStore`]: process-local, for tests and dry runs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{ProcessingStats, RowStatus};

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Claim `(file_id, row_index)`. `Ok(false)` means someone already holds
    /// it; nothing is changed in that case.
    async fn reserve(&self, file_id: &str, row_index: u64, payload_hash: &str) -> Result<bool>;

    /// Record the outcome of a claimed row.
    async fn update_status(
        &self,
        file_id: &str,
        row_index: u64,
        status: RowStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Persist the final counters for one file.
    async fn record_file_stats(
        &self,
        file_id: &str,
        stats: &ProcessingStats,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// A stored claim, as read back for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowReservation {
    pub file_id: String,
    pub row_index: u64,
    pub payload_hash: String,
    pub status: RowStatus,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Persisted per-file outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatsRecord {
    pub file_id: String,
    pub stats: ProcessingStats,
    pub completed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryReservationStore {
    rows: Mutex<HashMap<(String, u64), RowReservation>>,
    files: Mutex<HashMap<String, FileStatsRecord>>,
    reclaim_failed: bool,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reclaim_failed(reclaim_failed: bool) -> Self {
        Self {
            reclaim_failed,
            ..Self::default()
        }
    }

    pub fn reservation(&self, file_id: &str, row_index: u64) -> Option<RowReservation> {
        self.rows
            .lock()
            .ok()?
            .get(&(file_id.to_string(), row_index))
            .cloned()
    }

    pub fn file_stats(&self, file_id: &str) -> Option<FileStatsRecord> {
        self.files.lock().ok()?.get(file_id).cloned()
    }

    pub fn reservation_count(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn reserve(&self, file_id: &str, row_index: u64, payload_hash: &str) -> Result<bool> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow!("reservation map poisoned"))?;

        match rows.entry((file_id.to_string(), row_index)) {
            Entry::Vacant(slot) => {
                slot.insert(RowReservation {
                    file_id: file_id.to_string(),
                    row_index,
                    payload_hash: payload_hash.to_string(),
                    status: RowStatus::Reserved,
                    error: None,
                    attempts: 1,
                });
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if self.reclaim_failed && existing.status == RowStatus::Failed {
                    existing.status = RowStatus::Reserved;
                    existing.payload_hash = payload_hash.to_string();
                    existing.error = None;
                    existing.attempts += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn update_status(
        &self,
        file_id: &str,
        row_index: u64,
        status: RowStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow!("reservation map poisoned"))?;
        let existing = rows
            .get_mut(&(file_id.to_string(), row_index))
            .ok_or_else(|| anyhow!("no reservation for {} row {}", file_id, row_index))?;
        existing.status = status;
        existing.error = error.map(str::to_string);
        Ok(())
    }

    async fn record_file_stats(
        &self,
        file_id: &str,
        stats: &ProcessingStats,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow!("file stats map poisoned"))?;
        files.insert(
            file_id.to_string(),
            FileStatsRecord {
                file_id: file_id.to_string(),
                stats: *stats,
                completed_at,
            },
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite store
// ═══════════════════════════════════════════════════════════════════════

/// Reservation store backed by the `row_reservations` and `file_stats`
/// tables (see [`crate::migrate`]).
#[derive(Clone)]
pub struct SqliteReservationStore {
    pool: SqlitePool,
    reclaim_failed: bool,
}

impl SqliteReservationStore {
    pub fn new(pool: SqlitePool, reclaim_failed: bool) -> Self {
        Self {
            pool,
            reclaim_failed,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn reservation(&self, file_id: &str, row_index: u64) -> Result<Option<RowReservation>> {
        let row = sqlx::query(
            "SELECT payload_hash, status, error, attempts FROM row_reservations WHERE file_id = ? AND row_index = ?",
        )
        .bind(file_id)
        .bind(row_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<RowReservation> {
            let status: String = row.get("status");
            Ok(RowReservation {
                file_id: file_id.to_string(),
                row_index,
                payload_hash: row.get("payload_hash"),
                status: RowStatus::parse(&status)
                    .ok_or_else(|| anyhow!("unknown reservation status '{}'", status))?,
                error: row.get("error"),
                attempts: row.get::<i64, _>("attempts") as u32,
            })
        })
        .transpose()
    }

    /// Most recently completed files first.
    pub async fn recent_file_stats(&self, limit: i64) -> Result<Vec<FileStatsRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT file_id, total_rows, successful_rows, failed_rows, skipped_rows, completed_at
            FROM file_stats
            ORDER BY completed_at DESC, file_id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FileStatsRecord {
                file_id: row.get("file_id"),
                stats: ProcessingStats {
                    total_rows: row.get::<i64, _>("total_rows") as u64,
                    successful_rows: row.get::<i64, _>("successful_rows") as u64,
                    failed_rows: row.get::<i64, _>("failed_rows") as u64,
                    skipped_rows: row.get::<i64, _>("skipped_rows") as u64,
                },
                completed_at: DateTime::from_timestamp(row.get("completed_at"), 0)
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Reservation counts per status.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM row_reservations GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("status"), row.get("n")))
            .collect())
    }
}

#[async_trait]
impl ReservationStore for SqliteReservationStore {
    async fn reserve(&self, file_id: &str, row_index: u64, payload_hash: &str) -> Result<bool> {
        let now = Utc::now().timestamp();

        let inserted = sqlx::query(
            r#"
            INSERT INTO row_reservations (file_id, row_index, payload_hash, status, error, attempts, reserved_at, updated_at)
            VALUES (?, ?, ?, 'reserved', NULL, 1, ?, ?)
            ON CONFLICT(file_id, row_index) DO NOTHING
            "#,
        )
        .bind(file_id)
        .bind(row_index as i64)
        .bind(payload_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(true);
        }
        if !self.reclaim_failed {
            return Ok(false);
        }

        // Single statement, so two runs racing for the same failed row cannot both win
        let reclaimed = sqlx::query(
            r#"
            UPDATE row_reservations
            SET status = 'reserved', payload_hash = ?, error = NULL,
                attempts = attempts + 1, updated_at = ?
            WHERE file_id = ? AND row_index = ? AND status = 'failed'
            "#,
        )
        .bind(payload_hash)
        .bind(now)
        .bind(file_id)
        .bind(row_index as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(reclaimed == 1)
    }

    async fn update_status(
        &self,
        file_id: &str,
        row_index: u64,
        status: RowStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE row_reservations SET status = ?, error = ?, updated_at = ? WHERE file_id = ? AND row_index = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(file_id)
        .bind(row_index as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(anyhow!("no reservation for {} row {}", file_id, row_index));
        }
        Ok(())
    }

    async fn record_file_stats(
        &self,
        file_id: &str,
        stats: &ProcessingStats,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_stats (file_id, total_rows, successful_rows, failed_rows, skipped_rows, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                total_rows = excluded.total_rows,
                successful_rows = excluded.successful_rows,
                failed_rows = excluded.failed_rows,
                skipped_rows = excluded.skipped_rows,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(file_id)
        .bind(stats.total_rows as i64)
        .bind(stats.successful_rows as i64)
        .bind(stats.failed_rows as i64)
        .bind(stats.skipped_rows as i64)
        .bind(completed_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
