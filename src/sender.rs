//! Batched delivery of prepared rows.
//!
//! # Lifecycle
//!
//! ```text
//! accumulating ──(buffer full)──▶ flushing ──▶ accumulating ──▶ …
//!       │
//!       └──(end of stream)──▶ draining ──▶ finalized (stats persisted)
//! ```
//!
//! [`BatchedSender::push`] does not return while a full batch is being
//! flushed, so the producer upstream (download → parse → transform) is held
//! back until the batch settles. The buffer therefore never holds more than
//! `batch_size` rows, and batches are strictly sequential.
//!
//! Inside a flush every row is handled concurrently:
//!
//! 1. `reserve(file_id, row_index, payload_hash)`; a refusal counts the row
//!    as skipped and makes no network call.
//! 2. `POST` the payload with its idempotency key.
//! 3. Mark the reservation `success`, or `failed` with the reason.
//!
//! A row that errors or panics only affects its own outcome. Failed rows are
//! not retried within the run.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::api::IngestApi;
use crate::error::IngestError;
use crate::models::{PreparedRow, ProcessingStats, RowStatus};
use crate::reservation::ReservationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Sent,
    Failed,
    Skipped,
}

pub struct BatchedSender {
    store: Arc<dyn ReservationStore>,
    api: Arc<dyn IngestApi>,
    file_id: String,
    batch_size: usize,
    buffer: Vec<PreparedRow>,
    stats: ProcessingStats,
}

impl BatchedSender {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        api: Arc<dyn IngestApi>,
        file_id: &str,
        batch_size: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            api,
            file_id: file_id.to_string(),
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            stats: ProcessingStats::default(),
        }
    }

    /// Queue a row, flushing first if that fills the batch.
    pub async fn push(&mut self, row: PreparedRow) {
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Deliver everything currently buffered and wait for every row to settle.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));

        // Set once this run holds the row's claim; survives a panic in `deliver`.
        let claimed: Vec<AtomicBool> = batch.iter().map(|_| AtomicBool::new(false)).collect();

        let settled = join_all(
            batch
                .iter()
                .zip(&claimed)
                .map(|(row, claim)| AssertUnwindSafe(self.deliver(row, claim)).catch_unwind()),
        )
        .await;

        for ((row, claim), result) in batch.iter().zip(&claimed).zip(settled) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    let held = claim.load(Ordering::SeqCst);
                    error!(
                        file_id = %row.file_id,
                        row_index = row.row_index,
                        claim_held = held,
                        "row delivery panicked"
                    );
                    if held {
                        self.mark_failed(row, "delivery panicked").await;
                    }
                    RowOutcome::Failed
                }
            };
            self.tally(outcome);
        }
    }

    /// Drain the buffer and persist this file's counters.
    pub async fn finish(mut self) -> Result<ProcessingStats, IngestError> {
        self.flush().await;
        self.store
            .record_file_stats(&self.file_id, &self.stats, Utc::now())
            .await
            .map_err(IngestError::Store)?;
        Ok(self.stats)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats
    }

    fn tally(&mut self, outcome: RowOutcome) {
        self.stats.total_rows += 1;
        match outcome {
            RowOutcome::Sent => self.stats.successful_rows += 1,
            RowOutcome::Failed => self.stats.failed_rows += 1,
            RowOutcome::Skipped => self.stats.skipped_rows += 1,
        }
    }

    async fn mark_failed(&self, row: &PreparedRow, reason: &str) {
        if let Err(e) = self
            .store
            .update_status(&row.file_id, row.row_index, RowStatus::Failed, Some(reason))
            .await
        {
            warn!(
                file_id = %row.file_id,
                row_index = row.row_index,
                error = %format!("{e:#}"),
                "could not record row status"
            );
        }
    }

    /// Reserve, send, and record one row. `claimed` is raised as soon as
    /// the reservation is won.
    async fn deliver(&self, row: &PreparedRow, claimed: &AtomicBool) -> RowOutcome {
        match self
            .store
            .reserve(&row.file_id, row.row_index, &row.payload_hash)
            .await
        {
            Ok(true) => claimed.store(true, Ordering::SeqCst),
            Ok(false) => {
                debug!(
                    file_id = %row.file_id,
                    row_index = row.row_index,
                    "row already reserved, skipping"
                );
                return RowOutcome::Skipped;
            }
            Err(e) => {
                warn!(
                    file_id = %row.file_id,
                    row_index = row.row_index,
                    error = %format!("{e:#}"),
                    "could not reserve row"
                );
                return RowOutcome::Failed;
            }
        }

        let (status, reason, outcome) = match self.api.send(&row.payload, &row.idempotency_key).await
        {
            Ok(()) => (RowStatus::Success, None, RowOutcome::Sent),
            Err(e) => {
                warn!(
                    file_id = %row.file_id,
                    row_index = row.row_index,
                    error = %e,
                    "send failed"
                );
                (RowStatus::Failed, Some(e.to_string()), RowOutcome::Failed)
            }
        };

        if let Err(e) = self
            .store
            .update_status(&row.file_id, row.row_index, status, reason.as_deref())
            .await
        {
            warn!(
                file_id = %row.file_id,
                row_index = row.row_index,
                error = %format!("{e:#}"),
                "could not record row status"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::models::Payload;
    use crate::reservation::InMemoryReservationStore;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn prepared(row_index: u64) -> PreparedRow {
        let payload = Payload {
            device_id: "dev1".to_string(),
            mission_id: "mission-7".to_string(),
            ts: format!("2024-01-01T00:00:{:02}.000Z", row_index),
            metrics: BTreeMap::from([("pm25".to_string(), row_index as f64)]),
        };
        PreparedRow {
            file_id: "file-1".to_string(),
            row_index,
            payload_hash: crate::transform::payload_hash(&payload),
            idempotency_key: crate::transform::idempotency_key(&payload),
            payload,
        }
    }

    /// Records sends; fails or panics on selected row timestamps.
    #[derive(Default)]
    struct ScriptedApi {
        fail: HashSet<String>,
        panic: HashSet<String>,
        sent: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedApi {
        fn failing(row: u64) -> Self {
            Self {
                fail: HashSet::from([prepared(row).idempotency_key]),
                ..Self::default()
            }
        }

        fn panicking(row: u64) -> Self {
            Self {
                panic: HashSet::from([prepared(row).idempotency_key]),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IngestApi for ScriptedApi {
        async fn send(&self, _payload: &Payload, key: &str) -> Result<(), SendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic.contains(key) {
                panic!("simulated crash for {key}");
            }
            if self.fail.contains(key) {
                return Err(SendError::Rejected {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            self.sent.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn accounts_success_failure_and_skip() {
        let store = Arc::new(InMemoryReservationStore::new());
        // Row 3 is already held by a concurrent run
        store.reserve("file-1", 3, "other").await.unwrap();
        let api = Arc::new(ScriptedApi::failing(2));

        let mut sender = BatchedSender::new(store.clone(), api.clone(), "file-1", 10);
        for i in 1..=3 {
            sender.push(prepared(i)).await;
        }
        let stats = sender.finish().await.unwrap();

        assert_eq!(
            stats,
            ProcessingStats {
                total_rows: 3,
                successful_rows: 1,
                failed_rows: 1,
                skipped_rows: 1,
            }
        );
        assert_eq!(api.sent(), vec![prepared(1).idempotency_key]);

        assert_eq!(store.reservation("file-1", 1).unwrap().status, RowStatus::Success);
        let failed = store.reservation("file-1", 2).unwrap();
        assert_eq!(failed.status, RowStatus::Failed);
        assert!(failed.error.unwrap().contains("503"));
        assert_eq!(store.reservation("file-1", 3).unwrap().payload_hash, "other");

        let recorded = store.file_stats("file-1").unwrap();
        assert_eq!(recorded.stats, stats);
    }

    #[tokio::test]
    async fn second_pass_skips_without_sending() {
        let store = Arc::new(InMemoryReservationStore::new());
        let first = Arc::new(ScriptedApi::default());
        let mut sender = BatchedSender::new(store.clone(), first.clone(), "file-1", 2);
        sender.push(prepared(1)).await;
        sender.finish().await.unwrap();
        assert_eq!(first.sent().len(), 1);

        let second = Arc::new(ScriptedApi::default());
        let mut sender = BatchedSender::new(store, second.clone(), "file-1", 2);
        sender.push(prepared(1)).await;
        let stats = sender.finish().await.unwrap();

        assert_eq!(stats.skipped_rows, 1);
        assert_eq!(stats.total_rows, 1);
        assert!(second.sent().is_empty());
    }

    #[tokio::test]
    async fn panicking_row_does_not_sink_its_batch() {
        let store = Arc::new(InMemoryReservationStore::new());
        let api = Arc::new(ScriptedApi::panicking(2));

        let mut sender = BatchedSender::new(store.clone(), api.clone(), "file-1", 3);
        for i in 1..=3 {
            sender.push(prepared(i)).await;
        }
        let stats = sender.finish().await.unwrap();

        assert_eq!(stats.successful_rows, 2);
        assert_eq!(stats.failed_rows, 1);
        let mut sent = api.sent();
        sent.sort();
        assert_eq!(
            sent,
            vec![prepared(1).idempotency_key, prepared(3).idempotency_key]
        );
        assert_eq!(store.reservation("file-1", 2).unwrap().status, RowStatus::Failed);
    }

    /// Delegates to an in-memory store but panics inside `reserve` for one row.
    struct PanickingReserve {
        inner: InMemoryReservationStore,
        row_index: u64,
    }

    #[async_trait]
    impl ReservationStore for PanickingReserve {
        async fn reserve(
            &self,
            file_id: &str,
            row_index: u64,
            payload_hash: &str,
        ) -> anyhow::Result<bool> {
            if row_index == self.row_index {
                panic!("store crashed while reserving row {row_index}");
            }
            self.inner.reserve(file_id, row_index, payload_hash).await
        }

        async fn update_status(
            &self,
            file_id: &str,
            row_index: u64,
            status: RowStatus,
            error: Option<&str>,
        ) -> anyhow::Result<()> {
            self.inner
                .update_status(file_id, row_index, status, error)
                .await
        }

        async fn record_file_stats(
            &self,
            file_id: &str,
            stats: &ProcessingStats,
            completed_at: chrono::DateTime<Utc>,
        ) -> anyhow::Result<()> {
            self.inner
                .record_file_stats(file_id, stats, completed_at)
                .await
        }
    }

    #[tokio::test]
    async fn panic_before_claim_leaves_other_runs_reservation_alone() {
        let store = Arc::new(PanickingReserve {
            inner: InMemoryReservationStore::new(),
            row_index: 2,
        });
        // Row 2 is held by a concurrent run that is still sending it
        store.inner.reserve("file-1", 2, "other").await.unwrap();
        let api = Arc::new(ScriptedApi::default());

        let mut sender = BatchedSender::new(store.clone(), api.clone(), "file-1", 3);
        for i in 1..=3 {
            sender.push(prepared(i)).await;
        }
        let stats = sender.finish().await.unwrap();

        assert_eq!(stats.successful_rows, 2);
        assert_eq!(stats.failed_rows, 1);
        let held = store.inner.reservation("file-1", 2).unwrap();
        assert_eq!(held.status, RowStatus::Reserved);
        assert_eq!(held.payload_hash, "other");
        assert_eq!(held.error, None);
    }

    #[tokio::test]
    async fn buffer_and_concurrency_stay_within_batch_size() {
        let store = Arc::new(InMemoryReservationStore::new());
        let api = Arc::new(ScriptedApi::default());
        let mut sender = BatchedSender::new(store, api.clone(), "file-1", 4);

        for i in 1..=22 {
            sender.push(prepared(i)).await;
            assert!(sender.buffered() < 4);
        }
        assert_eq!(sender.buffered(), 2);
        assert_eq!(sender.stats().total_rows, 20);

        let stats = sender.finish().await.unwrap();
        assert_eq!(stats.total_rows, 22);
        assert_eq!(stats.successful_rows, 22);
        let peak = api.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak in-flight sends was {peak}");
        assert!(peak > 1, "rows in a batch should be sent concurrently");
    }

    #[tokio::test]
    async fn finish_with_nothing_buffered_still_records_stats() {
        let store = Arc::new(InMemoryReservationStore::new());
        let sender = BatchedSender::new(store.clone(), Arc::new(ScriptedApi::default()), "empty", 5);
        let stats = sender.finish().await.unwrap();
        assert_eq!(stats, ProcessingStats::default());
        assert!(store.file_stats("empty").is_some());
    }
}
