//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the files, rows, and payloads that flow from object
//! storage through validation and transformation to the remote API.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One object in the bucket, as reported by the lister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFile {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Identity of one byte-for-byte version of a file.
///
/// Two fingerprints are equal iff path, size and modification time are all
/// unchanged. The `fingerprint` string doubles as the `fileId` of every row
/// reservation taken for this version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileFingerprint {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub fingerprint: String,
}

/// Optional sensor columns carried through to the payload when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Pm1,
    Pm10,
    Temperature,
    Humidity,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Pm1,
        Metric::Pm10,
        Metric::Temperature,
        Metric::Humidity,
    ];

    /// CSV header naming this metric.
    pub fn column(self) -> &'static str {
        match self {
            Metric::Pm1 => "PM1",
            Metric::Pm10 => "PM10",
            Metric::Temperature => "Temperature",
            Metric::Humidity => "Humidity",
        }
    }

    /// Key under `metrics` in the outgoing payload.
    pub fn key(self) -> &'static str {
        match self {
            Metric::Pm1 => "pm1",
            Metric::Pm10 => "pm10",
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A CSV data row that passed schema validation.
///
/// Only the validator constructs these. `row_index` is 1-based and strictly
/// increasing within a file; rows dropped during validation still consume
/// their index so indices stay stable across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub file_id: String,
    pub row_index: u64,
    pub timestamp: DateTime<Utc>,
    /// Trimmed `PM2.5` cell; numeric parsing happens in the transformer.
    pub pm25: String,
    /// Non-empty trimmed optional cells present in this row.
    pub optional: BTreeMap<Metric, String>,
}

/// Canonical telemetry payload posted to the ingestion API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub device_id: String,
    pub mission_id: String,
    /// ISO-8601 UTC with millisecond precision, e.g. `2024-01-01T00:00:00.000Z`.
    pub ts: String,
    pub metrics: BTreeMap<String, f64>,
}

/// A transformed row ready for the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub file_id: String,
    pub row_index: u64,
    pub payload: Payload,
    pub payload_hash: String,
    pub idempotency_key: String,
}

/// Lifecycle state of one row reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Reserved,
    Success,
    Failed,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Reserved => "reserved",
            RowStatus::Success => "success",
            RowStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(RowStatus::Reserved),
            "success" => Some(RowStatus::Success),
            "failed" => Some(RowStatus::Failed),
            _ => None,
        }
    }
}

/// Per-file counters over rows that reached the sender.
///
/// Invariant: `total_rows == successful_rows + failed_rows + skipped_rows`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub total_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
    pub skipped_rows: u64,
}

impl ProcessingStats {
    pub fn absorb(&mut self, other: &ProcessingStats) {
        self.total_rows += other.total_rows;
        self.successful_rows += other.successful_rows;
        self.failed_rows += other.failed_rows;
        self.skipped_rows += other.skipped_rows;
    }
}
