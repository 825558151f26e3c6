//! Validated rows → canonical telemetry payloads.
//!
//! The transformer is built once per file for a single device. A device with
//! no sensor mapping is refused at construction: the file cannot be
//! processed until the mapping exists.
//!
//! Each payload carries two identities:
//! - **payload hash**: SHA-256 of the payload's JSON with object keys sorted,
//!   so the same logical content always hashes the same.
//! - **idempotency key**: `"{device_id}|{mission_id}|{ts}"`, the time slot
//!   the remote API deduplicates on.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::{MetricsConfig, SensorMap};
use crate::error::IngestError;
use crate::models::{CsvRow, Metric, Payload, PreparedRow};

#[derive(Debug, Clone)]
pub struct PayloadTransformer {
    device_id: String,
    mission_id: String,
    metrics: MetricsConfig,
}

impl PayloadTransformer {
    pub fn new(
        device_id: &str,
        sensors: &SensorMap,
        metrics: MetricsConfig,
    ) -> Result<Self, IngestError> {
        let sensor_id = sensors
            .sensor_for(device_id)
            .ok_or_else(|| IngestError::UnmappedDevice(device_id.to_string()))?;

        Ok(Self {
            device_id: device_id.to_string(),
            mission_id: format!("mission-{}", sensor_id),
            metrics,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn mission_id(&self) -> &str {
        &self.mission_id
    }

    /// Build the payload for `row`, or `None` when `PM2.5` is not a finite
    /// number.
    pub fn transform(&self, row: &CsvRow) -> Option<PreparedRow> {
        let Some(pm25) = parse_finite(&row.pm25) else {
            warn!(
                file_id = %row.file_id,
                row_index = row.row_index,
                value = %row.pm25,
                "dropping row: PM2.5 is not a finite number"
            );
            return None;
        };

        let mut metrics = BTreeMap::new();
        metrics.insert("pm25".to_string(), pm25);
        for (metric, raw) in &row.optional {
            if !self.metrics.is_enabled(*metric) {
                continue;
            }
            if let Some(value) = parse_finite(raw) {
                metrics.insert(metric.key().to_string(), value);
            }
        }

        let payload = Payload {
            device_id: self.device_id.clone(),
            mission_id: self.mission_id.clone(),
            ts: row.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            metrics,
        };

        Some(PreparedRow {
            file_id: row.file_id.clone(),
            row_index: row.row_index,
            payload_hash: payload_hash(&payload),
            idempotency_key: idempotency_key(&payload),
            payload,
        })
    }

    /// Metrics this transformer forwards in addition to `pm25`.
    pub fn enabled_metrics(&self) -> Vec<Metric> {
        Metric::ALL
            .into_iter()
            .filter(|m| self.metrics.is_enabled(*m))
            .collect()
    }
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// SHA-256 (hex) over the payload's canonical JSON.
pub fn payload_hash(payload: &Payload) -> String {
    // Serializing a plain struct with string keys cannot fail
    let value = serde_json::to_value(payload).unwrap_or(Value::Null);
    hash_value(&value)
}

/// SHA-256 (hex) over `value` serialized with every object's keys sorted.
pub fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys in lexicographic order at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}

pub fn idempotency_key(payload: &Payload) -> String {
    format!("{}|{}|{}", payload.device_id, payload.mission_id, payload.ts)
}
