//! Row validation over a streaming CSV reader.
//!
//! [`RowReader`] pulls one record at a time from any `AsyncRead`, so memory
//! stays flat regardless of file size. Every data row receives the next
//! 1-based `row_index` before it is checked; rows that fail the schema are
//! logged and skipped, including rows whose cells are not valid UTF-8. Only a
//! broken stream (I/O failure, unreadable or missing required header) aborts
//! the file.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord, StringRecord, Trim};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::warn;

use crate::error::IngestError;
use crate::models::{CsvRow, Metric};

pub const TIMESTAMP_COLUMN: &str = "Timestamp";
pub const PM25_COLUMN: &str = "PM2.5";

/// Why a single row was dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowRejection {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("unparseable Timestamp '{0}'")]
    BadTimestamp(String),
    #[error("{0} is not valid UTF-8")]
    NotUtf8(&'static str),
}

/// Header positions resolved once per file.
struct Columns {
    timestamp: usize,
    pm25: usize,
    optional: Vec<(Metric, usize)>,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Result<Self, IngestError> {
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim_start_matches('\u{feff}') == name)
        };

        let timestamp = position(TIMESTAMP_COLUMN)
            .ok_or_else(|| IngestError::MissingColumn(TIMESTAMP_COLUMN.to_string()))?;
        let pm25 = position(PM25_COLUMN)
            .ok_or_else(|| IngestError::MissingColumn(PM25_COLUMN.to_string()))?;
        let optional = Metric::ALL
            .iter()
            .filter_map(|m| position(m.column()).map(|idx| (*m, idx)))
            .collect();

        Ok(Self {
            timestamp,
            pm25,
            optional,
        })
    }
}

pub struct RowReader<R> {
    inner: AsyncReader<R>,
    file_id: String,
    columns: Columns,
    record: ByteRecord,
    next_index: u64,
    dropped: u64,
}

impl<R> RowReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read the header row and prepare to stream data rows for `file_id`.
    pub async fn open(reader: R, file_id: &str) -> Result<Self, IngestError> {
        let mut inner = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .create_reader(reader);

        let headers = inner.headers().await?.clone();
        let columns = Columns::resolve(&headers)?;

        Ok(Self {
            inner,
            file_id: file_id.to_string(),
            columns,
            record: ByteRecord::new(),
            next_index: 1,
            dropped: 0,
        })
    }

    /// Next valid row, or `None` at end of stream.
    pub async fn next_row(&mut self) -> Result<Option<CsvRow>, IngestError> {
        loop {
            if !self.inner.read_byte_record(&mut self.record).await? {
                return Ok(None);
            }

            let row_index = self.next_index;
            self.next_index += 1;

            match self.check(row_index) {
                Ok(row) => return Ok(Some(row)),
                Err(reason) => {
                    self.dropped += 1;
                    warn!(
                        file_id = %self.file_id,
                        row_index,
                        %reason,
                        "dropping invalid row"
                    );
                }
            }
        }
    }

    /// Rows skipped by schema validation so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Data rows read so far, valid or not.
    pub fn rows_read(&self) -> u64 {
        self.next_index - 1
    }

    /// Non-empty cell at `idx`, decoded as UTF-8.
    fn cell(&self, idx: usize, column: &'static str) -> Result<Option<&str>, RowRejection> {
        match self.record.get(idx).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| RowRejection::NotUtf8(column)),
        }
    }

    fn check(&self, row_index: u64) -> Result<CsvRow, RowRejection> {
        let raw_ts = self
            .cell(self.columns.timestamp, TIMESTAMP_COLUMN)?
            .ok_or(RowRejection::Missing(TIMESTAMP_COLUMN))?;
        let timestamp =
            parse_timestamp(raw_ts).ok_or_else(|| RowRejection::BadTimestamp(raw_ts.to_string()))?;
        let pm25 = self
            .cell(self.columns.pm25, PM25_COLUMN)?
            .ok_or(RowRejection::Missing(PM25_COLUMN))?;

        let mut optional = BTreeMap::new();
        for (metric, idx) in &self.columns.optional {
            if let Some(value) = self.cell(*idx, metric.column())? {
                optional.insert(*metric, value.to_string());
            }
        }

        Ok(CsvRow {
            file_id: self.file_id.clone(),
            row_index,
            timestamp,
            pm25: pm25.to_string(),
            optional,
        })
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a sensor timestamp. Zone-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn collect(csv: &'static str) -> (Vec<CsvRow>, u64) {
        let mut reader = RowReader::open(csv.as_bytes(), "file-1").await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = reader.next_row().await.unwrap() {
            rows.push(row);
        }
        (rows, reader.dropped())
    }

    #[tokio::test]
    async fn assigns_indices_and_drops_bad_rows() {
        let csv = "Timestamp,PM1,PM2.5,PM10,Temperature,Humidity\n\
                   2024-01-01T00:00:00Z,1,12.3,20,21.5,40\n\
                   bad,1,x,2,3,4\n\
                   2024-01-01T00:01:00Z,,13.1,,,\n";
        let (rows, dropped) = collect(csv).await;

        assert_eq!(dropped, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_index, 1);
        assert_eq!(rows[1].row_index, 3);
        assert_eq!(rows[0].file_id, "file-1");
        assert_eq!(rows[0].pm25, "12.3");
        assert_eq!(rows[0].optional.get(&Metric::Humidity).map(String::as_str), Some("40"));
        assert!(rows[1].optional.is_empty());
    }

    #[tokio::test]
    async fn trims_cells_and_headers() {
        let csv = " Timestamp , PM2.5 \n 2024-01-01 00:00:00 ,  7.5 \n";
        let (rows, dropped) = collect(csv).await;
        assert_eq!(dropped, 0);
        assert_eq!(rows[0].pm25, "7.5");
        assert_eq!(
            rows[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn short_rows_are_dropped_not_fatal() {
        let csv = "Timestamp,PM2.5\n2024-01-01T00:00:00Z\n2024-01-01T00:00:00Z,5\n";
        let (rows, dropped) = collect(csv).await;
        assert_eq!(dropped, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_index, 2);
    }

    #[tokio::test]
    async fn missing_required_header_aborts() {
        let result = RowReader::open("Timestamp,PM10\n2024-01-01T00:00:00Z,3\n".as_bytes(), "f").await;
        match result {
            Err(IngestError::MissingColumn(col)) => assert_eq!(col, "PM2.5"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected missing column"),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_row_is_dropped_and_reading_continues() {
        let bytes: &'static [u8] = b"Timestamp,PM2.5,Temperature\n\
            2024-01-01T00:00:00Z,5,21\n\
            2024-01-01T00:01:00Z,6,21\xb0C\n\
            2024-01-01T00:02:00Z,7,22\n";
        let mut reader = RowReader::open(bytes, "f").await.unwrap();

        let mut indices = Vec::new();
        while let Some(row) = reader.next_row().await.unwrap() {
            indices.push(row.row_index);
        }
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(reader.dropped(), 1);
        assert_eq!(reader.rows_read(), 3);
    }

    #[tokio::test]
    async fn unreadable_header_aborts() {
        let bytes: &'static [u8] = b"Timestamp,PM2.5\xff\n2024-01-01T00:00:00Z,1\n";
        assert!(matches!(
            RowReader::open(bytes, "f").await,
            Err(IngestError::Csv(_))
        ));
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T02:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 00:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024/01/01 00:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 00:00"), Some(expected));
        assert_eq!(parse_timestamp("bad"), None);
        assert_eq!(parse_timestamp(""), None);
    }
}
