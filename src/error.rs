//! Typed failures at the pipeline's component seams.
//!
//! Commands and the binary work in `anyhow::Result`; the errors here exist
//! where callers need to branch on the kind of failure (a missing object
//! versus a network blip, a rejected payload versus a dropped connection,
//! a file-level abort versus a row-level drop).

use thiserror::Error;

/// Failure talking to object storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("storage request for '{path}' failed with HTTP {status}")]
    Http { status: u16, path: String },
    #[error("storage transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Map an I/O error on `path` to the matching storage failure.
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Failure delivering one payload to the remote ingestion API.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("ingestion API rejected payload (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("ingestion API transport error: {0}")]
    Transport(String),
}

/// A failure that aborts processing of the current file.
///
/// Row-level problems never surface as an `IngestError`; they are logged
/// and the row is dropped.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("download failed for {path}: {source}")]
    Download {
        path: String,
        #[source]
        source: StorageError,
    },
    #[error("malformed CSV stream: {0}")]
    Csv(#[from] csv_async::Error),
    #[error("CSV header is missing required column '{0}'")]
    MissingColumn(String),
    #[error("cannot determine device for '{0}'")]
    UnknownDevice(String),
    #[error("device '{0}' has no sensor mapping; add it under [sensors]")]
    UnmappedDevice(String),
    #[error("reservation store error: {0:#}")]
    Store(anyhow::Error),
}

impl IngestError {
    /// Configuration errors indicate missing setup rather than a transient fault.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnmappedDevice(_) | Self::UnknownDevice(_))
    }
}
