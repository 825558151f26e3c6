use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::io::ReaderStream;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::listing::{ByteStream, ObjectStore};
use crate::models::StorageFile;

/// A directory tree treated as a bucket. Object paths are `/`-separated and
/// relative to `root`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        if path.split('/').any(|seg| seg == "..") {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn kind(&self) -> &str {
        "local"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageFile>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || walk(&root, &prefix))
            .await
            .map_err(|e| StorageError::Transport(format!("listing task failed: {}", e)))?
    }

    async fn download(&self, path: &str) -> Result<ByteStream, StorageError> {
        let full = self.resolve(path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }
}

fn walk(root: &Path, prefix: &str) -> Result<Vec<StorageFile>, StorageError> {
    if !root.exists() {
        return Err(StorageError::Config(format!(
            "local storage root does not exist: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| StorageError::Transport(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        // An unknown mtime would sort the file first and fix a bogus fingerprint.
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %key, error = %e, "skipping file without a modification time");
                continue;
            }
        };

        files.push(StorageFile {
            path: key,
            size: metadata.len(),
            last_modified: DateTime::<Utc>::from(modified),
        });
    }

    Ok(files)
}
