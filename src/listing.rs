//! Candidate discovery and file identity.
//!
//! [`ObjectStore`] is the seam to the bucket (S3 or a local directory). The
//! lister filters what a store returns down to CSV candidates and orders them
//! oldest-to-newest by modification time, computed here rather than trusted
//! to the backend. A failed listing yields no candidates; the next poll
//! retries.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::models::{FileFingerprint, StorageFile};

/// File contents as a stream of chunks, never fully materialised.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Path-addressed object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend label for logs (`"s3"`, `"local"`).
    fn kind(&self) -> &str;

    /// Every object under `prefix`, in whatever order the backend returns.
    async fn list(&self, prefix: &str) -> Result<Vec<StorageFile>, StorageError>;

    /// Open `path` for streaming.
    async fn download(&self, path: &str) -> Result<ByteStream, StorageError>;
}

/// Identity of a file version. Pure; no I/O.
pub fn fingerprint(path: &str, size: u64, last_modified: DateTime<Utc>) -> FileFingerprint {
    FileFingerprint {
        path: path.to_string(),
        size,
        last_modified,
        fingerprint: format!("{}|{}|{}", path, size, last_modified.timestamp_millis()),
    }
}

impl StorageFile {
    pub fn fingerprint(&self) -> FileFingerprint {
        fingerprint(&self.path, self.size, self.last_modified)
    }
}

/// Filters and orders the objects a store reports.
pub struct Lister {
    prefix: String,
    include: GlobSet,
}

impl Lister {
    pub fn new(prefix: &str, include_globs: &[String]) -> Result<Self> {
        Ok(Self {
            prefix: prefix.to_string(),
            include: build_globset(include_globs)?,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// List candidate files oldest first. Listing errors are logged and
    /// produce an empty set.
    pub async fn list_candidates(&self, store: &dyn ObjectStore) -> Vec<StorageFile> {
        let objects = match store.list(&self.prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(
                    backend = store.kind(),
                    prefix = %self.prefix,
                    error = %e,
                    "listing failed; will retry on next poll"
                );
                return Vec::new();
            }
        };

        let seen = objects.len();
        let mut files: Vec<StorageFile> = objects
            .into_iter()
            .filter(|f| self.include.is_match(self.relative(&f.path)))
            .collect();

        sort_oldest_first(&mut files);
        debug!(seen, candidates = files.len(), "listed storage");
        files
    }

    fn relative<'a>(&self, path: &'a str) -> &'a str {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return path;
        }
        path.strip_prefix(prefix)
            .map(|s| s.trim_start_matches('/'))
            .unwrap_or(path)
    }
}

/// Chronological arrival order; path breaks ties so the order is total.
pub fn sort_oldest_first(files: &mut [StorageFile]) {
    files.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.path.cmp(&b.path))
    });
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedStore {
        files: Vec<StorageFile>,
    }

    #[async_trait]
    impl ObjectStore for FixedStore {
        fn kind(&self) -> &str {
            "fixed"
        }

        async fn list(&self, prefix: &str) -> Result<Vec<StorageFile>, StorageError> {
            Ok(self
                .files
                .iter()
                .filter(|f| f.path.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn download(&self, path: &str) -> Result<ByteStream, StorageError> {
            Err(StorageError::NotFound(path.to_string()))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        fn kind(&self) -> &str {
            "broken"
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<StorageFile>, StorageError> {
            Err(StorageError::Transport("connection reset".into()))
        }

        async fn download(&self, path: &str) -> Result<ByteStream, StorageError> {
            Err(StorageError::NotFound(path.to_string()))
        }
    }

    fn file(path: &str, secs: i64) -> StorageFile {
        StorageFile {
            path: path.to_string(),
            size: 10,
            last_modified: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn csv_lister(prefix: &str) -> Lister {
        Lister::new(prefix, &["**/*.csv".to_string()]).unwrap()
    }

    #[tokio::test]
    async fn orders_oldest_to_newest() {
        let store = FixedStore {
            files: vec![file("t2.csv", 200), file("t1.csv", 100), file("t3.csv", 300)],
        };
        let files = csv_lister("").list_candidates(&store).await;
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["t1.csv", "t2.csv", "t3.csv"]);
    }

    #[tokio::test]
    async fn filters_by_extension_case_insensitively() {
        let store = FixedStore {
            files: vec![
                file("in/a.csv", 1),
                file("in/b.CSV", 2),
                file("in/c.json", 3),
                file("in/nested/d.csv", 4),
            ],
        };
        let files = csv_lister("in/").list_candidates(&store).await;
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["in/a.csv", "in/b.CSV", "in/nested/d.csv"]);
    }

    #[tokio::test]
    async fn listing_error_yields_empty_set() {
        let files = csv_lister("").list_candidates(&BrokenStore).await;
        assert!(files.is_empty());
    }

    #[test]
    fn ties_break_on_path() {
        let mut files = vec![file("b.csv", 5), file("a.csv", 5)];
        sort_oldest_first(&mut files);
        assert_eq!(files[0].path, "a.csv");
    }

    #[test]
    fn fingerprint_tracks_every_component() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let base = fingerprint("dev1/a.csv", 100, t);
        assert_eq!(base, fingerprint("dev1/a.csv", 100, t));
        assert_eq!(base.fingerprint, "dev1/a.csv|100|1700000000000");

        assert_ne!(base.fingerprint, fingerprint("dev1/a.csv", 101, t).fingerprint);
        assert_ne!(base.fingerprint, fingerprint("dev1/b.csv", 100, t).fingerprint);
        let later = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        assert_ne!(base.fingerprint, fingerprint("dev1/a.csv", 100, later).fingerprint);
    }
}
