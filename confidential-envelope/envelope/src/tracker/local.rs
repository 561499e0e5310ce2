// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Use records in one local file: gzipped JSON mapping the SHA-256 of each
//! uuid to its [`UseRecord`].
//!
//! Every operation reads the whole file. A write replaces the file by
//! renaming a fully written temporary file over it, so a crash leaves either
//! the old or the new store. Writers inside one process are serialized;
//! writers in different processes are not, so one file serves one operator.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use log::{debug, info};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{check_observed, Error, HighWater, Result, Tracker, UseRecord};
use crate::{compress, DEFAULT_SIZE_LIMIT};

type Store = BTreeMap<String, UseRecord>;

pub struct LocalFileTracker {
    path: PathBuf,
    marks: HighWater,
    write_lock: Mutex<()>,
}

impl LocalFileTracker {
    /// Open the store at `path`. A missing file is an empty store and is
    /// created on the first write; an unreadable one is an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let tracker = Self {
            path: path.as_ref().to_path_buf(),
            marks: HighWater::default(),
            write_lock: Mutex::new(()),
        };
        let store = tracker.load().await?;
        info!(
            "local use tracker {} opened with {} record(s)",
            tracker.path.display(),
            store.len()
        );
        for (key, record) in &store {
            tracker.marks.observe(key, record.count)?;
        }
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Store> {
        let compressed = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Store::new()),
            Err(source) => {
                return Err(Error::Io {
                    context: "read the tracker file",
                    source,
                })
            }
        };

        let json = compress::decompress(&compressed, DEFAULT_SIZE_LIMIT)
            .map_err(|e| Error::Corrupted(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| Error::Corrupted(e.to_string()))
    }

    async fn store(&self, store: &Store) -> Result<()> {
        let json = serde_json::to_vec(store).map_err(|e| Error::Corrupted(e.to_string()))?;
        let compressed = compress::compress(&json).map_err(|e| Error::Corrupted(e.to_string()))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || persist(&path, &compressed))
            .await
            .map_err(|e| Error::Corrupted(format!("tracker writer panicked: {e}")))?
    }
}

fn persist(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|source| Error::Io {
        context: "create the tracker directory",
        source,
    })?;

    let mut file = NamedTempFile::new_in(dir).map_err(|source| Error::Io {
        context: "create a temporary tracker file",
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|source| Error::Io {
                context: "restrict the tracker file mode",
                source,
            })?;
    }

    file.write_all(contents).map_err(|source| Error::Io {
        context: "write the tracker file",
        source,
    })?;
    file.as_file().sync_all().map_err(|source| Error::Io {
        context: "sync the tracker file",
        source,
    })?;
    file.persist(path).map_err(|e| Error::Io {
        context: "replace the tracker file",
        source: e.error,
    })?;
    Ok(())
}

#[async_trait]
impl Tracker for LocalFileTracker {
    async fn count(&self, uuid: &Uuid) -> Result<u64> {
        let key = compress::tracker_key(uuid);
        let store = self.load().await?;
        let count = store.get(&key).map(|r| r.count).unwrap_or_default();
        self.marks.observe(&key, count)?;
        Ok(count)
    }

    async fn record(&self, uuid: &Uuid, observed: u64) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let key = compress::tracker_key(uuid);
        let mut store = self.load().await?;
        let current = store.get(&key);
        let count = current.map(|r| r.count).unwrap_or_default();
        self.marks.observe(&key, count)?;
        check_observed(&key, observed, count)?;

        let next = UseRecord::next(current, chrono::Utc::now().timestamp());
        let count = next.count;
        store.insert(key.clone(), next);
        self.store(&store).await?;
        self.marks.observe(&key, count)?;

        debug!("use {count} recorded in {}", self.path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::LocalFileTracker;
    use crate::tracker::{Error, Tracker};

    #[tokio::test]
    async fn counts_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("uses.json.gz");
        let uuid = Uuid::new_v4();

        let tracker = LocalFileTracker::open(&path).await.expect("open");
        assert_eq!(tracker.count(&uuid).await.expect("count"), 0);
        assert_eq!(tracker.record(&uuid, 0).await.expect("record"), 1);
        assert_eq!(tracker.record(&uuid, 1).await.expect("record"), 2);
        drop(tracker);

        let tracker = LocalFileTracker::open(&path).await.expect("reopen");
        assert_eq!(tracker.count(&uuid).await.expect("count"), 2);
        assert_eq!(tracker.count(&Uuid::new_v4()).await.expect("count"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_mode_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("uses.json.gz");
        let tracker = LocalFileTracker::open(&path).await.expect("open");
        tracker.record(&Uuid::new_v4(), 0).await.expect("record");

        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn raw_uuids_are_not_stored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("uses.json.gz");
        let uuid = Uuid::new_v4();
        let tracker = LocalFileTracker::open(&path).await.expect("open");
        tracker.record(&uuid, 0).await.expect("record");

        let compressed = std::fs::read(&path).expect("read");
        let json = crate::compress::decompress(&compressed, 1 << 20).expect("gunzip");
        let text = String::from_utf8(json.to_vec()).expect("utf8");
        assert!(!text.contains(&uuid.to_string()));
        assert!(text.contains(&crate::compress::tracker_key(&uuid)));
    }

    #[tokio::test]
    async fn lost_store_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("uses.json.gz");
        let uuid = Uuid::new_v4();
        let tracker = LocalFileTracker::open(&path).await.expect("open");
        tracker.record(&uuid, 0).await.expect("record");

        std::fs::remove_file(&path).expect("remove");
        assert!(matches!(
            tracker.count(&uuid).await,
            Err(Error::RecordLost(_))
        ));
    }

    #[tokio::test]
    async fn corrupted_store_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("uses.json.gz");
        std::fs::write(&path, b"definitely not gzip").expect("write");
        assert!(matches!(
            LocalFileTracker::open(&path).await,
            Err(Error::Corrupted(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_are_serialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("uses.json.gz");
        let tracker = Arc::new(LocalFileTracker::open(&path).await.expect("open"));
        let uuid = Uuid::new_v4();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.record(&uuid, 0).await })
            })
            .collect();

        let mut wins = 0;
        for task in tasks {
            match task.await.expect("join") {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(tracker.count(&uuid).await.expect("count"), 1);
    }
}
