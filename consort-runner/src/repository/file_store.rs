//! JSON file store
//!
//! One directory per record kind, one `<id>.json` file per record. Writes go
//! through a temporary file and a rename so readers never see half a record.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub(super) const CONSORTIA: &str = "consortia";
pub(super) const COLLECTIONS: &str = "collections";
pub(super) const RUNS: &str = "runs";

/// File-backed implementation of every local repository
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [CONSORTIA, COLLECTIONS, RUNS] {
            tokio::fs::create_dir_all(root.join(kind))
                .await
                .with_context(|| format!("Failed to create store directory {}", kind))?;
        }
        debug!("Opened local store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            anyhow::bail!("Invalid record id '{}'", id);
        }
        Ok(self.root.join(kind).join(format!("{}.json", id)))
    }

    pub(super) async fn read_record<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let path = self.record_path(kind, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt record {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub(super) async fn write_record<T: Serialize + Sync>(
        &self,
        kind: &str,
        id: &str,
        record: &T,
    ) -> Result<()> {
        let path = self.record_path(kind, id)?;
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(record).context("Failed to serialize record")?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!("Failed to remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
        }
        Ok(())
    }

    /// Removes a record; returns false when it did not exist
    pub(super) async fn remove_record(&self, kind: &str, id: &str) -> Result<bool> {
        let path = self.record_path(kind, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    /// Every record of a kind, sorted by id
    pub(super) async fn list_records<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let dir = self.root.join(kind);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        text: String,
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let note = Note {
            id: "n1".to_string(),
            text: "hello".to_string(),
        };

        store.write_record(RUNS, "n1", &note).await.unwrap();
        assert_eq!(store.read_record::<Note>(RUNS, "n1").await.unwrap(), Some(note));

        assert!(store.remove_record(RUNS, "n1").await.unwrap());
        assert!(!store.remove_record(RUNS, "n1").await.unwrap());
        assert_eq!(store.read_record::<Note>(RUNS, "n1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        for id in ["b", "a"] {
            let note = Note {
                id: id.to_string(),
                text: String::new(),
            };
            store.write_record(CONSORTIA, id, &note).await.unwrap();
        }

        let notes: Vec<Note> = store.list_records(CONSORTIA).await.unwrap();
        let ids: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let files = std::fs::read_dir(dir.path().join(CONSORTIA)).unwrap().count();
        assert_eq!(files, 2);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        assert!(store.read_record::<Note>(RUNS, "../escape").await.is_err());
        assert!(store.read_record::<Note>(RUNS, "").await.is_err());
    }
}
