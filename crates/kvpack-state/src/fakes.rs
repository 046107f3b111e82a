//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryLogStore`, `MemoryArtifactStore`, and `MemoryReleaseStore`
//! that satisfy the trait contracts without touching the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryLogStore
// ---------------------------------------------------------------------------

/// In-memory log store backed by a `HashMap<JobKey, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: Mutex<HashMap<JobKey, Vec<u8>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, key: &JobKey, chunk: &[u8]) -> StorageResult<()> {
        key.validate()?;
        let mut logs = self.logs.lock().unwrap();
        logs.entry(key.clone()).or_default().extend_from_slice(chunk);
        Ok(())
    }

    async fn read(&self, key: &JobKey) -> StorageResult<Vec<u8>> {
        let logs = self.logs.lock().unwrap();
        logs.get(key).cloned().ok_or_else(|| StorageError::NotFound {
            what: format!("log {}", key),
        })
    }

    async fn keys(&self) -> StorageResult<Vec<JobKey>> {
        let logs = self.logs.lock().unwrap();
        let mut keys: Vec<JobKey> = logs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory artifact store keeping insertion order.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<Vec<(StoredAsset, Vec<u8>)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        key: &JobKey,
        kind: AssetKind,
        file_name: &str,
        data: &[u8],
    ) -> StorageResult<StoredAsset> {
        key.validate()?;
        validate_segment(file_name)?;

        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|(a, _)| &a.key == key && a.file_name == file_name)
        {
            return Err(StorageError::AlreadyExists {
                what: format!("{}/{}", key, file_name),
            });
        }

        let asset = StoredAsset {
            key: key.clone(),
            kind,
            file_name: file_name.to_string(),
            size_bytes: data.len() as u64,
            stored_at: Utc::now(),
        };
        entries.push((asset.clone(), data.to_vec()));
        Ok(asset)
    }

    async fn get(&self, asset: &StoredAsset) -> StorageResult<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|(a, _)| a.key == asset.key && a.file_name == asset.file_name)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StorageError::NotFound {
                what: format!("{}/{}", asset.key, asset.file_name),
            })
    }

    async fn list(&self, kind: Option<AssetKind>) -> StorageResult<Vec<StoredAsset>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .map(|(a, _)| a)
            .filter(|a| kind.map_or(true, |k| a.kind == k))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryReleaseStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ReleaseState {
    record: ReleaseRecord,
    files: HashMap<String, Vec<u8>>,
}

/// In-memory release store keyed by tag.
#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    releases: Mutex<BTreeMap<String, ReleaseState>>,
    upserts: Mutex<u64>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upsert` calls observed (including overwrites).
    pub fn upsert_count(&self) -> u64 {
        *self.upserts.lock().unwrap()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn upsert(
        &self,
        record: ReleaseRecord,
        files: Vec<ReleaseFile>,
    ) -> StorageResult<ReleaseRecord> {
        validate_segment(&record.tag)?;
        for file in &files {
            validate_segment(&file.file_name)?;
        }

        let files = files.into_iter().map(|f| (f.file_name, f.data)).collect();
        let mut releases = self.releases.lock().unwrap();
        releases.insert(
            record.tag.clone(),
            ReleaseState {
                record: record.clone(),
                files,
            },
        );
        *self.upserts.lock().unwrap() += 1;
        Ok(record)
    }

    async fn get(&self, tag: &str) -> StorageResult<Option<ReleaseRecord>> {
        let releases = self.releases.lock().unwrap();
        Ok(releases.get(tag).map(|s| s.record.clone()))
    }

    async fn read_file(&self, tag: &str, file_name: &str) -> StorageResult<Vec<u8>> {
        let releases = self.releases.lock().unwrap();
        releases
            .get(tag)
            .and_then(|s| s.files.get(file_name))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                what: format!("release {} file {}", tag, file_name),
            })
    }

    async fn list(&self) -> StorageResult<Vec<ReleaseRecord>> {
        let releases = self.releases.lock().unwrap();
        Ok(releases.values().map(|s| s.record.clone()).collect())
    }
}
