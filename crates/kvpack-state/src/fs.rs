//! Filesystem-backed storage implementations.
//!
//! Layouts (every key component is validated as a single path segment):
//! - logs:      `<root>/<system>/<arch>/<job_id>.log`
//! - artifacts: `<root>/<system>/<arch>/<job_id>/files/<name>` with metadata
//!   in `<root>/<system>/<arch>/<job_id>/meta/<name>.json`
//! - releases:  `<root>/<tag>/` holding the files plus `release.json`
//!
//! A release is staged in `<root>/.staging-<uuid>/`. Swapping it in moves the
//! previous copy to `<root>/.retired-<uuid>/` first, so a failure at any point
//! leaves either the old or the new release readable. Leftovers of an
//! interrupted swap are resolved by [`FsReleaseStore::new`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::*;

const RELEASE_RECORD_FILE: &str = "release.json";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

fn not_found_or_io(err: std::io::Error, what: impl FnOnce() -> String) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound { what: what() }
    } else {
        StorageError::Io(err)
    }
}

/// Write `data` to `path` atomically, failing if `path` already exists.
fn write_new(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = path.parent().ok_or_else(|| StorageError::InvalidKey {
        key: path.display().to_string(),
        reason: "no parent directory".to_string(),
    })?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            StorageError::AlreadyExists {
                what: path.display().to_string(),
            }
        } else {
            StorageError::Io(e.error)
        }
    })?;
    Ok(())
}

/// Immediate subdirectories of `dir`; empty when `dir` does not exist.
fn subdirs(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

// ---------------------------------------------------------------------------
// FsLogStore
// ---------------------------------------------------------------------------

/// Append-only job logs on disk.
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    /// Create a log store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn log_path(&self, key: &JobKey) -> PathBuf {
        self.root
            .join(&key.system)
            .join(&key.arch)
            .join(format!("{}.log", key.job_id))
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn append(&self, key: &JobKey, chunk: &[u8]) -> StorageResult<()> {
        key.validate()?;
        let path = self.log_path(key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, key: &JobKey) -> StorageResult<Vec<u8>> {
        key.validate()?;
        tokio::fs::read(self.log_path(key))
            .await
            .map_err(|e| not_found_or_io(e, || format!("log {}", key)))
    }

    async fn keys(&self) -> StorageResult<Vec<JobKey>> {
        let mut keys = Vec::new();
        for system_dir in subdirs(&self.root)? {
            for arch_dir in subdirs(&system_dir)? {
                for entry in fs::read_dir(&arch_dir)? {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("log") {
                        continue;
                    }
                    let (Some(system), Some(arch), Some(job_id)) = (
                        file_name_of(&system_dir),
                        file_name_of(&arch_dir),
                        path.file_stem().map(|s| s.to_string_lossy().into_owned()),
                    ) else {
                        continue;
                    };
                    keys.push(JobKey::with_id(system, arch, job_id));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

/// Append-only published files on disk.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create an artifact store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn job_dir(&self, key: &JobKey) -> PathBuf {
        self.root.join(&key.system).join(&key.arch).join(&key.job_id)
    }

    /// Location of a published file on disk.
    pub fn file_path(&self, key: &JobKey, file_name: &str) -> PathBuf {
        self.job_dir(key).join("files").join(file_name)
    }

    fn meta_path(&self, key: &JobKey, file_name: &str) -> PathBuf {
        self.job_dir(key)
            .join("meta")
            .join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        key: &JobKey,
        kind: AssetKind,
        file_name: &str,
        data: &[u8],
    ) -> StorageResult<StoredAsset> {
        key.validate()?;
        validate_segment(file_name)?;

        let asset = StoredAsset {
            key: key.clone(),
            kind,
            file_name: file_name.to_string(),
            size_bytes: data.len() as u64,
            stored_at: Utc::now(),
        };

        // Data first: metadata is what makes an entry visible to `list`.
        write_new(&self.file_path(key, file_name), data)?;
        write_new(
            &self.meta_path(key, file_name),
            &serde_json::to_vec_pretty(&asset)?,
        )?;

        debug!(key = %key, file = %file_name, ?kind, "Stored artifact");
        Ok(asset)
    }

    async fn get(&self, asset: &StoredAsset) -> StorageResult<Vec<u8>> {
        asset.key.validate()?;
        validate_segment(&asset.file_name)?;
        tokio::fs::read(self.file_path(&asset.key, &asset.file_name))
            .await
            .map_err(|e| not_found_or_io(e, || format!("{}/{}", asset.key, asset.file_name)))
    }

    async fn list(&self, kind: Option<AssetKind>) -> StorageResult<Vec<StoredAsset>> {
        let mut assets = Vec::new();
        for system_dir in subdirs(&self.root)? {
            for arch_dir in subdirs(&system_dir)? {
                for job_dir in subdirs(&arch_dir)? {
                    let meta_dir = job_dir.join("meta");
                    if !meta_dir.is_dir() {
                        continue;
                    }
                    for entry in fs::read_dir(&meta_dir)? {
                        let bytes = fs::read(entry?.path())?;
                        let asset: StoredAsset = serde_json::from_slice(&bytes)?;
                        if kind.map_or(true, |k| asset.kind == k) {
                            assets.push(asset);
                        }
                    }
                }
            }
        }
        assets.sort_by(|a, b| {
            a.stored_at
                .cmp(&b.stored_at)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(assets)
    }
}

// ---------------------------------------------------------------------------
// FsReleaseStore
// ---------------------------------------------------------------------------

/// Release directories on disk, one per tag.
pub struct FsReleaseStore {
    root: PathBuf,
}

impl FsReleaseStore {
    /// Create a release store rooted at `root`. Creates the directory if needed.
    ///
    /// Finishes any swap interrupted by a crash: abandoned staging
    /// directories are removed and a retired release whose tag directory is
    /// missing is put back.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        store.recover()?;
        Ok(store)
    }

    fn recover(&self) -> StorageResult<()> {
        for dir in subdirs(&self.root)? {
            let Some(name) = file_name_of(&dir) else {
                continue;
            };
            if name.starts_with(STAGING_PREFIX) {
                debug!(dir = %dir.display(), "Removing abandoned release staging");
                fs::remove_dir_all(&dir)?;
            } else if name.starts_with(RETIRED_PREFIX) {
                match Self::read_record(&dir) {
                    Ok(Some(record))
                        if validate_segment(&record.tag).is_ok()
                            && !self.release_dir(&record.tag).exists() =>
                    {
                        warn!(tag = %record.tag, "Restoring release from interrupted publish");
                        fs::rename(&dir, self.release_dir(&record.tag))?;
                    }
                    Ok(_) => fs::remove_dir_all(&dir)?,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Leaving unreadable retired release");
                    }
                }
            }
        }
        Ok(())
    }

    fn hidden_dir(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{}{}", prefix, uuid::Uuid::new_v4()))
    }

    fn stage(staging: &Path, record: &ReleaseRecord, files: &[ReleaseFile]) -> StorageResult<()> {
        fs::create_dir_all(staging)?;
        for file in files {
            write_new(&staging.join(&file.file_name), &file.data)?;
        }
        write_new(
            &staging.join(RELEASE_RECORD_FILE),
            &serde_json::to_vec_pretty(record)?,
        )
    }

    /// Move `staging` to `target`, keeping the previous release until the
    /// new one is in place.
    fn swap_in(&self, staging: &Path, target: &Path) -> StorageResult<()> {
        let retired = self.hidden_dir(RETIRED_PREFIX);
        let replaced = match fs::rename(target, &retired) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fs::rename(staging, target) {
            if replaced {
                if let Err(restore) = fs::rename(&retired, target) {
                    warn!(
                        dir = %retired.display(),
                        error = %restore,
                        "Failed to restore previous release"
                    );
                }
            }
            return Err(e.into());
        }

        if replaced {
            debug!(dir = %target.display(), "Replaced existing release");
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!(dir = %retired.display(), error = %e, "Failed to remove retired release");
            }
        }
        Ok(())
    }

    /// Directory holding the files of a release.
    pub fn release_dir(&self, tag: &str) -> PathBuf {
        self.root.join(tag)
    }

    fn read_record(dir: &Path) -> StorageResult<Option<ReleaseRecord>> {
        match fs::read(dir.join(RELEASE_RECORD_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ReleaseStore for FsReleaseStore {
    async fn upsert(
        &self,
        record: ReleaseRecord,
        files: Vec<ReleaseFile>,
    ) -> StorageResult<ReleaseRecord> {
        validate_segment(&record.tag)?;
        for file in &files {
            validate_segment(&file.file_name)?;
            if file.file_name == RELEASE_RECORD_FILE {
                return Err(StorageError::InvalidKey {
                    key: file.file_name.clone(),
                    reason: "reserved for the release record".to_string(),
                });
            }
        }

        let staging = self.hidden_dir(STAGING_PREFIX);
        let result = Self::stage(&staging, &record, &files)
            .and_then(|()| self.swap_in(&staging, &self.release_dir(&record.tag)));
        if let Err(e) = result {
            if staging.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!(
                        dir = %staging.display(),
                        error = %cleanup,
                        "Failed to remove release staging"
                    );
                }
            }
            return Err(e);
        }

        Ok(record)
    }

    async fn get(&self, tag: &str) -> StorageResult<Option<ReleaseRecord>> {
        validate_segment(tag)?;
        Self::read_record(&self.release_dir(tag))
    }

    async fn read_file(&self, tag: &str, file_name: &str) -> StorageResult<Vec<u8>> {
        validate_segment(tag)?;
        validate_segment(file_name)?;
        tokio::fs::read(self.release_dir(tag).join(file_name))
            .await
            .map_err(|e| not_found_or_io(e, || format!("release {} file {}", tag, file_name)))
    }

    async fn list(&self) -> StorageResult<Vec<ReleaseRecord>> {
        let mut records = Vec::new();
        for dir in subdirs(&self.root)? {
            let hidden = file_name_of(&dir).map_or(true, |n| n.starts_with('.'));
            if hidden {
                continue;
            }
            if let Some(record) = Self::read_record(&dir)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(records)
    }
}
