//! Storage trait definitions for kvpack
//!
//! These traits define the storage abstractions the orchestrator writes to:
//! - `LogStore`: per-job build log streams (append-only)
//! - `ArtifactStore`: per-job published files (bundles, sidecars, logs)
//! - `ReleaseStore`: one release record per version tag (overwrite on re-publish)
//!
//! Logs and artifacts are keyed by [`JobKey`], so concurrent jobs never
//! contend on the same entry. In-memory fakes live in the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// JobKey
// ---------------------------------------------------------------------------

/// Identity of one per-target job: the target pair plus a unique job id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// System identifier of the target (e.g. "ubuntu20.04")
    pub system: String,
    /// Host architecture of the target (e.g. "amd64")
    pub arch: String,
    /// Unique id of this job execution
    pub job_id: String,
}

impl JobKey {
    /// Create a key for a fresh job with a random id.
    pub fn new(system: impl Into<String>, arch: impl Into<String>) -> Self {
        Self::with_id(system, arch, uuid::Uuid::new_v4().to_string())
    }

    /// Create a key with an explicit job id.
    pub fn with_id(
        system: impl Into<String>,
        arch: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            arch: arch.into(),
            job_id: job_id.into(),
        }
    }

    /// Target slug, `"{system}_{arch}"`.
    pub fn slug(&self) -> String {
        format!("{}_{}", self.system, self.arch)
    }

    /// Short form of the job id (first 8 chars).
    pub fn short_id(&self) -> &str {
        match self.job_id.char_indices().nth(8) {
            Some((end, _)) => &self.job_id[..end],
            None => &self.job_id,
        }
    }

    /// Reject components that cannot be used as single path segments.
    pub fn validate(&self) -> StorageResult<()> {
        for part in [&self.system, &self.arch, &self.job_id] {
            validate_segment(part)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.slug(), self.short_id())
    }
}

/// Check that `segment` is usable as one filesystem path component.
pub fn validate_segment(segment: &str) -> StorageResult<()> {
    let reason = if segment.is_empty() {
        Some("empty")
    } else if segment == "." || segment == ".." {
        Some("path traversal")
    } else if segment.contains(['/', '\\', '\0']) {
        Some("contains a path separator")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: segment.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// LogStore
// ---------------------------------------------------------------------------

/// Append-only store of job log streams.
///
/// Guarantees:
/// - `append` never rewrites earlier bytes of the same key.
/// - `read` returns every chunk appended so far, in order.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a chunk to the job's log, creating it on first write.
    async fn append(&self, key: &JobKey, chunk: &[u8]) -> StorageResult<()>;

    /// Read the full log. Returns `StorageError::NotFound` if never written.
    async fn read(&self, key: &JobKey) -> StorageResult<Vec<u8>>;

    /// List every key with a log.
    async fn keys(&self) -> StorageResult<Vec<JobKey>>;
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// What a published file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Compressed bundle of a successful build
    Bundle,
    /// `<hex>  <filename>` checksum file for a bundle
    DigestSidecar,
    /// Captured build log and summary
    Log,
    /// Raw build report as produced by the builder
    Report,
    /// Partial outputs of a failed build
    Diagnostic,
}

/// Metadata of one published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    /// Job that published the file
    pub key: JobKey,
    /// Kind of file
    pub kind: AssetKind,
    /// File name (no directories)
    pub file_name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// When the file was stored
    pub stored_at: DateTime<Utc>,
}

/// Append-only store of published job files.
///
/// Semantics:
/// - Entries are addressed by `(key, file_name)`.
/// - `put` on an existing address fails with `StorageError::AlreadyExists`.
/// - `list` returns entries ordered by `stored_at`, oldest first.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publish a file for a job.
    async fn put(
        &self,
        key: &JobKey,
        kind: AssetKind,
        file_name: &str,
        data: &[u8],
    ) -> StorageResult<StoredAsset>;

    /// Read the bytes of a published file.
    async fn get(&self, asset: &StoredAsset) -> StorageResult<Vec<u8>>;

    /// List published files, optionally filtered by kind.
    async fn list(&self, kind: Option<AssetKind>) -> StorageResult<Vec<StoredAsset>>;
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

/// One file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAssetRecord {
    /// File name within the release
    pub file_name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// SHA-256 hex digest, when the file is a checksummed bundle
    pub digest: Option<String>,
}

/// A published release (one per tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    /// Version tag, e.g. "v1.2.0"
    pub tag: String,
    /// Attached files, in publish order
    pub assets: Vec<ReleaseAssetRecord>,
    /// Rendered release notes
    pub notes: String,
    /// When this record was (re)published
    pub published_at: DateTime<Utc>,
}

/// A file to attach to a release.
#[derive(Debug, Clone)]
pub struct ReleaseFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Release record store.
///
/// Semantics:
/// - `upsert` replaces any existing release with the same tag, record and
///   files together, so re-publishing never duplicates.
/// - `list` returns releases ordered by tag.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Create or replace the release for `record.tag`.
    async fn upsert(
        &self,
        record: ReleaseRecord,
        files: Vec<ReleaseFile>,
    ) -> StorageResult<ReleaseRecord>;

    /// Get the release for a tag, if any.
    async fn get(&self, tag: &str) -> StorageResult<Option<ReleaseRecord>>;

    /// Read one attached file of a release.
    async fn read_file(&self, tag: &str, file_name: &str) -> StorageResult<Vec<u8>>;

    /// List all releases.
    async fn list(&self) -> StorageResult<Vec<ReleaseRecord>>;
}
