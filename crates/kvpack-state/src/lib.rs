//! kvpack-state: storage backends for kvpack
//!
//! This crate holds everything the orchestrator persists: job log streams,
//! published job files, and release records. Each concern is a trait with a
//! filesystem backend and an in-memory fake.
//!
//! ## Key Components
//!
//! - `JobKey`: `(system, arch, job_id)` identity keying logs and artifacts
//! - `LogStore` / `ArtifactStore`: append-only per-job storage
//! - `ReleaseStore`: one overwritable record per version tag

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::{FsArtifactStore, FsLogStore, FsReleaseStore};
pub use storage_traits::{
    validate_segment, ArtifactStore, AssetKind, JobKey, LogStore, ReleaseAssetRecord,
    ReleaseFile, ReleaseRecord, ReleaseStore, StorageResult, StoredAsset,
};
