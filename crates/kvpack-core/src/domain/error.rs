//! Domain-level error taxonomy for kvpack.
//!
//! Each pipeline stage owns one error enum. A job folds whichever one
//! stopped it into [`JobFailure`].

use std::path::PathBuf;

use kvpack_state::StorageError;

/// Errors raised while loading configuration or building the target registry.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate target in registry: {system} ({arch})")]
    DuplicateTarget { system: String, arch: String },

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("target registry is empty")]
    EmptyRegistry,

    #[error("invalid target {system} ({arch}): {reason}")]
    InvalidTarget {
        system: String,
        arch: String,
        reason: String,
    },

    #[error("invalid tag pattern {pattern}: {reason}")]
    InvalidTagPattern { pattern: String, reason: String },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Failure to obtain output from the builder for one target.
#[derive(Debug, thiserror::Error)]
pub enum BuildInvocationError {
    #[error("build environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("builder produced no output (exit code {exit_code:?})")]
    NoOutput { exit_code: Option<i32> },

    #[error("builder timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("build cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The build report could not be evaluated.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("build report is missing")]
    MissingReport,

    #[error("build report is malformed: {0}")]
    MalformedReport(String),
}

/// The output tree could not be bundled.
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("output tree {0} contains no files")]
    EmptyTree(PathBuf),

    #[error("io error while packaging: {0}")]
    Io(#[from] std::io::Error),
}

/// Digest computation or verification failed.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("io error while checksumming: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed checksum line {line}: {reason}")]
    MalformedSidecar { line: usize, reason: String },

    #[error("checksum mismatch for {file_name}: expected {expected}, got {actual}")]
    Mismatch {
        file_name: String,
        expected: String,
        actual: String,
    },
}

/// The release publishing channel rejected or failed the upload.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{transport} transport failed: {detail}")]
    Transport { transport: String, detail: String },

    #[error("release store error: {0}")]
    Storage(#[from] StorageError),
}

/// Release aggregation did not produce a published release.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("event {0} is not a release event")]
    NotReleaseEvent(String),

    #[error("no verified assets available for release {tag}")]
    NoAssets { tag: String },

    #[error("artifact store error: {0}")]
    Storage(#[from] StorageError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Why a per-target job ended in the failed state.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error("build invocation failed: {0}")]
    Build(#[from] BuildInvocationError),

    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("{} package(s) failed: {}", failed_packages.len(), failed_packages.join(", "))]
    PackagesFailed { failed_packages: Vec<String> },

    #[error("packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("checksum failed: {0}")]
    Checksum(#[from] ChecksumError),

    #[error("publishing job files failed: {0}")]
    Publish(#[from] StorageError),

    #[error("job task aborted: {0}")]
    Aborted(String),
}

impl JobFailure {
    /// Packages the build report marked as failed, if that is why the job failed.
    pub fn failed_packages(&self) -> &[String] {
        match self {
            JobFailure::PackagesFailed { failed_packages } => failed_packages,
            _ => &[],
        }
    }

    /// Whether the job stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobFailure::Build(BuildInvocationError::Cancelled))
    }
}
