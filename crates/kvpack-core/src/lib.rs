//! kvpack core: build-matrix orchestration and release aggregation.
//!
//! A run fans out one [`job::JobRunner`] per [`domain::BuildTarget`]. Each
//! job drives a [`builder::Builder`], verifies the build report, bundles the
//! output tree and checksums the bundle before publishing it. On a version
//! tag, [`release::ReleasePipeline`] waits for every run and publishes the
//! verified bundles with generated notes.

pub mod builder;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod job;
pub mod matrix;
pub mod obs;
pub mod package;
pub mod release;
pub mod telemetry;
pub mod verify;

pub use builder::{Builder, ContainerBuilder, ScriptedBuilder, ScriptedOutcome};
pub use config::PackConfig;
pub use domain::{
    Artifact, BuildInvocationError, BuildReport, BuildTarget, ChecksumError, ConfigError,
    JobFailure, PackageResult, PackagingError, PublishError, ReleaseError, ReleaseManifest,
    TargetRegistry, VerificationError,
};
pub use job::{JobEnvironment, JobOutcome, JobPhase, JobRunner, TerminalState};
pub use matrix::{MatrixCancel, MatrixCoordinator, MatrixReport, MatrixRun};
pub use release::{ReleaseOutcome, ReleasePipeline};
pub use telemetry::init_tracing;
pub use verify::{verify, VerificationResult};
