//! Domain types shared by every stage of the build-and-release pipeline.

pub mod artifact;
pub mod error;
pub mod report;
pub mod target;

pub use artifact::{Artifact, ReleaseAsset, ReleaseManifest};
pub use error::{
    BuildInvocationError, ChecksumError, ConfigError, JobFailure, PackagingError, PublishError,
    ReleaseError, VerificationError,
};
pub use report::{BuildReport, PackageResult};
pub use target::{bundle_slug, normalize_arch, BuildTarget, TargetRegistry};
