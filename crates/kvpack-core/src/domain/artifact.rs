//! Bundles produced by successful jobs and their release view.

use std::path::PathBuf;

use kvpack_state::StoredAsset;
use serde::{Deserialize, Serialize};

use super::target::{BuildTarget, SIDECAR_SUFFIX};

/// A compressed bundle for one target.
///
/// `digest` is `None` until the checksum step has run; a published bundle
/// always carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub target: BuildTarget,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub digest: Option<String>,
}

impl Artifact {
    /// File name of the bundle, `output_{system}_{arch}.tar.gz`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.target.bundle_name())
    }

    /// Location of the digest sidecar next to the bundle.
    pub fn sidecar_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }
}

/// One verified bundle selected for a release, with the stored files backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub artifact: Artifact,
    pub bundle: StoredAsset,
    pub sidecar: StoredAsset,
}

/// Everything a release is made of, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseManifest {
    pub tag: String,
    /// Sorted by bundle file name.
    pub assets: Vec<ReleaseAsset>,
    pub notes: String,
}

impl ReleaseManifest {
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.assets.iter().map(|a| a.artifact.clone()).collect()
    }
}
