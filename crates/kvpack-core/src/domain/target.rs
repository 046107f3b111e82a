//! Build targets and the registry that enumerates them.
//!
//! A target is an (operating-environment, architecture) pair. Its slug
//! `"{system}_{arch}"` names the job key, the bundle and the sidecar.

use std::collections::HashSet;
use std::fmt;

use kvpack_state::{validate_segment, JobKey};
use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// File name prefix of every release bundle.
pub const BUNDLE_PREFIX: &str = "output_";
/// File name suffix of every release bundle.
pub const BUNDLE_SUFFIX: &str = ".tar.gz";
/// Suffix appended to a bundle name to name its digest sidecar.
pub const SIDECAR_SUFFIX: &str = ".sha256";

/// One (operating-environment, architecture) pair to build for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTarget {
    #[serde(rename = "system")]
    pub system_identifier: String,
    #[serde(rename = "arch")]
    pub host_architecture: String,
}

impl BuildTarget {
    /// Create a target. The architecture is normalized via [`normalize_arch`].
    pub fn new(system: impl Into<String>, arch: &str) -> Self {
        Self {
            system_identifier: system.into(),
            host_architecture: normalize_arch(arch),
        }
    }

    /// `"{system}_{arch}"`
    pub fn slug(&self) -> String {
        format!("{}_{}", self.system_identifier, self.host_architecture)
    }

    /// `output_{system}_{arch}.tar.gz`
    pub fn bundle_name(&self) -> String {
        format!("{}{}{}", BUNDLE_PREFIX, self.slug(), BUNDLE_SUFFIX)
    }

    /// `output_{system}_{arch}.tar.gz.sha256`
    pub fn sidecar_name(&self) -> String {
        format!("{}{}", self.bundle_name(), SIDECAR_SUFFIX)
    }

    /// Fresh job key for one execution against this target.
    pub fn new_job_key(&self) -> JobKey {
        JobKey::new(&self.system_identifier, &self.host_architecture)
    }

    /// Parse `output_{system}_{arch}.tar.gz`. The architecture is the part
    /// after the last underscore.
    pub fn from_bundle_name(file_name: &str) -> Option<Self> {
        let (system, arch) = bundle_slug(file_name)?.rsplit_once('_')?;
        if system.is_empty() || arch.is_empty() {
            return None;
        }
        Some(Self::new(system, arch))
    }

    /// Target a job key belongs to.
    pub fn from_job_key(key: &JobKey) -> Self {
        Self {
            system_identifier: key.system.clone(),
            host_architecture: key.arch.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for part in [&self.system_identifier, &self.host_architecture] {
            validate_segment(part).map_err(|e| ConfigError::InvalidTarget {
                system: self.system_identifier.clone(),
                arch: self.host_architecture.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.system_identifier.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidTarget {
                system: self.system_identifier.clone(),
                arch: self.host_architecture.clone(),
                reason: "system identifier contains whitespace".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.system_identifier, self.host_architecture)
    }
}

/// Map machine names onto the architecture vocabulary used in bundle names.
///
/// `x86_64`/`amd64` become `amd64`, `aarch64`/`arm64` become `arm64` and
/// `armv7l`/`armv6l` become `arm`. Anything else is lowercased and kept.
pub fn normalize_arch(machine: &str) -> String {
    let lower = machine.trim().to_ascii_lowercase();
    match lower.as_str() {
        "x86_64" | "amd64" | "x64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "armv7l" | "armv6l" | "arm" => "arm".to_string(),
        _ => lower,
    }
}

/// Extract the `"{system}_{arch}"` slug from a bundle file name.
pub fn bundle_slug(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(BUNDLE_PREFIX)?
        .strip_suffix(BUNDLE_SUFFIX)
        .filter(|slug| !slug.is_empty())
}

/// Ordered, duplicate-free list of targets. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRegistry {
    targets: Vec<BuildTarget>,
}

impl TargetRegistry {
    /// Build a registry, rejecting duplicates and unusable names.
    pub fn new(targets: Vec<BuildTarget>) -> Result<Self, ConfigError> {
        if targets.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        let mut seen = HashSet::new();
        for target in &targets {
            target.validate()?;
            if !seen.insert(target.slug()) {
                return Err(ConfigError::DuplicateTarget {
                    system: target.system_identifier.clone(),
                    arch: target.host_architecture.clone(),
                });
            }
        }
        Ok(Self { targets })
    }

    /// The release matrix shipped by default.
    pub fn default_matrix() -> Self {
        Self {
            targets: vec![
                BuildTarget::new("ubuntu20.04", "amd64"),
                BuildTarget::new("ubuntu22.04", "amd64"),
                BuildTarget::new("manylinux_2014", "amd64"),
            ],
        }
    }

    /// All targets in registry order.
    pub fn list_targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    /// Narrow the registry to the given slugs, keeping registry order.
    pub fn select(&self, slugs: &[String]) -> Result<Self, ConfigError> {
        for slug in slugs {
            if !self.targets.iter().any(|t| &t.slug() == slug) {
                return Err(ConfigError::UnknownTarget(slug.clone()));
            }
        }
        let targets: Vec<BuildTarget> = self
            .targets
            .iter()
            .filter(|t| slugs.contains(&t.slug()))
            .cloned()
            .collect();
        Self::new(targets)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::default_matrix()
    }
}
