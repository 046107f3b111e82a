//! `kvpack.toml` configuration.
//!
//! Every section is optional; a missing file yields the defaults.
//!
//! ```toml
//! [matrix]
//! targets = [
//!     { system = "ubuntu20.04", arch = "amd64" },
//!     { system = "manylinux_2014", arch = "aarch64" },
//! ]
//!
//! [builder]
//! runtime = "docker"
//! timeout_secs = 7200
//!
//! [builder.images]
//! "ubuntu20.04" = "ubuntu:20.04"
//! manylinux_2014 = { amd64 = "dockcross/manylinux2014-x64", arm64 = "dockcross/manylinux2014-aarch64" }
//!
//! [stores]
//! root = ".kvpack"
//!
//! [release]
//! tag_pattern = "^v"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{BuildTarget, ConfigError, TargetRegistry};
use crate::release::notes::NotesCatalog;
use crate::release::trigger::ReleaseTrigger;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "kvpack.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    pub matrix: MatrixConfig,
    pub builder: BuilderConfig,
    pub stores: StoreConfig,
    pub release: ReleaseConfig,
}

impl PackConfig {
    /// Parse configuration text. `origin` only labels errors.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load a config file that must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Build the target registry from `[matrix]`.
    pub fn registry(&self) -> Result<TargetRegistry, ConfigError> {
        TargetRegistry::new(
            self.matrix
                .targets
                .iter()
                .map(|t| BuildTarget::new(t.system.clone(), &t.arch))
                .collect(),
        )
    }

    /// Build the release trigger from `[release]`.
    pub fn trigger(&self) -> Result<ReleaseTrigger, ConfigError> {
        ReleaseTrigger::new(&self.release.tag_pattern)
    }

    /// Check everything that can be checked without running anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry()?;
        self.trigger()?;
        Ok(())
    }
}

/// One `[matrix]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub system: String,
    pub arch: String,
}

impl TargetEntry {
    fn new(system: &str, arch: &str) -> Self {
        Self {
            system: system.to_string(),
            arch: arch.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub targets: Vec<TargetEntry>,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            targets: vec![
                TargetEntry::new("ubuntu20.04", "amd64"),
                TargetEntry::new("ubuntu22.04", "amd64"),
                TargetEntry::new("manylinux_2014", "amd64"),
            ],
        }
    }
}

/// Image reference for a system: one image, or one per architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSpec {
    Single(String),
    PerArch(BTreeMap<String, String>),
}

impl ImageSpec {
    pub fn for_arch(&self, arch: &str) -> Option<&str> {
        match self {
            ImageSpec::Single(image) => Some(image),
            ImageSpec::PerArch(images) => images.get(arch).map(String::as_str),
        }
    }
}

/// `[builder]`: how the container builder runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Container runtime executable.
    pub runtime: String,
    /// System identifier to image.
    pub images: BTreeMap<String, ImageSpec>,
    /// Command run in the container. Empty runs the image's default command.
    pub command: Vec<String>,
    /// Wall-clock limit per build. Zero disables it.
    pub timeout_secs: u64,
    /// Mount point of the working directory inside the container.
    pub workspace_mount: String,
    pub privileged: bool,
    /// Host environment variables passed through when set.
    pub forward_env: Vec<String>,
    /// Extra runtime arguments, inserted before the image.
    pub extra_args: Vec<String>,
    /// Keep per-job working directories after the job ends.
    pub keep_workdirs: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let mut images = BTreeMap::new();
        images.insert(
            "ubuntu20.04".to_string(),
            ImageSpec::Single("ubuntu:20.04".to_string()),
        );
        images.insert(
            "ubuntu22.04".to_string(),
            ImageSpec::Single("ubuntu:22.04".to_string()),
        );
        images.insert(
            "manylinux_2014".to_string(),
            ImageSpec::PerArch(BTreeMap::from([
                (
                    "amd64".to_string(),
                    "dockcross/manylinux2014-x64".to_string(),
                ),
                (
                    "arm64".to_string(),
                    "dockcross/manylinux2014-aarch64".to_string(),
                ),
            ])),
        );

        Self {
            runtime: "docker".to_string(),
            images,
            command: Vec::new(),
            timeout_secs: 7200,
            workspace_mount: "/workspace".to_string(),
            privileged: true,
            forward_env: [
                "http_proxy",
                "https_proxy",
                "ftp_proxy",
                "no_proxy",
                "HTTP_PROXY",
                "HTTPS_PROXY",
                "FTP_PROXY",
                "NO_PROXY",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extra_args: Vec::new(),
            keep_workdirs: false,
        }
    }
}

/// `[stores]`: where logs, artifacts, releases and scratch space live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".kvpack"),
        }
    }
}

impl StoreConfig {
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }
}

/// `[release]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Regex a tag name must match to trigger a release.
    pub tag_pattern: String,
    pub notes: NotesCatalog,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            tag_pattern: "^v".to_string(),
            notes: NotesCatalog::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PackConfig::default();
        config.validate().unwrap();
        assert_eq!(config.registry().unwrap().len(), 3);
        assert_eq!(config.builder.timeout_secs, 7200);
        assert_eq!(config.stores.logs_dir(), PathBuf::from(".kvpack/logs"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let text = r#"
[matrix]
targets = [
    { system = "ubuntu20.04", arch = "x86_64" },
    { system = "manylinux_2014", arch = "aarch64" },
]

[builder]
timeout_secs = 60
"#;
        let config = PackConfig::from_toml_str(text, Path::new("kvpack.toml")).unwrap();
        let registry = config.registry().unwrap();
        let slugs: Vec<String> = registry.list_targets().iter().map(|t| t.slug()).collect();
        assert_eq!(slugs, vec!["ubuntu20.04_amd64", "manylinux_2014_arm64"]);
        assert_eq!(config.builder.timeout_secs, 60);
        assert_eq!(config.builder.runtime, "docker");
        assert_eq!(config.release.tag_pattern, "^v");
    }

    #[test]
    fn test_duplicate_targets_are_rejected() {
        let text = r#"
[matrix]
targets = [
    { system = "ubuntu20.04", arch = "amd64" },
    { system = "ubuntu20.04", arch = "amd64" },
]
"#;
        let config = PackConfig::from_toml_str(text, Path::new("kvpack.toml")).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateTarget { .. }
        ));
    }

    #[test]
    fn test_image_spec_forms() {
        let text = r#"
[builder.images]
"ubuntu20.04" = "registry.local/u20:latest"
manylinux_2014 = { amd64 = "m-x64", arm64 = "m-aarch64" }
"#;
        let config = PackConfig::from_toml_str(text, Path::new("kvpack.toml")).unwrap();
        let images = &config.builder.images;
        assert_eq!(
            images["ubuntu20.04"].for_arch("arm64"),
            Some("registry.local/u20:latest")
        );
        assert_eq!(images["manylinux_2014"].for_arch("arm64"), Some("m-aarch64"));
        assert_eq!(images["manylinux_2014"].for_arch("arm"), None);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PackConfig::load_or_default(&dir.path().join("kvpack.toml")).unwrap();
        assert_eq!(config, PackConfig::default());
        assert!(matches!(
            PackConfig::load(&dir.path().join("kvpack.toml")).unwrap_err(),
            ConfigError::Read { .. }
        ));
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = PackConfig::from_toml_str("[matrix", Path::new("custom.toml")).unwrap_err();
        assert!(err.to_string().contains("custom.toml"));
    }

    #[test]
    fn test_bad_tag_pattern_is_rejected() {
        let text = "[release]\ntag_pattern = \"(\"\n";
        let config = PackConfig::from_toml_str(text, Path::new("kvpack.toml")).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidTagPattern { .. }
        ));
    }
}
