//! Release notes rendering.
//!
//! Notes list one line per bundle, the bundled libraries, how to verify
//! downloads and the build environment. Rendering is pure.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::domain::{bundle_slug, Artifact};

/// One third-party library shipped in every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub name: String,
    /// Branch or tag the library is built from.
    pub version: String,
    pub source: String,
    pub cxx_standard: String,
    pub linkage: String,
}

impl LibraryInfo {
    fn new(name: &str, version: &str, source: &str, cxx_standard: &str, linkage: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            source: source.to_string(),
            cxx_standard: cxx_standard.to_string(),
            linkage: linkage.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildEnvironment {
    pub compiler: String,
    pub cxx_standard: String,
    pub linkage: String,
    pub build_type: String,
}

impl Default for BuildEnvironment {
    fn default() -> Self {
        Self {
            compiler: "GCC 10".to_string(),
            cxx_standard: "C++17 (yalantinglibs: C++20)".to_string(),
            linkage: "static (rdma-core: shared)".to_string(),
            build_type: "Release".to_string(),
        }
    }
}

/// Static content of the notes, configurable under `[release.notes]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotesCatalog {
    pub project: String,
    pub libraries: Vec<LibraryInfo>,
    pub environment: BuildEnvironment,
}

impl Default for NotesCatalog {
    fn default() -> Self {
        const ORG: &str = "https://github.com/AI-Infra-Team";
        let source = |name: &str| format!("{}/{}", ORG, name);
        Self {
            project: "KV cache C++ dependency bundles".to_string(),
            libraries: vec![
                LibraryInfo::new(
                    "etcd-cpp-apiv3",
                    "master",
                    &source("etcd-cpp-apiv3"),
                    "C++17",
                    "static",
                ),
                LibraryInfo::new("gflags", "master", &source("gflags"), "C++17", "static"),
                LibraryInfo::new("glog", "v0.6.0", &source("glog"), "C++17", "static"),
                LibraryInfo::new("jsoncpp", "master", &source("jsoncpp"), "C++17", "static"),
                LibraryInfo::new("rdma-core", "master", &source("rdma-core"), "C++17", "shared"),
                LibraryInfo::new(
                    "yalantinglibs",
                    "main",
                    &source("yalantinglibs"),
                    "C++20",
                    "header-only",
                ),
            ],
            environment: BuildEnvironment::default(),
        }
    }
}

/// `output_ubuntu20.04_amd64.tar.gz` -> `ubuntu20.04 (amd64)`.
/// Names that do not follow the bundle pattern are returned unchanged.
pub fn listing_label(file_name: &str) -> String {
    match bundle_slug(file_name).and_then(|slug| slug.rsplit_once('_')) {
        Some((system, arch)) if !system.is_empty() && !arch.is_empty() => {
            format!("{} ({})", system, arch)
        }
        _ => file_name.to_string(),
    }
}

/// Render notes with the built-in catalog.
pub fn compose(assets: &[Artifact], tag: &str) -> String {
    compose_with(assets, tag, &NotesCatalog::default())
}

/// Render notes for `assets`, listed in the order given.
pub fn compose_with(assets: &[Artifact], tag: &str, catalog: &NotesCatalog) -> String {
    let mut out = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(out, "# {} {}", catalog.project, tag);
    let _ = writeln!(out);
    let _ = writeln!(out, "## Available packages");
    let _ = writeln!(out);
    for artifact in assets {
        let file_name = artifact.file_name();
        let _ = writeln!(out, "- **{}**: `{}`", listing_label(&file_name), file_name);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Included libraries");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Library | Version | Standard | Linkage |");
    let _ = writeln!(out, "|---------|---------|----------|---------|");
    for lib in &catalog.libraries {
        let _ = writeln!(
            out,
            "| [{}]({}) | {} | {} | {} |",
            lib.name, lib.source, lib.version, lib.cxx_standard, lib.linkage
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Verifying downloads");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Every bundle has a matching `.sha256` file. Download both and run:"
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "```sh");
    for artifact in assets {
        let _ = writeln!(out, "sha256sum -c {}.sha256", artifact.file_name());
    }
    let _ = writeln!(out, "```");

    let _ = writeln!(out);
    let _ = writeln!(out, "## Usage");
    let _ = writeln!(out);
    let _ = writeln!(out, "Extract the bundle for your platform into an install prefix:");
    let _ = writeln!(out);
    let _ = writeln!(out, "```sh");
    let _ = writeln!(out, "mkdir -p /opt/deps");
    let _ = writeln!(out, "tar -xzf output_<system>_<arch>.tar.gz -C /opt/deps");
    let _ = writeln!(out, "cmake -DCMAKE_PREFIX_PATH=/opt/deps ..");
    let _ = writeln!(out, "```");

    let env = &catalog.environment;
    let _ = writeln!(out);
    let _ = writeln!(out, "## Build environment");
    let _ = writeln!(out);
    let _ = writeln!(out, "- Compiler: {}", env.compiler);
    let _ = writeln!(out, "- Language standard: {}", env.cxx_standard);
    let _ = writeln!(out, "- Linkage: {}", env.linkage);
    let _ = writeln!(out, "- Build type: {}", env.build_type);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuildTarget;
    use std::path::PathBuf;

    fn artifact(system: &str, arch: &str) -> Artifact {
        let target = BuildTarget::new(system, arch);
        Artifact {
            path: PathBuf::from(target.bundle_name()),
            target,
            size_bytes: 1,
            digest: Some("0".repeat(64)),
        }
    }

    #[test]
    fn test_listing_label() {
        assert_eq!(
            listing_label("output_manylinux_2014_amd64.tar.gz"),
            "manylinux_2014 (amd64)"
        );
        assert_eq!(
            listing_label("output_ubuntu22.04_arm64.tar.gz"),
            "ubuntu22.04 (arm64)"
        );
        assert_eq!(listing_label("README.md"), "README.md");
        assert_eq!(listing_label("output_solo.tar.gz"), "output_solo.tar.gz");
    }

    #[test]
    fn test_compose_lists_every_asset_in_order() {
        let assets = vec![
            artifact("manylinux_2014", "amd64"),
            artifact("ubuntu20.04", "amd64"),
        ];
        let notes = compose(&assets, "v1.0.0");

        assert!(notes.starts_with("# KV cache C++ dependency bundles v1.0.0\n"));
        let first = notes.find("manylinux_2014 (amd64)").unwrap();
        let second = notes.find("ubuntu20.04 (amd64)").unwrap();
        assert!(first < second);
        assert!(notes.contains("sha256sum -c output_ubuntu20.04_amd64.tar.gz.sha256"));
        assert!(notes.contains("| v0.6.0 |"));
        assert!(notes.contains("- Compiler: GCC 10"));
    }

    #[test]
    fn test_compose_is_deterministic() {
        let assets = vec![artifact("ubuntu22.04", "amd64")];
        assert_eq!(compose(&assets, "v2"), compose(&assets, "v2"));
    }

    #[test]
    fn test_compose_with_custom_catalog() {
        let catalog = NotesCatalog {
            project: "Demo".to_string(),
            libraries: vec![LibraryInfo::new("zlib", "v1.3", "https://zlib.net", "C11", "static")],
            environment: BuildEnvironment {
                compiler: "Clang 17".to_string(),
                ..BuildEnvironment::default()
            },
        };
        let notes = compose_with(&[artifact("ubuntu20.04", "amd64")], "v3", &catalog);
        assert!(notes.starts_with("# Demo v3"));
        assert!(notes.contains("[zlib](https://zlib.net)"));
        assert!(!notes.contains("glog"));
        assert!(notes.contains("Clang 17"));
    }
}
