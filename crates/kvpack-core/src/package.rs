//! Bundle an output tree into a gzip-compressed tar archive.
//!
//! Entries are stored relative to the tree root, in sorted walk order, with
//! deterministic headers so identical trees produce identical bundles.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;
use walkdir::WalkDir;

use crate::builder::BuildOutputTree;
use crate::domain::{Artifact, BuildTarget, PackagingError};

/// Writes bundles into a distribution directory.
#[derive(Debug, Clone)]
pub struct ArtifactPackager {
    dist_dir: PathBuf,
}

impl ArtifactPackager {
    pub fn new(dist_dir: impl Into<PathBuf>) -> Self {
        Self {
            dist_dir: dist_dir.into(),
        }
    }

    pub fn dist_dir(&self) -> &Path {
        &self.dist_dir
    }

    /// Bundle `tree` as `output_{system}_{arch}.tar.gz`. The digest is left unset.
    pub fn package(
        &self,
        target: &BuildTarget,
        tree: &BuildOutputTree,
    ) -> Result<Artifact, PackagingError> {
        std::fs::create_dir_all(&self.dist_dir)?;
        let path = self.dist_dir.join(target.bundle_name());
        let files = write_tarball(tree.root(), &path)?;
        let size_bytes = std::fs::metadata(&path)?.len();
        debug!(slug = %target.slug(), files, size_bytes, "bundle written");

        Ok(Artifact {
            target: target.clone(),
            path,
            size_bytes,
            digest: None,
        })
    }
}

/// Archive the contents of `root` (not `root` itself) into `dest`.
///
/// Returns the number of non-directory entries written. Fails with
/// `EmptyTree` and writes nothing when `root` holds no files.
pub fn write_tarball(root: &Path, dest: &Path) -> Result<usize, PackagingError> {
    let entries = collect_entries(root)?;
    let file_count = entries.iter().filter(|(_, is_dir)| !is_dir).count();
    if file_count == 0 {
        return Err(PackagingError::EmptyTree(root.to_path_buf()));
    }

    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for (relative, is_dir) in &entries {
        let full = root.join(relative);
        if *is_dir {
            builder.append_dir(relative, &full)?;
        } else {
            builder.append_path_with_name(&full, relative)?;
        }
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(file_count)
}

/// Sorted `(relative path, is_dir)` list under `root`. A missing root is empty.
fn collect_entries(root: &Path) -> Result<Vec<(PathBuf, bool)>, PackagingError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            PackagingError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop in output tree")
            }))
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            .to_path_buf();
        entries.push((relative, entry.file_type().is_dir()));
    }
    Ok(entries)
}
