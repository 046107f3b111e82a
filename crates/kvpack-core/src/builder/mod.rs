//! The builder seam: run the native build for one target.
//!
//! Implementations:
//! - [`container::ContainerBuilder`] runs the build inside a container image.
//! - [`scripted::ScriptedBuilder`] plays back canned outcomes for tests and dry runs.

pub mod container;
pub mod scripted;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kvpack_state::{JobKey, LogStore};
use tracing::warn;
use walkdir::WalkDir;

use crate::domain::{BuildInvocationError, BuildTarget};

pub use container::ContainerBuilder;
pub use scripted::{ScriptedBuilder, ScriptedOutcome};

/// Directory of installed headers and libraries produced by one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutputTree {
    root: PathBuf,
}

impl BuildOutputTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Non-directory entries anywhere under the root. Zero if the root is absent.
    pub fn file_count(&self) -> usize {
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| !e.file_type().is_dir())
            .count()
    }

    /// Top-level entry names, sorted.
    pub fn top_level_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// What one builder run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInvocation {
    pub tree: BuildOutputTree,
    /// Where the report should be. It may not exist.
    pub report_path: PathBuf,
    pub exit_code: Option<i32>,
}

impl BuildInvocation {
    pub fn report_present(&self) -> bool {
        self.report_path.is_file()
    }

    /// Apply the no-output rule: fail only when there is neither a file
    /// in the tree nor a report.
    pub fn require_output(self) -> Result<Self, BuildInvocationError> {
        if self.tree.file_count() == 0 && !self.report_present() {
            return Err(BuildInvocationError::NoOutput {
                exit_code: self.exit_code,
            });
        }
        Ok(self)
    }
}

/// Line-oriented writer into one job's log stream.
#[derive(Clone)]
pub struct JobLog {
    store: Arc<dyn LogStore>,
    key: JobKey,
}

impl JobLog {
    pub fn new(store: Arc<dyn LogStore>, key: JobKey) -> Self {
        Self { store, key }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Append one line. Store failures are reported and otherwise ignored so
    /// a flaky log backend never fails a build.
    pub async fn line(&self, line: &str) {
        let mut chunk = Vec::with_capacity(line.len() + 1);
        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');
        if let Err(e) = self.store.append(&self.key, &chunk).await {
            warn!(job = %self.key, error = %e, "failed to append to job log");
        }
    }

    /// Everything logged so far. Empty if nothing was written.
    pub async fn contents(&self) -> Vec<u8> {
        self.store.read(&self.key).await.unwrap_or_default()
    }
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog").field("key", &self.key).finish()
    }
}

/// Runs the native build for a target inside `workdir`.
///
/// On return the output tree is at `workdir/output` and the report, if the
/// build wrote one, at `workdir/output_logs/build_report.json`. Builder
/// output is streamed into `log` as it arrives.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn invoke(
        &self,
        target: &BuildTarget,
        workdir: &Path,
        log: &JobLog,
    ) -> Result<BuildInvocation, BuildInvocationError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Conventional locations inside a builder working directory.
pub fn output_dir(workdir: &Path) -> PathBuf {
    workdir.join("output")
}

pub fn report_path(workdir: &Path) -> PathBuf {
    workdir.join(crate::verify::REPORT_RELATIVE_PATH)
}
