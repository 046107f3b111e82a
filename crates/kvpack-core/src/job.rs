//! Per-target job: build, verify, package, checksum and publish.
//!
//! A job walks `Pending -> Building -> Verifying -> Packaging ->
//! ChecksummingAndPublishingLogs -> Succeeded`. Any step may move it to
//! `Failed`; a failed job still publishes its log, the report if one was
//! written and a diagnostic bundle of partial outputs.
//!
//! A succeeding job publishes its report and log first and its bundle last,
//! so a store failure part-way never leaves a bundle behind a failed job.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kvpack_state::{ArtifactStore, AssetKind, JobKey, LogStore, StoredAsset};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{warn, Instrument};

use crate::builder::{output_dir, report_path, BuildInvocation, BuildOutputTree, Builder, JobLog};
use crate::checksum::{checksum, sidecar_path};
use crate::domain::{
    Artifact, BuildInvocationError, BuildReport, BuildTarget, JobFailure, PackagingError,
};
use crate::obs::{
    emit_job_failed, emit_job_finished, emit_job_started, emit_phase_entered, job_span,
};
use crate::package::{write_tarball, ArtifactPackager};
use crate::verify::{load_report, verify, VerificationResult};

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Building,
    Verifying,
    Packaging,
    ChecksummingAndPublishingLogs,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "pending",
            JobPhase::Building => "building",
            JobPhase::Verifying => "verifying",
            JobPhase::Packaging => "packaging",
            JobPhase::ChecksummingAndPublishingLogs => "checksumming_and_publishing_logs",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    Failed,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminalState::Succeeded => "succeeded",
            TerminalState::Failed => "failed",
        })
    }
}

impl From<TerminalState> for JobPhase {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Succeeded => JobPhase::Succeeded,
            TerminalState::Failed => JobPhase::Failed,
        }
    }
}

/// Receiving side of a cancellation flag. `true` means cancel.
pub type CancelSignal = watch::Receiver<bool>;

/// Shared collaborators of every job in a run.
#[derive(Clone)]
pub struct JobEnvironment {
    pub builder: Arc<dyn Builder>,
    pub logs: Arc<dyn LogStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Jobs work in `work_root/{slug}/{job_id}`.
    pub work_root: PathBuf,
    pub keep_workdirs: bool,
}

impl JobEnvironment {
    pub fn new(
        builder: Arc<dyn Builder>,
        logs: Arc<dyn LogStore>,
        artifacts: Arc<dyn ArtifactStore>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            builder,
            logs,
            artifacts,
            work_root: work_root.into(),
            keep_workdirs: false,
        }
    }

    pub fn keep_workdirs(mut self, keep: bool) -> Self {
        self.keep_workdirs = keep;
        self
    }

    fn workdir_for(&self, key: &JobKey) -> PathBuf {
        self.work_root.join(key.slug()).join(&key.job_id)
    }
}

/// Published file names for a target.
pub fn log_file_name(target: &BuildTarget) -> String {
    format!("build_{}.log", target.slug())
}

pub fn report_file_name(target: &BuildTarget) -> String {
    format!("build_report_{}.json", target.slug())
}

pub fn diagnostic_file_name(target: &BuildTarget) -> String {
    format!("partial_{}.tar.gz", target.slug())
}

/// Result of one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub target: BuildTarget,
    pub key: JobKey,
    pub state: TerminalState,
    /// Set only when the job succeeded. Always checksummed.
    pub artifact: Option<Artifact>,
    pub verification: Option<VerificationResult>,
    pub failure: Option<JobFailure>,
    /// Every phase entered, in order, ending with the terminal one.
    pub phases: Vec<JobPhase>,
    pub published: Vec<StoredAsset>,
    pub duration_ms: u64,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == TerminalState::Succeeded
    }

    pub fn failed_packages(&self) -> &[String] {
        self.failure
            .as_ref()
            .map(JobFailure::failed_packages)
            .unwrap_or(&[])
    }

    /// Outcome for a job whose task died before reporting.
    pub fn aborted(target: BuildTarget, key: JobKey, reason: String) -> Self {
        Self {
            target,
            key,
            state: TerminalState::Failed,
            artifact: None,
            verification: None,
            failure: Some(JobFailure::Aborted(reason)),
            phases: vec![JobPhase::Pending, JobPhase::Failed],
            published: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Drives one target through its lifecycle.
pub struct JobRunner {
    env: JobEnvironment,
    target: BuildTarget,
    key: JobKey,
    log: JobLog,
    workdir: PathBuf,
    cancel: Option<CancelSignal>,
    phases: Vec<JobPhase>,
    report: Option<BuildReport>,
    verification: Option<VerificationResult>,
    published: Vec<StoredAsset>,
}

impl JobRunner {
    pub fn new(env: JobEnvironment, target: BuildTarget) -> Self {
        let key = target.new_job_key();
        Self::with_key(env, target, key)
    }

    pub fn with_key(env: JobEnvironment, target: BuildTarget, key: JobKey) -> Self {
        let log = JobLog::new(env.logs.clone(), key.clone());
        let workdir = env.workdir_for(&key);
        Self {
            env,
            target,
            key,
            log,
            workdir,
            cancel: None,
            phases: vec![JobPhase::Pending],
            report: None,
            verification: None,
            published: Vec::new(),
        }
    }

    /// Stop the build when `cancel` becomes `true`.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn phase(&self) -> JobPhase {
        self.phases.last().copied().unwrap_or(JobPhase::Pending)
    }

    /// Run to a terminal state. Never returns an error; failures are in the outcome.
    pub async fn run(self) -> JobOutcome {
        let span = job_span(&self.key);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> JobOutcome {
        let started = Instant::now();
        emit_job_started(&self.key, self.env.builder.name());
        self.log
            .line(&format!(
                "kvpack job {} for {} using {} builder",
                self.key.job_id,
                self.target,
                self.env.builder.name()
            ))
            .await;

        let (state, artifact, failure) = match self.execute().await {
            Ok(artifact) => (TerminalState::Succeeded, Some(artifact), None),
            Err(failure) => {
                self.finish_failed(&failure).await;
                (TerminalState::Failed, None, Some(failure))
            }
        };

        self.record_phase(state.into());
        self.cleanup().await;

        let duration_ms = started.elapsed().as_millis() as u64;
        emit_job_finished(&self.key, state, duration_ms);

        JobOutcome {
            target: self.target,
            key: self.key,
            state,
            artifact,
            verification: self.verification,
            failure,
            phases: self.phases,
            published: self.published,
            duration_ms,
        }
    }

    async fn execute(&mut self) -> Result<Artifact, JobFailure> {
        self.enter(JobPhase::Building).await;
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .map_err(BuildInvocationError::Io)?;
        let invocation = self.invoke().await?;

        self.enter(JobPhase::Verifying).await;
        self.report = load_report(&invocation.report_path)?;
        let verification = verify(self.report.as_ref())?;
        self.log.line(&verification.summary()).await;
        self.verification = Some(verification.clone());
        if !verification.overall_success {
            return Err(JobFailure::PackagesFailed {
                failed_packages: verification.failed_packages,
            });
        }

        self.enter(JobPhase::Packaging).await;
        let packager = ArtifactPackager::new(self.workdir.join("dist"));
        let target = self.target.clone();
        let tree = invocation.tree.clone();
        let artifact = tokio::task::spawn_blocking(move || packager.package(&target, &tree))
            .await
            .map_err(|e| JobFailure::Aborted(e.to_string()))??;
        self.log
            .line(&format!(
                "packaged {} ({} bytes)",
                artifact.file_name(),
                artifact.size_bytes
            ))
            .await;

        self.enter(JobPhase::ChecksummingAndPublishingLogs).await;
        let artifact = tokio::task::spawn_blocking(move || checksum(artifact))
            .await
            .map_err(|e| JobFailure::Aborted(e.to_string()))??;
        if let Some(digest) = &artifact.digest {
            self.log
                .line(&format!("sha256 {}  {}", digest, artifact.file_name()))
                .await;
        }

        self.write_summary(TerminalState::Succeeded, None).await;
        self.publish_report().await?;
        self.log_phase(JobPhase::Succeeded).await;
        self.publish_log().await?;

        self.publish_file(AssetKind::DigestSidecar, &sidecar_path(&artifact.path))
            .await?;
        self.publish_file(AssetKind::Bundle, &artifact.path).await?;
        Ok(artifact)
    }

    async fn invoke(&self) -> Result<BuildInvocation, BuildInvocationError> {
        let build = self
            .env
            .builder
            .invoke(&self.target, &self.workdir, &self.log);

        match self.cancel.clone() {
            None => build.await,
            Some(mut cancel) => {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        self.log.line("build cancelled").await;
                        Err(BuildInvocationError::Cancelled)
                    }
                    result = build => result,
                }
            }
        }
    }

    async fn enter(&mut self, phase: JobPhase) {
        self.record_phase(phase);
        self.log_phase(phase).await;
    }

    fn record_phase(&mut self, phase: JobPhase) {
        self.phases.push(phase);
        emit_phase_entered(&self.key, phase);
    }

    async fn log_phase(&self, phase: JobPhase) {
        self.log.line(&format!("== {}", phase)).await;
    }

    /// Best-effort publishing for a failed job.
    async fn finish_failed(&mut self, failure: &JobFailure) {
        emit_job_failed(&self.key, failure);
        self.log.line(&format!("job failed: {}", failure)).await;
        for name in failure.failed_packages() {
            self.log.line(&format!("failed package: {}", name)).await;
        }

        if let Err(e) = self.publish_diagnostics().await {
            warn!(job = %self.key, error = %e, "failed to publish partial outputs");
        }
        self.write_summary(TerminalState::Failed, Some(failure)).await;
        if let Err(e) = self.publish_report().await {
            warn!(job = %self.key, error = %e, "failed to publish build report");
        }
        self.log_phase(JobPhase::Failed).await;
        if let Err(e) = self.publish_log().await {
            warn!(job = %self.key, error = %e, "failed to publish job log");
        }
    }

    async fn publish_diagnostics(&mut self) -> Result<(), JobFailure> {
        let tree = BuildOutputTree::new(output_dir(&self.workdir));
        if tree.file_count() == 0 {
            return Ok(());
        }

        let dest = self
            .workdir
            .join("diagnostics")
            .join(diagnostic_file_name(&self.target));
        let root = tree.root().to_path_buf();
        let bundle = dest.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = bundle.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_tarball(&root, &bundle).map_err(|e| match e {
                PackagingError::Io(io) => io,
                other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
            })
        })
        .await
        .map_err(|e| JobFailure::Aborted(e.to_string()))?
        .map_err(PackagingError::Io)?;

        self.publish_file(AssetKind::Diagnostic, &dest).await
    }

    async fn publish_report(&mut self) -> Result<(), JobFailure> {
        let path = report_path(&self.workdir);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let name = report_file_name(&self.target);
                self.publish_bytes(AssetKind::Report, &name, &data).await
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(kvpack_state::StorageError::Io(e).into()),
        }
    }

    async fn publish_log(&mut self) -> Result<(), JobFailure> {
        let data = self.log.contents().await;
        let name = log_file_name(&self.target);
        self.publish_bytes(AssetKind::Log, &name, &data).await
    }

    async fn publish_file(&mut self, kind: AssetKind, path: &Path) -> Result<(), JobFailure> {
        let data = tokio::fs::read(path)
            .await
            .map_err(kvpack_state::StorageError::Io)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.publish_bytes(kind, &name, &data).await
    }

    /// Store a file once per job. Re-publishing a name is a no-op.
    async fn publish_bytes(
        &mut self,
        kind: AssetKind,
        name: &str,
        data: &[u8],
    ) -> Result<(), JobFailure> {
        if self.published.iter().any(|a| a.file_name == name) {
            return Ok(());
        }
        let asset = self.env.artifacts.put(&self.key, kind, name, data).await?;
        self.published.push(asset);
        Ok(())
    }

    async fn write_summary(&self, state: TerminalState, failure: Option<&JobFailure>) {
        let summary = render_summary(
            &self.target,
            &self.key,
            state,
            self.report.as_ref(),
            self.verification.as_ref(),
            &BuildOutputTree::new(output_dir(&self.workdir)),
            failure,
        );
        for line in summary.lines() {
            self.log.line(line).await;
        }
    }

    async fn cleanup(&self) {
        if self.env.keep_workdirs {
            return;
        }
        match tokio::fs::remove_dir_all(&self.workdir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job = %self.key, error = %e, "failed to remove working directory"),
        }
    }
}

async fn cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: cancellation can no longer happen.
            std::future::pending::<()>().await;
        }
    }
}

/// Human-readable build summary appended to every job log.
pub fn render_summary(
    target: &BuildTarget,
    key: &JobKey,
    state: TerminalState,
    report: Option<&BuildReport>,
    verification: Option<&VerificationResult>,
    tree: &BuildOutputTree,
    failure: Option<&JobFailure>,
) -> String {
    let rule = "=".repeat(50);
    let thin = "-".repeat(30);
    let mut out = Vec::new();

    out.push(rule.clone());
    out.push("kvpack build summary".to_string());
    out.push(rule);
    out.push(format!("Target: {}", target));
    out.push(format!("Job: {}", key.job_id));
    out.push(format!("Finished: {}", chrono::Utc::now().to_rfc3339()));
    out.push(format!("Result: {}", state));

    match verification {
        Some(v) => out.push(format!("Build results: {}", v.summary())),
        None => out.push("Build results: no report".to_string()),
    }

    if let Some(report) = report {
        out.push("Package status:".to_string());
        out.push(thin.clone());
        for (name, result) in report.iter() {
            let mark = if result.passed() { "✓" } else { "✗" };
            let detail = result.detail.as_deref().unwrap_or("no detail");
            out.push(format!("{} {}: {}", mark, name, detail));
        }
    }

    let entries = tree.top_level_entries();
    if !entries.is_empty() {
        out.push("Output files:".to_string());
        out.push(thin);
        for entry in entries {
            out.push(format!("- {}", entry));
        }
    }

    if let Some(failure) = failure {
        out.push(format!("Failure: {}", failure));
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}
