//! Builder that plays back canned outcomes per target.
//!
//! Used to exercise jobs, the matrix and releases without a container
//! runtime. Outcomes are keyed by target slug.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{output_dir, report_path, BuildInvocation, BuildOutputTree, Builder, JobLog};
use crate::domain::{BuildInvocationError, BuildReport, BuildTarget, PackageResult};

#[derive(Debug, Clone)]
enum Behavior {
    Produce,
    Unavailable(String),
    TimedOut(u64),
    Hang,
    Panic,
}

/// What the scripted builder does for one target.
#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    files: Vec<(String, Vec<u8>)>,
    report: Option<String>,
    lines: Vec<String>,
    delay: Duration,
    exit_code: Option<i32>,
    behavior: Behavior,
}

impl ScriptedOutcome {
    fn produce(files: Vec<(String, Vec<u8>)>, report: Option<String>) -> Self {
        Self {
            files,
            report,
            lines: Vec::new(),
            delay: Duration::ZERO,
            exit_code: Some(0),
            behavior: Behavior::Produce,
        }
    }

    fn behave(behavior: Behavior) -> Self {
        Self {
            behavior,
            exit_code: None,
            ..Self::produce(Vec::new(), None)
        }
    }

    /// Every package builds; one static library per package is installed.
    pub fn success(packages: &[&str]) -> Self {
        Self::with_results(packages, &[])
    }

    /// `passed` build, `failed` do not. Failed packages install nothing.
    pub fn with_results(passed: &[&str], failed: &[&str]) -> Self {
        let mut report = BuildReport::new();
        let mut files = Vec::new();
        for name in passed {
            report.insert(*name, PackageResult::ok("Built successfully"));
            files.push((
                format!("lib/lib{}.a", name),
                format!("!<arch>\n{}\n", name).into_bytes(),
            ));
        }
        for name in failed {
            report.insert(*name, PackageResult::failed("Build failed"));
        }
        let text = report.to_json_pretty().unwrap_or_else(|_| "{}".to_string());
        let mut outcome = Self::produce(files, Some(text));
        if !failed.is_empty() {
            outcome.exit_code = Some(1);
        }
        outcome
    }

    /// Files only, no report.
    pub fn without_report(files: &[(&str, &[u8])]) -> Self {
        Self::produce(
            files
                .iter()
                .map(|(p, d)| (p.to_string(), d.to_vec()))
                .collect(),
            None,
        )
    }

    /// Write `text` verbatim as the report.
    pub fn raw_report(files: &[(&str, &[u8])], text: &str) -> Self {
        let mut outcome = Self::without_report(files);
        outcome.report = Some(text.to_string());
        outcome
    }

    pub fn unavailable(detail: &str) -> Self {
        Self::behave(Behavior::Unavailable(detail.to_string()))
    }

    pub fn timed_out(secs: u64) -> Self {
        Self::behave(Behavior::TimedOut(secs))
    }

    /// Never returns; only cancellation ends it.
    pub fn hang() -> Self {
        Self::behave(Behavior::Hang)
    }

    /// Panics inside the job task.
    pub fn panic() -> Self {
        Self::behave(Behavior::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_lines(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }
}

/// Scripted [`Builder`].
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    outcomes: HashMap<String, ScriptedOutcome>,
    fallback: Option<ScriptedOutcome>,
    invocations: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, target: &BuildTarget, outcome: ScriptedOutcome) -> Self {
        self.outcomes.insert(target.slug(), outcome);
        self
    }

    /// Outcome for targets without their own.
    pub fn with_fallback(mut self, outcome: ScriptedOutcome) -> Self {
        self.fallback = Some(outcome);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Highest number of builds observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn play(
        &self,
        outcome: &ScriptedOutcome,
        target: &BuildTarget,
        workdir: &Path,
        log: &JobLog,
    ) -> Result<BuildInvocation, BuildInvocationError> {
        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }
        for line in &outcome.lines {
            log.line(line).await;
        }

        match &outcome.behavior {
            Behavior::Produce => {}
            Behavior::Unavailable(detail) => {
                return Err(BuildInvocationError::EnvironmentUnavailable(detail.clone()))
            }
            Behavior::TimedOut(secs) => {
                return Err(BuildInvocationError::TimedOut { secs: *secs })
            }
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Panic => panic!("scripted builder panic for {}", target),
        }

        let out = output_dir(workdir);
        tokio::fs::create_dir_all(&out).await?;
        for (relative, data) in &outcome.files {
            let path = out.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, data).await?;
        }

        let report = report_path(workdir);
        if let Some(text) = &outcome.report {
            if let Some(parent) = report.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&report, text).await?;
        }
        log.line(&format!("builder exited with status {:?}", outcome.exit_code))
            .await;

        BuildInvocation {
            tree: BuildOutputTree::new(out),
            report_path: report,
            exit_code: outcome.exit_code,
        }
        .require_output()
    }
}

/// Decrements the in-flight counter however the build ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn invoke(
        &self,
        target: &BuildTarget,
        workdir: &Path,
        log: &JobLog,
    ) -> Result<BuildInvocation, BuildInvocationError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let outcome = self
            .outcomes
            .get(&target.slug())
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                BuildInvocationError::EnvironmentUnavailable(format!(
                    "no scripted outcome for {}",
                    target
                ))
            })?;
        self.play(outcome, target, workdir, log).await
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
