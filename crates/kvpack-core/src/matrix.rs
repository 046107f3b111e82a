//! Fan out one job per target and collect every terminal state.
//!
//! Jobs run as independent tokio tasks. A job that fails, is cancelled or
//! panics only affects its own target; the run always reports every target.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use kvpack_state::JobKey;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

use crate::domain::{Artifact, BuildTarget, TargetRegistry};
use crate::job::{JobEnvironment, JobOutcome, JobRunner, TerminalState};
use crate::obs::emit_matrix_finished;

/// Starts matrix runs against a shared job environment.
#[derive(Clone)]
pub struct MatrixCoordinator {
    env: JobEnvironment,
}

impl MatrixCoordinator {
    pub fn new(env: JobEnvironment) -> Self {
        Self { env }
    }

    /// Launch every target's job. Jobs start running immediately.
    pub fn start(&self, registry: &TargetRegistry) -> MatrixRun {
        let started = Instant::now();
        let mut jobs = Vec::with_capacity(registry.len());
        let mut senders = HashMap::new();

        for target in registry.list_targets() {
            let (tx, rx) = watch::channel(false);
            let runner = JobRunner::new(self.env.clone(), target.clone()).with_cancel(rx);
            let key = runner.key().clone();
            let handle = tokio::spawn(runner.run());
            senders.insert(target.clone(), tx);
            jobs.push((target.clone(), key, handle));
        }

        MatrixRun {
            jobs,
            cancel: MatrixCancel {
                senders: Arc::new(senders),
            },
            started,
        }
    }

    /// Run the whole matrix and wait for every job.
    pub async fn run(&self, registry: &TargetRegistry) -> MatrixReport {
        self.start(registry).wait().await
    }
}

/// Cancels individual jobs of a running matrix. Cheap to clone.
#[derive(Clone, Debug)]
pub struct MatrixCancel {
    senders: Arc<HashMap<BuildTarget, watch::Sender<bool>>>,
}

impl MatrixCancel {
    /// Request cancellation of one target's job. Returns `false` for
    /// targets not in this run. Jobs past the build step finish normally.
    pub fn cancel(&self, target: &BuildTarget) -> bool {
        match self.senders.get(target) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for tx in self.senders.values() {
            tx.send_replace(true);
        }
    }
}

/// A matrix whose jobs are in flight.
pub struct MatrixRun {
    jobs: Vec<(BuildTarget, JobKey, JoinHandle<JobOutcome>)>,
    cancel: MatrixCancel,
    started: Instant,
}

impl MatrixRun {
    pub fn cancel_handle(&self) -> MatrixCancel {
        self.cancel.clone()
    }

    /// Job keys in registry order.
    pub fn keys(&self) -> Vec<JobKey> {
        self.jobs.iter().map(|(_, key, _)| key.clone()).collect()
    }

    /// Wait for every job to reach a terminal state.
    pub async fn wait(self) -> MatrixReport {
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        for (target, key, handle) in self.jobs {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job = %key, error = %e, "job task aborted");
                    JobOutcome::aborted(target, key, e.to_string())
                }
            };
            outcomes.push(outcome);
        }

        let report = MatrixReport {
            outcomes,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        emit_matrix_finished(
            report.succeeded_count(),
            report.failed_count(),
            report.duration_ms,
        );
        report
    }
}

/// Terminal states of every job in one run, in registry order.
#[derive(Debug)]
pub struct MatrixReport {
    pub outcomes: Vec<JobOutcome>,
    pub duration_ms: u64,
}

impl MatrixReport {
    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.succeeded_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn states(&self) -> BTreeMap<BuildTarget, TerminalState> {
        self.outcomes
            .iter()
            .map(|o| (o.target.clone(), o.state))
            .collect()
    }

    pub fn outcome(&self, target: &BuildTarget) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| &o.target == target)
    }

    /// Bundles of the succeeded jobs.
    pub fn artifacts(&self) -> Vec<&Artifact> {
        self.outcomes
            .iter()
            .filter_map(|o| o.artifact.as_ref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ScriptedBuilder, ScriptedOutcome};
    use kvpack_state::fakes::{MemoryArtifactStore, MemoryLogStore};
    use std::time::Duration;

    fn coordinator(builder: Arc<ScriptedBuilder>, work: &std::path::Path) -> MatrixCoordinator {
        MatrixCoordinator::new(JobEnvironment::new(
            builder,
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            work,
        ))
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently() {
        let builder = Arc::new(ScriptedBuilder::new().with_fallback(
            ScriptedOutcome::success(&["a"]).with_delay(Duration::from_millis(100)),
        ));
        let work = tempfile::tempdir().unwrap();

        let report = coordinator(builder.clone(), work.path())
            .run(&TargetRegistry::default())
            .await;

        assert_eq!(report.succeeded_count(), 3);
        assert_eq!(builder.peak_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_panicking_job_is_isolated() {
        let registry = TargetRegistry::default();
        let targets = registry.list_targets();
        let builder = Arc::new(
            ScriptedBuilder::new()
                .with_fallback(ScriptedOutcome::success(&["a"]))
                .with_outcome(&targets[1], ScriptedOutcome::panic()),
        );
        let work = tempfile::tempdir().unwrap();

        let report = coordinator(builder, work.path()).run(&registry).await;

        assert_eq!(report.succeeded_count(), 2);
        assert_eq!(report.failed_count(), 1);
        let failed = report.outcome(&targets[1]).unwrap();
        assert_eq!(failed.state, TerminalState::Failed);
        assert!(failed
            .failure
            .as_ref()
            .is_some_and(|f| f.to_string().contains("job task aborted")));
    }

    #[tokio::test]
    async fn test_cancel_one_target() {
        let registry = TargetRegistry::default();
        let targets = registry.list_targets().to_vec();
        let builder = Arc::new(
            ScriptedBuilder::new()
                .with_fallback(ScriptedOutcome::success(&["a"]))
                .with_outcome(&targets[0], ScriptedOutcome::hang()),
        );
        let work = tempfile::tempdir().unwrap();

        let run = coordinator(builder, work.path()).start(&registry);
        let cancel = run.cancel_handle();
        assert!(cancel.cancel(&targets[0]));
        assert!(!cancel.cancel(&BuildTarget::new("debian12", "amd64")));
        let report = run.wait().await;

        let states = report.states();
        assert_eq!(states[&targets[0]], TerminalState::Failed);
        assert_eq!(states[&targets[1]], TerminalState::Succeeded);
        assert_eq!(states[&targets[2]], TerminalState::Succeeded);
        assert!(report.outcome(&targets[0]).unwrap().failure.as_ref().unwrap().is_cancelled());
    }
}
