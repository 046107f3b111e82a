//! Structured lifecycle events for jobs, matrix runs and releases.
//!
//! Every event carries an `event` field so JSON output can be filtered
//! without parsing messages.

use kvpack_state::JobKey;
use tracing::{info, warn, Span};

use crate::job::{JobPhase, TerminalState};

/// Span covering one job. Attach with `tracing::Instrument`.
pub fn job_span(key: &JobKey) -> Span {
    tracing::info_span!(
        "kvpack.job",
        slug = %key.slug(),
        job_id = %key.short_id(),
    )
}

pub fn emit_job_started(key: &JobKey, builder: &str) {
    info!(event = "job.started", job = %key, builder = %builder);
}

pub fn emit_phase_entered(key: &JobKey, phase: JobPhase) {
    info!(event = "job.phase", job = %key, phase = %phase);
}

pub fn emit_job_finished(key: &JobKey, state: TerminalState, duration_ms: u64) {
    info!(
        event = "job.finished",
        job = %key,
        state = %state,
        duration_ms = duration_ms,
    );
}

/// A job failed. Warning level.
pub fn emit_job_failed(key: &JobKey, error: &dyn std::fmt::Display) {
    warn!(event = "job.failed", job = %key, error = %error);
}

pub fn emit_matrix_finished(succeeded: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "matrix.finished",
        succeeded = succeeded,
        failed = failed,
        duration_ms = duration_ms,
    );
}

pub fn emit_release_published(tag: &str, assets: usize) {
    info!(event = "release.published", tag = %tag, assets = assets);
}

/// A bundle left out of a release. Warning level.
pub fn emit_asset_skipped(file_name: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "release.asset_skipped", file = %file_name, reason = %reason);
}
