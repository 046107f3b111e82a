//! Tag-driven release: barrier, collection, notes and publishing.

pub mod aggregator;
pub mod notes;
pub mod publisher;
pub mod trigger;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use kvpack_state::JobKey;
use tracing::info;

use crate::domain::{ReleaseAsset, ReleaseError, ReleaseManifest};
use crate::matrix::MatrixReport;

pub use aggregator::{barrier, ReleaseAggregator};
pub use notes::{compose, compose_with, NotesCatalog};
pub use publisher::{PublishReceipt, Publisher, StorePublisher};
pub use trigger::{DrivingEvent, ReleaseTrigger};

/// Result of a completed release.
#[derive(Debug)]
pub struct ReleaseOutcome {
    pub manifest: ReleaseManifest,
    pub receipt: PublishReceipt,
    /// Reports of the runs the release waited for.
    pub runs: Vec<MatrixReport>,
}

/// Wires trigger, aggregator, notes and publisher together.
pub struct ReleasePipeline {
    trigger: ReleaseTrigger,
    aggregator: ReleaseAggregator,
    publisher: Arc<dyn Publisher>,
    catalog: NotesCatalog,
}

impl ReleasePipeline {
    pub fn new(
        trigger: ReleaseTrigger,
        aggregator: ReleaseAggregator,
        publisher: Arc<dyn Publisher>,
        catalog: NotesCatalog,
    ) -> Self {
        Self {
            trigger,
            aggregator,
            publisher,
            catalog,
        }
    }

    /// Release tag for the event, or `NotReleaseEvent`.
    pub fn release_tag(&self, event: &DrivingEvent) -> Result<String, ReleaseError> {
        self.trigger.release_tag(event)
    }

    /// Wait for every run, then publish `tag` from the bundles those runs
    /// produced.
    ///
    /// Only jobs that succeeded in the awaited runs contribute; anything else
    /// in the artifact store is ignored. Failed targets only shrink the
    /// release, and nothing is published when no verified bundle remains.
    pub async fn run<I, F>(&self, tag: &str, runs: I) -> Result<ReleaseOutcome, ReleaseError>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = MatrixReport>,
    {
        let runs = barrier(runs).await;
        let failed: usize = runs.iter().map(MatrixReport::failed_count).sum();
        info!(tag = %tag, runs = runs.len(), failed_targets = failed, "matrix runs finished");

        let jobs: HashSet<JobKey> = runs
            .iter()
            .flat_map(|run| run.outcomes.iter())
            .filter(|outcome| outcome.succeeded())
            .map(|outcome| outcome.key.clone())
            .collect();
        let assets = self.aggregator.collect_from(tag, &jobs).await?;
        self.publish(tag, assets, runs).await
    }

    /// Publish `tag` from every verified bundle in the artifact store,
    /// whichever run produced it. The latest copy of each bundle wins.
    pub async fn run_from_store(&self, tag: &str) -> Result<ReleaseOutcome, ReleaseError> {
        let assets = self.aggregator.collect(tag).await?;
        self.publish(tag, assets, Vec::new()).await
    }

    async fn publish(
        &self,
        tag: &str,
        assets: Vec<ReleaseAsset>,
        runs: Vec<MatrixReport>,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let artifacts: Vec<_> = assets.iter().map(|a| a.artifact.clone()).collect();
        let manifest = ReleaseManifest {
            tag: tag.to_string(),
            notes: compose_with(&artifacts, tag, &self.catalog),
            assets,
        };

        let receipt = self.publisher.publish(&manifest).await?;
        Ok(ReleaseOutcome {
            manifest,
            receipt,
            runs,
        })
    }
}
