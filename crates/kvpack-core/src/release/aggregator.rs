//! Collect verified bundles from the artifact store for a release.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use kvpack_state::{ArtifactStore, AssetKind, JobKey, StoredAsset};
use tracing::{debug, error};

use crate::checksum::{parse_sidecar, verify_bytes};
use crate::domain::{bundle_slug, Artifact, BuildTarget, ReleaseAsset, ReleaseError};
use crate::matrix::MatrixReport;
use crate::obs::emit_asset_skipped;

/// Wait until every run has reached a terminal state.
pub async fn barrier<I, F>(runs: I) -> Vec<MatrixReport>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = MatrixReport>,
{
    futures::future::join_all(runs).await
}

/// Reads published bundles and their sidecars.
#[derive(Clone)]
pub struct ReleaseAggregator {
    artifacts: Arc<dyn ArtifactStore>,
}

impl ReleaseAggregator {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }

    /// Every bundle in the store whose sidecar matches its bytes, sorted by
    /// file name.
    ///
    /// When a name was published more than once the latest copy is used.
    /// Fails with `NoAssets` when nothing qualifies.
    pub async fn collect(&self, tag: &str) -> Result<Vec<ReleaseAsset>, ReleaseError> {
        self.collect_matching(tag, None).await
    }

    /// Like [`collect`](Self::collect), restricted to files published by
    /// the given jobs.
    pub async fn collect_from(
        &self,
        tag: &str,
        jobs: &HashSet<JobKey>,
    ) -> Result<Vec<ReleaseAsset>, ReleaseError> {
        self.collect_matching(tag, Some(jobs)).await
    }

    async fn collect_matching(
        &self,
        tag: &str,
        jobs: Option<&HashSet<JobKey>>,
    ) -> Result<Vec<ReleaseAsset>, ReleaseError> {
        let published_by_job =
            |asset: &StoredAsset| jobs.map_or(true, |jobs| jobs.contains(&asset.key));
        let mut bundles = self.artifacts.list(Some(AssetKind::Bundle)).await?;
        bundles.retain(published_by_job);
        let mut sidecars = self.artifacts.list(Some(AssetKind::DigestSidecar)).await?;
        sidecars.retain(published_by_job);

        // `list` is oldest first, so later inserts win.
        let mut latest: BTreeMap<String, StoredAsset> = BTreeMap::new();
        for bundle in bundles {
            latest.insert(bundle.file_name.clone(), bundle);
        }

        let mut assets = Vec::with_capacity(latest.len());
        for (name, bundle) in latest {
            match self.verify_bundle(&bundle, &sidecars).await {
                Ok(asset) => {
                    debug!(file = %name, job = %bundle.key, "bundle selected for release");
                    assets.push(asset);
                }
                Err(reason) => {
                    error!(file = %name, job = %bundle.key, "bundle excluded from release");
                    emit_asset_skipped(&name, &reason);
                }
            }
        }

        if assets.is_empty() {
            return Err(ReleaseError::NoAssets {
                tag: tag.to_string(),
            });
        }
        Ok(assets)
    }

    async fn verify_bundle(
        &self,
        bundle: &StoredAsset,
        sidecars: &[StoredAsset],
    ) -> Result<ReleaseAsset, String> {
        let target = BuildTarget::from_job_key(&bundle.key);
        if bundle_slug(&bundle.file_name) != Some(target.slug().as_str()) {
            return Err(format!("name does not match target {}", target));
        }

        let sidecar_name = target.sidecar_name();
        let sidecar = sidecars
            .iter()
            .find(|s| s.key == bundle.key && s.file_name == sidecar_name)
            .ok_or_else(|| "digest sidecar missing".to_string())?;

        let sidecar_text = self
            .artifacts
            .get(sidecar)
            .await
            .map_err(|e| format!("cannot read sidecar: {}", e))?;
        let entries = parse_sidecar(&String::from_utf8_lossy(&sidecar_text))
            .map_err(|e| e.to_string())?;
        let entry = entries
            .iter()
            .find(|e| e.file_name == bundle.file_name)
            .ok_or_else(|| "sidecar does not list the bundle".to_string())?;

        let data = self
            .artifacts
            .get(bundle)
            .await
            .map_err(|e| format!("cannot read bundle: {}", e))?;
        verify_bytes(entry, &data).map_err(|e| e.to_string())?;

        Ok(ReleaseAsset {
            artifact: Artifact {
                path: PathBuf::from(&bundle.file_name),
                target,
                size_bytes: data.len() as u64,
                digest: Some(entry.digest.clone()),
            },
            bundle: bundle.clone(),
            sidecar: sidecar.clone(),
        })
    }
}
