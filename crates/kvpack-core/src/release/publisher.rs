//! Publish a release manifest.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kvpack_state::{ArtifactStore, ReleaseAssetRecord, ReleaseFile, ReleaseRecord, ReleaseStore};
use serde::Serialize;

use crate::domain::{PublishError, ReleaseManifest};
use crate::obs::emit_release_published;

/// Name of the notes document attached to every release.
pub const NOTES_FILE_NAME: &str = "RELEASE_NOTES.md";

/// What a publish produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub tag: String,
    /// Every attached file, in attach order.
    pub files: Vec<String>,
    pub published_at: DateTime<Utc>,
    /// Whether an earlier release with the same tag was replaced.
    pub replaced: bool,
}

/// Creates the externally visible release for a manifest.
///
/// Publishing the same tag again replaces the earlier release.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, manifest: &ReleaseManifest) -> Result<PublishReceipt, PublishError>;
}

/// Publisher backed by a [`ReleaseStore`], reading bundle bytes from the
/// artifact store they were published to.
#[derive(Clone)]
pub struct StorePublisher {
    artifacts: Arc<dyn ArtifactStore>,
    releases: Arc<dyn ReleaseStore>,
}

impl StorePublisher {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, releases: Arc<dyn ReleaseStore>) -> Self {
        Self {
            artifacts,
            releases,
        }
    }
}

#[async_trait]
impl Publisher for StorePublisher {
    async fn publish(&self, manifest: &ReleaseManifest) -> Result<PublishReceipt, PublishError> {
        let mut files = Vec::with_capacity(manifest.assets.len() * 2 + 1);
        let mut records = Vec::with_capacity(files.capacity());

        for asset in &manifest.assets {
            for (stored, digest) in [
                (&asset.bundle, asset.artifact.digest.clone()),
                (&asset.sidecar, None),
            ] {
                let data = self.artifacts.get(stored).await.map_err(|e| {
                    PublishError::Transport {
                        transport: "artifact-store".to_string(),
                        detail: format!("reading {}: {}", stored.file_name, e),
                    }
                })?;
                records.push(ReleaseAssetRecord {
                    file_name: stored.file_name.clone(),
                    size_bytes: data.len() as u64,
                    digest,
                });
                files.push(ReleaseFile {
                    file_name: stored.file_name.clone(),
                    data,
                });
            }
        }

        records.push(ReleaseAssetRecord {
            file_name: NOTES_FILE_NAME.to_string(),
            size_bytes: manifest.notes.len() as u64,
            digest: None,
        });
        files.push(ReleaseFile {
            file_name: NOTES_FILE_NAME.to_string(),
            data: manifest.notes.clone().into_bytes(),
        });

        let replaced = self.releases.get(&manifest.tag).await?.is_some();
        let record = self
            .releases
            .upsert(
                ReleaseRecord {
                    tag: manifest.tag.clone(),
                    assets: records,
                    notes: manifest.notes.clone(),
                    published_at: Utc::now(),
                },
                files,
            )
            .await?;

        emit_release_published(&record.tag, manifest.assets.len());
        Ok(PublishReceipt {
            tag: record.tag,
            files: record.assets.into_iter().map(|a| a.file_name).collect(),
            published_at: record.published_at,
            replaced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{sha256_bytes, sidecar_line};
    use crate::domain::{Artifact, BuildTarget, ReleaseAsset};
    use kvpack_state::fakes::{MemoryArtifactStore, MemoryReleaseStore};
    use kvpack_state::{AssetKind, JobKey};
    use std::path::PathBuf;

    async fn manifest(store: &MemoryArtifactStore, tag: &str) -> ReleaseManifest {
        let target = BuildTarget::new("ubuntu20.04", "amd64");
        let key = JobKey::with_id("ubuntu20.04", "amd64", "job-1");
        let digest = sha256_bytes(b"bundle");
        let bundle = store
            .put(&key, AssetKind::Bundle, &target.bundle_name(), b"bundle")
            .await
            .unwrap();
        let sidecar = store
            .put(
                &key,
                AssetKind::DigestSidecar,
                &target.sidecar_name(),
                sidecar_line(&digest, &target.bundle_name()).as_bytes(),
            )
            .await
            .unwrap();
        ReleaseManifest {
            tag: tag.to_string(),
            assets: vec![ReleaseAsset {
                artifact: Artifact {
                    path: PathBuf::from(target.bundle_name()),
                    target,
                    size_bytes: 6,
                    digest: Some(digest),
                },
                bundle,
                sidecar,
            }],
            notes: "notes".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_attaches_bundles_sidecars_and_notes() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let releases = Arc::new(MemoryReleaseStore::new());
        let manifest = manifest(&artifacts, "v1.0.0").await;

        let receipt = StorePublisher::new(artifacts, releases.clone())
            .publish(&manifest)
            .await
            .unwrap();

        assert_eq!(
            receipt.files,
            vec![
                "output_ubuntu20.04_amd64.tar.gz",
                "output_ubuntu20.04_amd64.tar.gz.sha256",
                NOTES_FILE_NAME
            ]
        );
        assert!(!receipt.replaced);
        let record = releases.get("v1.0.0").await.unwrap().unwrap();
        assert_eq!(record.assets[0].digest, Some(sha256_bytes(b"bundle")));
        assert_eq!(
            releases.read_file("v1.0.0", NOTES_FILE_NAME).await.unwrap(),
            b"notes"
        );
    }

    #[tokio::test]
    async fn test_republish_same_tag_overwrites() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let releases = Arc::new(MemoryReleaseStore::new());
        let manifest = manifest(&artifacts, "v1.0.0").await;
        let publisher = StorePublisher::new(artifacts, releases.clone());

        publisher.publish(&manifest).await.unwrap();
        let receipt = publisher.publish(&manifest).await.unwrap();

        assert!(receipt.replaced);
        assert_eq!(releases.list().await.unwrap().len(), 1);
        assert_eq!(releases.upsert_count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_bundle_is_transport_error() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let releases = Arc::new(MemoryReleaseStore::new());
        let manifest = manifest(&MemoryArtifactStore::new(), "v1.0.0").await;

        let err = StorePublisher::new(artifacts, releases.clone())
            .publish(&manifest)
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Transport { .. }));
        assert!(releases.get("v1.0.0").await.unwrap().is_none());
    }
}
