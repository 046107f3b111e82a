//! End-to-end matrix and release scenarios with scripted builders.

use std::sync::Arc;

use kvpack_core::builder::{ScriptedBuilder, ScriptedOutcome};
use kvpack_core::checksum::{parse_sidecar, sha256_bytes};
use kvpack_core::release::{
    DrivingEvent, NotesCatalog, ReleaseAggregator, ReleaseTrigger, StorePublisher,
};
use kvpack_core::{
    BuildInvocationError, BuildTarget, JobEnvironment, JobFailure, MatrixCoordinator,
    ReleaseError, ReleasePipeline, TargetRegistry, TerminalState,
};
use kvpack_state::fakes::{MemoryArtifactStore, MemoryLogStore, MemoryReleaseStore};
use kvpack_state::{
    ArtifactStore, AssetKind, FsArtifactStore, FsLogStore, FsReleaseStore, LogStore, ReleaseStore,
};
use tempfile::TempDir;

const PACKAGES: &[&str] = &["etcd-cpp-apiv3", "gflags", "glog", "jsoncpp"];

struct World {
    coordinator: MatrixCoordinator,
    logs: Arc<dyn LogStore>,
    artifacts: Arc<dyn ArtifactStore>,
    releases: Arc<dyn ReleaseStore>,
    _dir: TempDir,
}

fn memory_world(builder: ScriptedBuilder) -> (World, Arc<MemoryReleaseStore>) {
    let dir = tempfile::tempdir().unwrap();
    let logs: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let releases = Arc::new(MemoryReleaseStore::new());
    let env = JobEnvironment::new(
        Arc::new(builder),
        logs.clone(),
        artifacts.clone(),
        dir.path().join("work"),
    );
    (
        World {
            coordinator: MatrixCoordinator::new(env),
            logs,
            artifacts,
            releases: releases.clone(),
            _dir: dir,
        },
        releases,
    )
}

fn fs_world(builder: ScriptedBuilder) -> World {
    let dir = tempfile::tempdir().unwrap();
    let logs: Arc<dyn LogStore> = Arc::new(FsLogStore::new(dir.path().join("logs")).unwrap());
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FsArtifactStore::new(dir.path().join("artifacts")).unwrap());
    let releases: Arc<dyn ReleaseStore> =
        Arc::new(FsReleaseStore::new(dir.path().join("releases")).unwrap());
    let env = JobEnvironment::new(
        Arc::new(builder),
        logs.clone(),
        artifacts.clone(),
        dir.path().join("work"),
    );
    World {
        coordinator: MatrixCoordinator::new(env),
        logs,
        artifacts,
        releases,
        _dir: dir,
    }
}

/// Another coordinator over the same stores, driven by a different builder.
fn rebuild_with(world: &World, builder: ScriptedBuilder) -> MatrixCoordinator {
    MatrixCoordinator::new(JobEnvironment::new(
        Arc::new(builder),
        world.logs.clone(),
        world.artifacts.clone(),
        world._dir.path().join("work"),
    ))
}

fn pipeline(world: &World) -> ReleasePipeline {
    ReleasePipeline::new(
        ReleaseTrigger::new("^v").unwrap(),
        ReleaseAggregator::new(world.artifacts.clone()),
        Arc::new(StorePublisher::new(
            world.artifacts.clone(),
            world.releases.clone(),
        )),
        NotesCatalog::default(),
    )
}

fn targets() -> (TargetRegistry, BuildTarget, BuildTarget, BuildTarget) {
    let registry = TargetRegistry::default();
    let t = registry.list_targets().to_vec();
    (registry, t[0].clone(), t[1].clone(), t[2].clone())
}

#[tokio::test]
async fn one_target_without_output_does_not_affect_siblings() {
    let (registry, a, b, c) = targets();
    let builder = ScriptedBuilder::new()
        .with_fallback(ScriptedOutcome::success(PACKAGES))
        .with_outcome(&b, ScriptedOutcome::without_report(&[]));
    let (world, _) = memory_world(builder);

    let report = world.coordinator.run(&registry).await;

    assert_eq!(report.succeeded_count(), 2);
    assert_eq!(report.failed_count(), 1);
    let states = report.states();
    assert_eq!(states[&a], TerminalState::Succeeded);
    assert_eq!(states[&b], TerminalState::Failed);
    assert_eq!(states[&c], TerminalState::Succeeded);

    let failed = report.outcome(&b).unwrap();
    assert!(matches!(
        failed.failure,
        Some(JobFailure::Build(BuildInvocationError::NoOutput { .. }))
    ));

    let bundles = world.artifacts.list(Some(AssetKind::Bundle)).await.unwrap();
    let mut names: Vec<String> = bundles.into_iter().map(|b| b.file_name).collect();
    names.sort();
    assert_eq!(names, vec![a.bundle_name(), c.bundle_name()]);

    // B still has its log, but nothing else.
    let b_assets: Vec<_> = world
        .artifacts
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|asset| asset.key == failed.key)
        .collect();
    assert_eq!(b_assets.len(), 1);
    assert_eq!(b_assets[0].kind, AssetKind::Log);
    assert!(!world.logs.read(&failed.key).await.unwrap().is_empty());
}

#[tokio::test]
async fn tag_push_after_full_success_publishes_every_bundle() {
    let (registry, a, b, c) = targets();
    let world = fs_world(ScriptedBuilder::new().with_fallback(ScriptedOutcome::success(PACKAGES)));
    let pipeline = pipeline(&world);

    let tag = pipeline
        .release_tag(&DrivingEvent::from_ref("refs/tags/v1.0.0"))
        .unwrap();
    let run = world.coordinator.start(&registry);
    let outcome = pipeline.run(&tag, [run.wait()]).await.unwrap();

    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.manifest.assets.len(), 3);

    let record = world.releases.get("v1.0.0").await.unwrap().unwrap();
    let bundles: Vec<&str> = record
        .assets
        .iter()
        .map(|a| a.file_name.as_str())
        .filter(|n| n.ends_with(".tar.gz"))
        .collect();
    let sidecars = record
        .assets
        .iter()
        .filter(|a| a.file_name.ends_with(".sha256"))
        .count();
    assert_eq!(bundles.len(), 3);
    assert_eq!(sidecars, 3);

    for target in [&a, &b, &c] {
        assert!(record.notes.contains(&target.to_string()), "notes miss {}", target);

        let bundle = world
            .releases
            .read_file("v1.0.0", &target.bundle_name())
            .await
            .unwrap();
        let sidecar = world
            .releases
            .read_file("v1.0.0", &target.sidecar_name())
            .await
            .unwrap();
        let entries = parse_sidecar(&String::from_utf8(sidecar).unwrap()).unwrap();
        assert_eq!(entries[0].file_name, target.bundle_name());
        assert_eq!(entries[0].digest, sha256_bytes(&bundle));
    }
}

#[tokio::test]
async fn tag_push_with_every_target_failed_publishes_nothing() {
    let (registry, _, _, _) = targets();
    let (world, releases) = memory_world(
        ScriptedBuilder::new().with_fallback(ScriptedOutcome::with_results(&["gflags"], &["glog"])),
    );
    let pipeline = pipeline(&world);

    let run = world.coordinator.start(&registry);
    let err = pipeline.run("v1.0.1", [run.wait()]).await.unwrap_err();

    assert!(matches!(err, ReleaseError::NoAssets { .. }));
    assert_eq!(releases.upsert_count(), 0);
    assert!(releases.get("v1.0.1").await.unwrap().is_none());
}

#[tokio::test]
async fn non_tag_events_do_not_release() {
    let (world, _) = memory_world(ScriptedBuilder::new());
    let pipeline = pipeline(&world);

    for reference in ["refs/heads/main", "refs/pull/12/merge", "refs/tags/nightly", ""] {
        assert!(matches!(
            pipeline.release_tag(&DrivingEvent::from_ref(reference)),
            Err(ReleaseError::NotReleaseEvent(_))
        ));
    }
}

#[tokio::test]
async fn release_waits_for_every_concurrent_run() {
    let (registry, a, b, c) = targets();
    let builder = ScriptedBuilder::new()
        .with_fallback(ScriptedOutcome::success(PACKAGES))
        .with_outcome(
            &c,
            ScriptedOutcome::success(PACKAGES).with_delay(std::time::Duration::from_millis(150)),
        );
    let (world, _) = memory_world(builder);
    let pipeline = pipeline(&world);

    let first = world
        .coordinator
        .start(&registry.select(&[a.slug(), b.slug()]).unwrap());
    let second = world.coordinator.start(&registry.select(&[c.slug()]).unwrap());

    let outcome = pipeline
        .run("v2.0.0", [first.wait(), second.wait()])
        .await
        .unwrap();

    // The slow target finished before collection, so it is in the release.
    assert_eq!(outcome.runs.len(), 2);
    let names: Vec<String> = outcome
        .manifest
        .assets
        .iter()
        .map(|asset| asset.artifact.file_name())
        .collect();
    assert_eq!(
        names,
        vec![c.bundle_name(), a.bundle_name(), b.bundle_name()]
    );
}

#[tokio::test]
async fn republishing_a_tag_replaces_the_release() {
    let (registry, _, _, _) = targets();
    let world = fs_world(ScriptedBuilder::new().with_fallback(ScriptedOutcome::success(PACKAGES)));
    let pipeline = pipeline(&world);

    let first = pipeline
        .run("v3.0.0", [world.coordinator.run(&registry)])
        .await
        .unwrap();
    let second = pipeline
        .run("v3.0.0", [world.coordinator.run(&registry)])
        .await
        .unwrap();

    assert!(!first.receipt.replaced);
    assert!(second.receipt.replaced);
    let releases = world.releases.list().await.unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].assets.len(), 7);
}

#[tokio::test]
async fn all_failed_tag_run_ignores_bundles_from_earlier_runs() {
    let (registry, _, _, _) = targets();
    let (world, releases) =
        memory_world(ScriptedBuilder::new().with_fallback(ScriptedOutcome::success(PACKAGES)));
    let earlier = world.coordinator.run(&registry).await;
    assert!(earlier.all_succeeded());

    let failing = rebuild_with(
        &world,
        ScriptedBuilder::new().with_fallback(ScriptedOutcome::with_results(&["gflags"], &["glog"])),
    );
    let pipeline = pipeline(&world);
    let err = pipeline
        .run("v4.0.0", [failing.run(&registry)])
        .await
        .unwrap_err();

    assert!(matches!(err, ReleaseError::NoAssets { .. }));
    assert_eq!(releases.upsert_count(), 0);
}

#[tokio::test]
async fn target_failing_now_does_not_ship_its_old_bundle() {
    let (registry, a, b, c) = targets();
    let world = fs_world(ScriptedBuilder::new().with_fallback(ScriptedOutcome::success(PACKAGES)));
    world.coordinator.run(&registry).await;

    let rerun = rebuild_with(
        &world,
        ScriptedBuilder::new()
            .with_fallback(ScriptedOutcome::success(PACKAGES))
            .with_outcome(&b, ScriptedOutcome::with_results(&["gflags"], &["glog"])),
    );
    let outcome = pipeline(&world)
        .run("v4.1.0", [rerun.run(&registry)])
        .await
        .unwrap();

    let mut released: Vec<String> = outcome
        .manifest
        .assets
        .iter()
        .map(|asset| asset.artifact.file_name())
        .collect();
    released.sort();
    let mut expected = vec![a.bundle_name(), c.bundle_name()];
    expected.sort();
    assert_eq!(released, expected);

    // Released bundles come from the awaited run, not the earlier one.
    let run = &outcome.runs[0];
    for asset in &outcome.manifest.assets {
        let job = &run.outcome(&asset.artifact.target).unwrap().key;
        assert_eq!(&asset.bundle.key, job);
    }

    // The explicit store-wide release still sees the earlier bundle of b.
    let stored = pipeline(&world).run_from_store("v4.1.1").await.unwrap();
    assert_eq!(stored.manifest.assets.len(), 3);
}
