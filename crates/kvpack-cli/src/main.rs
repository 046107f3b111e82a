//! kvpack - multi-target build-and-release orchestrator
//!
//! ## Commands
//!
//! - `targets`: List the configured build matrix
//! - `build`: Build every target, and release on a version tag
//! - `release`: Publish a release from the latest bundles in the artifact store
//! - `verify-report`: Check a build report file
//! - `checksum`: Create or verify `.sha256` sidecars
//! - `notes`: Render release notes for the bundles in the artifact store

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use kvpack_core::checksum::{checksum, verify_sidecar};
use kvpack_core::config::DEFAULT_CONFIG_FILE;
use kvpack_core::release::{compose_with, DrivingEvent, ReleaseAggregator, StorePublisher};
use kvpack_core::verify::load_report;
use kvpack_core::{
    Artifact, BuildTarget, ContainerBuilder, JobEnvironment, MatrixCoordinator, MatrixReport,
    PackConfig, ReleaseError, ReleaseOutcome, ReleasePipeline, TargetRegistry,
};
use kvpack_state::{
    ArtifactStore, FsArtifactStore, FsLogStore, FsReleaseStore, LogStore, ReleaseStore,
};

#[derive(Parser)]
#[command(name = "kvpack")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-target build-and-release orchestrator", long_about = None)]
struct Cli {
    /// Configuration file (default: ./kvpack.toml, optional)
    #[arg(long, global = true, env = "KVPACK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON logs (and JSON listings where supported)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the configured build matrix
    Targets {
        /// Only these targets (`system_arch`), repeatable
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Build every target; on a version tag, publish the release
    Build {
        /// Only these targets (`system_arch`), repeatable
        #[arg(long = "only")]
        only: Vec<String>,

        /// Git ref that triggered the run, e.g. refs/tags/v1.2.0
        #[arg(long, env = "GITHUB_REF")]
        event_ref: Option<String>,

        /// Print what would run without building
        #[arg(long)]
        dry_run: bool,

        /// Keep per-job working directories
        #[arg(long)]
        keep_workdirs: bool,
    },

    /// Publish a release from every verified bundle in the artifact store
    ///
    /// Unlike `build`, this is not limited to one run: the latest stored
    /// bundle of each target is released, whichever run produced it.
    Release {
        /// Release tag (overrides --event-ref)
        #[arg(long)]
        tag: Option<String>,

        /// Git ref that triggered the run
        #[arg(long, env = "GITHUB_REF")]
        event_ref: Option<String>,
    },

    /// Check a build report and list failed packages
    VerifyReport {
        /// Path to build_report.json
        path: PathBuf,
    },

    /// Create or verify `.sha256` sidecars
    Checksum {
        #[command(subcommand)]
        action: ChecksumAction,
    },

    /// Render release notes for the bundles in the artifact store
    Notes {
        /// Release tag shown in the title
        #[arg(long)]
        tag: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ChecksumAction {
    /// Write `<bundle>.sha256` next to each bundle
    Create {
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },
    /// Recompute the digests listed in sidecar files
    Verify {
        #[arg(required = true)]
        sidecars: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kvpack_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Targets { only } => cmd_targets(&config, &only, cli.json),
        Commands::Build {
            only,
            event_ref,
            dry_run,
            keep_workdirs,
        } => cmd_build(&config, &only, event_ref.as_deref(), dry_run, keep_workdirs).await,
        Commands::Release { tag, event_ref } => {
            cmd_release(&config, tag.as_deref(), event_ref.as_deref()).await
        }
        Commands::VerifyReport { path } => cmd_verify_report(&path),
        Commands::Checksum { action } => match action {
            ChecksumAction::Create { bundles } => cmd_checksum_create(&bundles),
            ChecksumAction::Verify { sidecars } => cmd_checksum_verify(&sidecars),
        },
        Commands::Notes { tag, output } => cmd_notes(&config, &tag, output.as_deref()).await,
    }
}

/// An explicit path must exist; the default one is optional.
fn load_config(path: Option<&Path>) -> Result<PackConfig> {
    let config = match path {
        Some(path) => PackConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PackConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE))
            .context("Failed to load kvpack.toml")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn select_targets(config: &PackConfig, only: &[String]) -> Result<TargetRegistry> {
    let registry = config.registry().context("Invalid target matrix")?;
    if only.is_empty() {
        return Ok(registry);
    }
    registry.select(only).context("Invalid --only selection")
}

struct Stores {
    logs: Arc<dyn LogStore>,
    artifacts: Arc<dyn ArtifactStore>,
    releases: Arc<dyn ReleaseStore>,
}

fn open_stores(config: &PackConfig) -> Result<Stores> {
    let stores = &config.stores;
    Ok(Stores {
        logs: Arc::new(
            FsLogStore::new(stores.logs_dir()).context("Failed to open log store")?,
        ),
        artifacts: Arc::new(
            FsArtifactStore::new(stores.artifacts_dir())
                .context("Failed to open artifact store")?,
        ),
        releases: Arc::new(
            FsReleaseStore::new(stores.releases_dir()).context("Failed to open release store")?,
        ),
    })
}

fn release_pipeline(config: &PackConfig, stores: &Stores) -> Result<ReleasePipeline> {
    let trigger = config.trigger().context("Invalid release tag pattern")?;
    Ok(ReleasePipeline::new(
        trigger,
        ReleaseAggregator::new(stores.artifacts.clone()),
        Arc::new(StorePublisher::new(
            stores.artifacts.clone(),
            stores.releases.clone(),
        )),
        config.release.notes.clone(),
    ))
}

#[derive(Serialize)]
struct TargetRow {
    slug: String,
    system: String,
    arch: String,
    bundle: String,
    image: Option<String>,
}

fn target_rows(config: &PackConfig, registry: &TargetRegistry) -> Vec<TargetRow> {
    let builder = ContainerBuilder::new(config.builder.clone());
    registry
        .list_targets()
        .iter()
        .map(|t| TargetRow {
            slug: t.slug(),
            system: t.system_identifier.clone(),
            arch: t.host_architecture.clone(),
            bundle: t.bundle_name(),
            image: builder.resolve_image(t).ok(),
        })
        .collect()
}

fn cmd_targets(config: &PackConfig, only: &[String], json: bool) -> Result<()> {
    let registry = select_targets(config, only)?;
    let rows = target_rows(config, &registry);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        println!(
            "{:<28} {:<40} {}",
            row.slug,
            row.bundle,
            row.image.as_deref().unwrap_or("<no image>")
        );
    }
    Ok(())
}

async fn cmd_build(
    config: &PackConfig,
    only: &[String],
    event_ref: Option<&str>,
    dry_run: bool,
    keep_workdirs: bool,
) -> Result<()> {
    let registry = select_targets(config, only)?;
    let event = event_ref.map(DrivingEvent::from_ref);

    if dry_run {
        return print_plan(config, &registry, event.as_ref());
    }

    let stores = open_stores(config)?;
    let pipeline = release_pipeline(config, &stores)?;
    let release_tag = match &event {
        Some(event) => match pipeline.release_tag(event) {
            Ok(tag) => Some(tag),
            Err(ReleaseError::NotReleaseEvent(what)) => {
                info!(event = %what, "not a release event, release skipped");
                None
            }
            Err(e) => return Err(e.into()),
        },
        None => None,
    };

    let env = JobEnvironment::new(
        Arc::new(ContainerBuilder::new(config.builder.clone())),
        stores.logs.clone(),
        stores.artifacts.clone(),
        config.stores.work_dir(),
    )
    .keep_workdirs(keep_workdirs || config.builder.keep_workdirs);

    let run = MatrixCoordinator::new(env).start(&registry);
    let cancel = run.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling builds");
            cancel.cancel_all();
        }
    });

    let report = run.wait().await;
    print_matrix(&report);
    let failed = report.failed_count();
    let total = report.outcomes.len();

    if let Some(tag) = release_tag {
        let outcome = pipeline
            .run(&tag, [std::future::ready(report)])
            .await
            .with_context(|| format!("Release {} failed", tag))?;
        print_release(&outcome);
    }

    if failed > 0 {
        bail!("{} of {} targets failed", failed, total);
    }
    Ok(())
}

fn print_plan(
    config: &PackConfig,
    registry: &TargetRegistry,
    event: Option<&DrivingEvent>,
) -> Result<()> {
    let builder = ContainerBuilder::new(config.builder.clone());
    println!("Dry run: {} target(s)", registry.len());
    for target in registry.list_targets() {
        println!();
        println!("{}", target);
        println!("  bundle:  {}", target.bundle_name());
        match builder.resolve_image(target) {
            Ok(image) => {
                let workdir = config.stores.work_dir().join(target.slug()).join("<job>");
                let args = builder.command_line(target, &image, &workdir, "<container>");
                println!("  command: {}", args.join(" "));
            }
            Err(e) => println!("  error:   {}", e),
        }
    }

    println!();
    match event {
        Some(event) => {
            let trigger = config.trigger().context("Invalid release tag pattern")?;
            match trigger.release_tag(event) {
                Ok(tag) => println!("Release: {} would be published", tag),
                Err(_) => println!("Release: skipped ({})", event.describe()),
            }
        }
        None => println!("Release: skipped (no event ref)"),
    }
    Ok(())
}

fn print_matrix(report: &MatrixReport) {
    println!();
    println!("{}", "=".repeat(60));
    println!("Build summary");
    println!("{}", "=".repeat(60));
    for outcome in &report.outcomes {
        let mark = if outcome.succeeded() { "✓" } else { "✗" };
        let detail = match (&outcome.artifact, &outcome.failure) {
            (Some(artifact), _) => artifact.file_name(),
            (None, Some(failure)) => failure.to_string(),
            (None, None) => String::new(),
        };
        println!("{} {:<28} {}", mark, outcome.target.slug(), detail);
    }
    println!();
    println!(
        "{} succeeded, {} failed ({} ms)",
        report.succeeded_count(),
        report.failed_count(),
        report.duration_ms
    );
}

fn print_release(outcome: &ReleaseOutcome) {
    println!();
    println!(
        "Published release {} with {} bundle(s):",
        outcome.receipt.tag,
        outcome.manifest.assets.len()
    );
    for file in &outcome.receipt.files {
        println!("  {}", file);
    }
}

async fn cmd_release(
    config: &PackConfig,
    tag: Option<&str>,
    event_ref: Option<&str>,
) -> Result<()> {
    let stores = open_stores(config)?;
    let pipeline = release_pipeline(config, &stores)?;

    let tag = match (tag, event_ref) {
        (Some(tag), _) => pipeline.release_tag(&DrivingEvent::TagPush {
            tag: tag.to_string(),
        })?,
        (None, Some(reference)) => pipeline.release_tag(&DrivingEvent::from_ref(reference))?,
        (None, None) => bail!("Either --tag or --event-ref is required"),
    };

    let outcome = pipeline
        .run_from_store(&tag)
        .await
        .with_context(|| format!("Release {} failed", tag))?;
    print_release(&outcome);
    Ok(())
}

fn cmd_verify_report(path: &Path) -> Result<()> {
    let report = load_report(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    let result = kvpack_core::verify(report.as_ref())
        .with_context(|| format!("Cannot verify {}", path.display()))?;

    if let Some(report) = &report {
        for (name, package) in report.iter() {
            let mark = if package.passed() { "✓" } else { "✗" };
            println!(
                "{} {}: {}",
                mark,
                name,
                package.detail.as_deref().unwrap_or("no detail")
            );
        }
    }
    println!("{}", result.summary());

    if !result.overall_success {
        bail!("Failed packages: {}", result.failed_packages.join(", "));
    }
    Ok(())
}

fn cmd_checksum_create(bundles: &[PathBuf]) -> Result<()> {
    for path in bundles {
        let artifact = bundle_artifact(path)?;
        let artifact = checksum(artifact)
            .with_context(|| format!("Failed to checksum {}", path.display()))?;
        println!(
            "{}  {}",
            artifact.digest.as_deref().unwrap_or_default(),
            artifact.file_name()
        );
    }
    Ok(())
}

fn bundle_artifact(path: &Path) -> Result<Artifact> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = BuildTarget::from_bundle_name(&file_name).with_context(|| {
        format!(
            "{} is not named output_<system>_<arch>.tar.gz",
            path.display()
        )
    })?;
    let size_bytes = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok(Artifact {
        target,
        path: path.to_path_buf(),
        size_bytes,
        digest: None,
    })
}

fn cmd_checksum_verify(sidecars: &[PathBuf]) -> Result<()> {
    let mut failures = 0;
    for sidecar in sidecars {
        match verify_sidecar(sidecar) {
            Ok(entries) => {
                for entry in entries {
                    println!("{}: OK", entry.file_name);
                }
            }
            Err(e) => {
                println!("{}: FAILED ({})", sidecar.display(), e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{} sidecar(s) failed verification", failures);
    }
    Ok(())
}

async fn cmd_notes(config: &PackConfig, tag: &str, output: Option<&Path>) -> Result<()> {
    let stores = open_stores(config)?;
    let assets = ReleaseAggregator::new(stores.artifacts.clone())
        .collect(tag)
        .await
        .context("No bundles to describe")?;
    let artifacts: Vec<Artifact> = assets.into_iter().map(|a| a.artifact).collect();
    let notes = compose_with(&artifacts, tag, &config.release.notes);

    match output {
        Some(path) => {
            std::fs::write(path, &notes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote release notes to {}", path.display());
        }
        None => print!("{}", notes),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build_with_filters() {
        let cli = Cli::try_parse_from([
            "kvpack",
            "--json",
            "build",
            "--only",
            "ubuntu20.04_amd64",
            "--only",
            "ubuntu22.04_amd64",
            "--event-ref",
            "refs/tags/v1.0.0",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Build {
                only,
                event_ref,
                dry_run,
                ..
            } => {
                assert_eq!(only.len(), 2);
                assert_eq!(event_ref.as_deref(), Some("refs/tags/v1.0.0"));
                assert!(dry_run);
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_checksum_requires_paths() {
        assert!(Cli::try_parse_from(["kvpack", "checksum", "verify"]).is_err());
    }

    #[test]
    fn test_load_config_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("kvpack.toml");
        std::fs::write(&path, "[builder]\ntimeout_secs = 5\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.builder.timeout_secs, 5);
    }

    #[test]
    fn test_select_targets() {
        let config = PackConfig::default();
        assert_eq!(select_targets(&config, &[]).unwrap().len(), 3);
        assert_eq!(
            select_targets(&config, &["ubuntu22.04_amd64".to_string()])
                .unwrap()
                .len(),
            1
        );
        assert!(select_targets(&config, &["nope_amd64".to_string()]).is_err());
    }

    #[test]
    fn test_bundle_artifact_requires_bundle_name() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("output_ubuntu20.04_amd64.tar.gz");
        std::fs::write(&good, b"bundle").unwrap();
        let artifact = bundle_artifact(&good).unwrap();
        assert_eq!(artifact.target, BuildTarget::new("ubuntu20.04", "amd64"));
        assert_eq!(artifact.size_bytes, 6);

        let bad = dir.path().join("random.bin");
        std::fs::write(&bad, b"x").unwrap();
        assert!(bundle_artifact(&bad).is_err());
    }

    #[test]
    fn test_target_rows_resolve_images() {
        let config = PackConfig::default();
        let rows = target_rows(&config, &config.registry().unwrap());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].image.as_deref(), Some("ubuntu:20.04"));
        assert_eq!(rows[2].image.as_deref(), Some("dockcross/manylinux2014-x64"));
    }
}
