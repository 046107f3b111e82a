//! Container-based builder.
//!
//! Runs one named container per job with the job's `output` and
//! `output_logs` directories bind-mounted under the workspace mount point.
//! Output is streamed line by line into the job log.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{output_dir, report_path, BuildInvocation, BuildOutputTree, Builder, JobLog};
use crate::config::BuilderConfig;
use crate::domain::{BuildInvocationError, BuildTarget};

#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    config: BuilderConfig,
}

impl ContainerBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Image configured for the target's system and architecture.
    pub fn resolve_image(&self, target: &BuildTarget) -> Result<String, BuildInvocationError> {
        self.config
            .images
            .get(&target.system_identifier)
            .and_then(|spec| spec.for_arch(&target.host_architecture))
            .map(str::to_string)
            .ok_or_else(|| {
                BuildInvocationError::EnvironmentUnavailable(format!(
                    "no image configured for {}",
                    target
                ))
            })
    }

    /// Full runtime command line for one build. `workdir` must be absolute.
    pub fn command_line(
        &self,
        target: &BuildTarget,
        image: &str,
        workdir: &Path,
        container_name: &str,
    ) -> Vec<String> {
        let mount = self.config.workspace_mount.trim_end_matches('/');
        let mut args = vec![
            self.config.runtime.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];
        if self.config.privileged {
            args.push("--privileged".to_string());
        }
        args.push("--platform".to_string());
        args.push(platform(&target.host_architecture));

        args.push("-e".to_string());
        args.push(format!("SYSTEM_NAME={}", target.system_identifier));
        args.push("-e".to_string());
        args.push(format!("TARGET_ARCH={}", target.host_architecture));
        for var in &self.config.forward_env {
            if std::env::var_os(var).is_some() {
                args.push("-e".to_string());
                args.push(var.clone());
            }
        }

        for dir in ["output", "output_logs"] {
            args.push("-v".to_string());
            args.push(format!("{}:{}/{}", workdir.join(dir).display(), mount, dir));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push(image.to_string());
        args.extend(self.config.command.iter().cloned());
        args
    }

    async fn probe_runtime(&self) -> Result<(), BuildInvocationError> {
        let unavailable = |detail: String| {
            BuildInvocationError::EnvironmentUnavailable(format!(
                "container runtime {}: {}",
                self.config.runtime, detail
            ))
        };

        let output = Command::new(&self.config.runtime)
            .arg("version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl Builder for ContainerBuilder {
    async fn invoke(
        &self,
        target: &BuildTarget,
        workdir: &Path,
        log: &JobLog,
    ) -> Result<BuildInvocation, BuildInvocationError> {
        let image = self.resolve_image(target)?;
        self.probe_runtime().await?;

        tokio::fs::create_dir_all(output_dir(workdir)).await?;
        tokio::fs::create_dir_all(workdir.join("output_logs")).await?;
        let workdir = tokio::fs::canonicalize(workdir).await?;

        let name = container_name(target, log.key().short_id());
        let args = self.command_line(target, &image, &workdir, &name);
        log.line(&format!("$ {}", args.join(" "))).await;
        debug!(
            slug = %target.slug(),
            image = %image,
            container = %name,
            "starting container build"
        );

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BuildInvocationError::EnvironmentUnavailable(format!(
                    "failed to start {}: {}",
                    self.config.runtime, e
                ))
            })?;
        let mut guard = ContainerGuard::new(&self.config.runtime, &name);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            let (out, err, status) =
                tokio::join!(pump(stdout, log), pump(stderr, log), child.wait());
            out?;
            err?;
            status
        };

        let status = if self.config.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), run).await {
                Ok(status) => status?,
                Err(_) => {
                    log.line(&format!(
                        "build exceeded {}s and was stopped",
                        self.config.timeout_secs
                    ))
                    .await;
                    return Err(BuildInvocationError::TimedOut {
                        secs: self.config.timeout_secs,
                    });
                }
            }
        } else {
            run.await?
        };
        guard.disarm();

        let exit_code = status.code();
        log.line(&format!("builder exited with status {:?}", exit_code))
            .await;

        BuildInvocation {
            tree: BuildOutputTree::new(output_dir(&workdir)),
            report_path: report_path(&workdir),
            exit_code,
        }
        .require_output()
    }

    fn name(&self) -> &str {
        &self.config.runtime
    }
}

/// `--platform` value for an architecture.
fn platform(arch: &str) -> String {
    match arch {
        "arm" => "linux/arm/v7".to_string(),
        other => format!("linux/{}", other),
    }
}

/// Container names allow `[a-zA-Z0-9_.-]`.
fn container_name(target: &BuildTarget, short_id: &str) -> String {
    let raw = format!("kvpack-{}-{}", target.slug(), short_id);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

async fn pump<R: AsyncRead + Unpin>(stream: Option<R>, log: &JobLog) -> std::io::Result<()> {
    let Some(stream) = stream else {
        return Ok(());
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        log.line(line.trim_end_matches(['\n', '\r'])).await;
    }
}

/// Stops the named container if the build is abandoned (timeout, cancel)
/// before the runtime process exits on its own.
struct ContainerGuard {
    runtime: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: &str, name: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let spawned = Command::new(&self.runtime)
            .args(["kill", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(container = %self.name, error = %e, "failed to stop abandoned container");
        }
    }
}
