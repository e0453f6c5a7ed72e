//! Local container engine runner.
//!
//! Drives the engine through its CLI (`docker` by default). Every
//! container and volume is labelled with its execution id so that
//! start/stop/cleanup can find the run-unit without extra bookkeeping.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

use super::ContainerRunner;
use crate::config::DockerConfig;
use crate::models::container::{volume_name, ContainerRunConfiguration};
use crate::{AppError, Result};

/// Label carried by every resource this runner creates.
pub const MANAGED_LABEL: &str = "save.managed=true";

/// Label key holding the owning execution id.
pub const EXECUTION_LABEL_KEY: &str = "save.execution-id";

/// Environment variable carrying the agent id (the container name).
pub const AGENT_ID_ENV: &str = "SAVE_AGENT_ID";

/// Longest value the engine accepts for `--hostname`.
const MAX_HOSTNAME_LEN: usize = 63;

/// `ps --format` template listing a container's name and owning execution.
const CONTAINER_LISTING_FORMAT: &str = "{{.Names}}\t{{.Label \"save.execution-id\"}}";

/// `volume ls --format` template listing a volume's name and owning execution.
const VOLUME_LISTING_FORMAT: &str = "{{.Name}}\t{{.Label \"save.execution-id\"}}";

/// Label selecting the resources of one execution.
#[must_use]
pub fn execution_label(execution_id: &str) -> String {
    format!("{EXECUTION_LABEL_KEY}={execution_id}")
}

/// Container name for one replica.
#[must_use]
pub fn container_name(execution_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("save-agent-{execution_id}-{}", &suffix[..8])
}

/// Arguments of the `create` call for one agent container.
///
/// The container name is the agent id: it is handed to the agent as
/// [`AGENT_ID_ENV`] and, when short enough, as its hostname, and it is what
/// [`DockerRunner`] reports back from `create`.
#[must_use]
pub fn create_args(
    execution_id: &str,
    name: &str,
    configuration: &ContainerRunConfiguration,
    network: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        name.to_owned(),
        "--label".into(),
        MANAGED_LABEL.into(),
        "--label".into(),
        execution_label(execution_id),
        "--workdir".into(),
        configuration.working_dir.clone(),
        "--env".into(),
        format!("{AGENT_ID_ENV}={name}"),
        "--volume".into(),
        format!(
            "{}:{}",
            configuration.volume.name, configuration.volume.mount_path
        ),
    ];

    if name.len() <= MAX_HOSTNAME_LEN {
        args.push("--hostname".into());
        args.push(name.to_owned());
    }
    if let Some(ref memory) = configuration.resources.memory {
        args.push(format!("--memory={memory}"));
    }
    if let Some(ref cpu) = configuration.resources.cpu {
        args.push(format!("--cpus={cpu}"));
    }
    if let Some(network) = network {
        args.push(format!("--network={network}"));
    }
    for (key, value) in &configuration.env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }

    args.push(configuration.image.clone());
    args.push("sh".into());
    args.push("-c".into());
    args.push(configuration.run_command.clone());
    args
}

/// Whether an engine status string means the container is gone for good.
///
/// `removing` is not stopped: the entrypoint has finished but
/// the container is still being torn down.
#[must_use]
pub fn is_stopped_status(status: &str) -> bool {
    matches!(status.trim(), "exited" | "dead")
}

/// Names from a `name<TAB>execution-id` listing whose execution is not in `keep`.
///
/// Resources without an execution label are always candidates.
#[must_use]
pub fn prune_candidates(listing: &str, keep: &HashSet<String>) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let (name, execution_id) = line.split_once('\t').unwrap_or((line, ""));
            let name = name.trim();
            if name.is_empty() || keep.contains(execution_id.trim()) {
                None
            } else {
                Some(name.to_owned())
            }
        })
        .collect()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such")
}

/// Output of a finished engine CLI call.
#[derive(Debug)]
struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CliOutput {
    fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// [`ContainerRunner`] backed by the local container engine.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    config: DockerConfig,
}

impl DockerRunner {
    /// Build a runner for the configured engine binary.
    #[must_use]
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    async fn exec(&self, args: &[String]) -> Result<CliOutput> {
        debug!(binary = %self.config.binary, ?args, "running container engine command");
        let output = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                AppError::Runner(format!("failed to run {}: {err}", self.config.binary))
            })?;
        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command and fail on non-zero exit.
    async fn exec_checked(&self, args: &[String]) -> Result<CliOutput> {
        let output = self.exec(args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(AppError::Runner(format!(
                "{} {} failed: {}",
                self.config.binary,
                args.first().map_or("", String::as_str),
                output.stderr.trim()
            )))
        }
    }

    /// Run a command where a missing object is not an error.
    ///
    /// Returns `false` if the engine reported the object as missing.
    async fn exec_tolerating_missing(&self, args: &[String]) -> Result<bool> {
        let output = self.exec(args).await?;
        if output.success {
            Ok(true)
        } else if is_not_found(&output.stderr) {
            Ok(false)
        } else {
            Err(AppError::Runner(format!(
                "{} {} failed: {}",
                self.config.binary,
                args.first().map_or("", String::as_str),
                output.stderr.trim()
            )))
        }
    }

    async fn list_containers(&self, execution_id: &str, include_stopped: bool) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec!["ps".into()];
        if include_stopped {
            args.push("--all".into());
        }
        args.push("--filter".into());
        args.push(format!("label={}", execution_label(execution_id)));
        args.push("--format".into());
        args.push("{{.Names}}".into());
        Ok(self.exec_checked(&args).await?.lines())
    }

    async fn prune_containers(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut args: Vec<String> = vec![
            "ps".into(),
            "--all".into(),
            "--filter".into(),
            format!("label={MANAGED_LABEL}"),
        ];
        for status in ["created", "exited", "dead"] {
            args.push("--filter".into());
            args.push(format!("status={status}"));
        }
        args.push("--format".into());
        args.push(CONTAINER_LISTING_FORMAT.into());
        let listing = self.exec_checked(&args).await?.stdout;

        let candidates = prune_candidates(&listing, keep);
        if candidates.is_empty() {
            return Ok(0);
        }
        let mut rm: Vec<String> = vec!["rm".into(), "--force".into()];
        rm.extend(candidates.iter().cloned());
        self.exec_tolerating_missing(&rm).await?;
        Ok(candidates.len())
    }

    async fn prune_volumes(&self, keep: &HashSet<String>) -> Result<usize> {
        let listing = self
            .exec_checked(&[
                "volume".into(),
                "ls".into(),
                "--filter".into(),
                format!("label={MANAGED_LABEL}"),
                "--format".into(),
                VOLUME_LISTING_FORMAT.into(),
            ])
            .await?
            .stdout;

        let mut removed = 0;
        for volume in prune_candidates(&listing, keep) {
            match self
                .exec_tolerating_missing(&["volume".into(), "rm".into(), volume.clone()])
                .await
            {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(%err, volume, "volume still in use, keeping it"),
            }
        }
        Ok(removed)
    }
}

impl ContainerRunner for DockerRunner {
    fn create(
        &self,
        execution_id: &str,
        configuration: &ContainerRunConfiguration,
        replicas: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        let configuration = configuration.clone();
        let span = info_span!("docker.create", execution_id = %execution_id, replicas);
        Box::pin(
            async move {
                self.exec_checked(&[
                    "volume".into(),
                    "create".into(),
                    "--label".into(),
                    MANAGED_LABEL.into(),
                    "--label".into(),
                    execution_label(&execution_id),
                    configuration.volume.name.clone(),
                ])
                .await?;

                for _ in 0..replicas {
                    let name = container_name(&execution_id);
                    let args = create_args(
                        &execution_id,
                        &name,
                        &configuration,
                        self.config.network.as_deref(),
                    );
                    self.exec_checked(&args).await?;
                }

                let interval = Duration::from_millis(self.config.create_poll_interval_millis);
                for attempt in 1..=self.config.create_poll_attempts {
                    let ids = self.list_containers(&execution_id, true).await?;
                    if !ids.is_empty() {
                        info!(count = ids.len(), attempt, "agent containers created");
                        return Ok(ids);
                    }
                    debug!(attempt, "no containers observed yet");
                    tokio::time::sleep(interval).await;
                }

                Err(AppError::Runner(format!(
                    "no containers observed for execution {execution_id} after {} attempts",
                    self.config.create_poll_attempts
                )))
            }
            .instrument(span),
        )
    }

    fn start(&self, execution_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        Box::pin(async move {
            let ids = self.list_containers(&execution_id, true).await?;
            if ids.is_empty() {
                return Err(AppError::Runner(format!(
                    "no containers to start for execution {execution_id}"
                )));
            }
            let mut args: Vec<String> = vec!["start".into()];
            args.extend(ids);
            self.exec_checked(&args).await?;
            info!(execution_id, "agent containers started");
            Ok(())
        })
    }

    fn stop(&self, execution_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        Box::pin(async move {
            let ids = self.list_containers(&execution_id, false).await?;
            if ids.is_empty() {
                debug!(execution_id, "nothing running, execution already stopped");
                return Ok(());
            }
            let mut args: Vec<String> = vec!["stop".into()];
            args.extend(ids);
            self.exec_tolerating_missing(&args).await?;
            info!(execution_id, "execution stopped");
            Ok(())
        })
    }

    fn stop_by_agent_id(
        &self,
        container_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let container_id = container_id.to_owned();
        Box::pin(async move {
            let removed = self
                .exec_tolerating_missing(&["rm".into(), "--force".into(), container_id.clone()])
                .await?;
            if removed {
                info!(container_id, "agent container removed");
            } else {
                debug!(container_id, "agent container already gone");
            }
            Ok(removed)
        })
    }

    fn is_stopped(
        &self,
        container_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let container_id = container_id.to_owned();
        Box::pin(async move {
            let output = self
                .exec(&[
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Status}}".into(),
                    container_id,
                ])
                .await?;
            if output.success {
                Ok(is_stopped_status(&output.stdout))
            } else if is_not_found(&output.stderr) {
                Ok(true)
            } else {
                Err(AppError::Runner(format!(
                    "inspect failed: {}",
                    output.stderr.trim()
                )))
            }
        })
    }

    fn cleanup(
        &self,
        execution_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        Box::pin(async move {
            let ids = self.list_containers(&execution_id, true).await?;
            if !ids.is_empty() {
                let mut args: Vec<String> = vec!["rm".into(), "--force".into()];
                args.extend(ids);
                self.exec_tolerating_missing(&args).await?;
            }
            let volume = volume_name(&execution_id);
            if !self
                .exec_tolerating_missing(&["volume".into(), "rm".into(), "--force".into(), volume])
                .await?
            {
                debug!(execution_id, "volume already removed");
            }
            info!(execution_id, "execution resources cleaned up");
            Ok(())
        })
    }

    fn prune(
        &self,
        keep: HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let containers = self.prune_containers(&keep).await.inspect_err(|err| {
                warn!(%err, "container prune failed");
            })?;
            let volumes = self.prune_volumes(&keep).await.inspect_err(|err| {
                warn!(%err, "volume prune failed");
            })?;
            info!(
                containers,
                volumes,
                protected_executions = keep.len(),
                "orphaned agent resources pruned"
            );
            Ok(())
        })
    }
}
