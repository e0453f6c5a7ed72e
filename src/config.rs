//! Global configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::{AppError, Result};

/// Environment variable that overrides `backend.url`.
pub const BACKEND_URL_ENV: &str = "ORCHESTRATOR_BACKEND_URL";

/// Connection settings for the backend service that owns execution data.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `http://backend:5800`.
    pub url: String,
    /// Per-request timeout for backend RPCs.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

/// How agent containers are launched.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Image used when an execution requests the default SDK.
    #[serde(default = "default_image")]
    pub default_image: String,
    /// Command executed inside each agent container.
    pub run_command: String,
    /// Working directory inside the container.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// URL agents use to reach this orchestrator's heartbeat endpoint.
    pub orchestrator_url: String,
    /// Optional CPU limit passed to the container engine (e.g. `"1.5"`).
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Optional memory limit passed to the container engine (e.g. `"2g"`).
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Local container engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DockerConfig {
    /// Container engine CLI binary.
    #[serde(default = "default_docker_binary")]
    pub binary: String,
    /// Network the agent containers join.
    #[serde(default)]
    pub network: Option<String>,
    /// Mount point of the per-execution volume inside agent containers.
    #[serde(default = "default_volume_mount_path")]
    pub volume_mount_path: String,
    /// How many times `create` polls for the first container to appear.
    #[serde(default = "default_create_poll_attempts")]
    pub create_poll_attempts: u32,
    /// Delay between `create` polls.
    #[serde(default = "default_create_poll_interval_millis")]
    pub create_poll_interval_millis: u64,
    /// Interval of the orphaned-resource prune task.
    #[serde(default = "default_prune_interval_seconds")]
    pub prune_interval_seconds: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            network: None,
            volume_mount_path: default_volume_mount_path(),
            create_poll_attempts: default_create_poll_attempts(),
            create_poll_interval_millis: default_create_poll_interval_millis(),
            prune_interval_seconds: default_prune_interval_seconds(),
        }
    }
}

/// Crash detection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LivenessConfig {
    /// Silence after which a container is presumed crashed.
    #[serde(default = "default_staleness_threshold_seconds")]
    pub staleness_threshold_seconds: u64,
    /// Interval between watchdog passes.
    #[serde(default = "default_watchdog_interval_seconds")]
    pub watchdog_interval_seconds: u64,
    /// How long a finalized execution id is remembered to suppress
    /// duplicate finalization.
    #[serde(default = "default_finalized_retention_seconds")]
    pub finalized_retention_seconds: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_seconds: default_staleness_threshold_seconds(),
            watchdog_interval_seconds: default_watchdog_interval_seconds(),
            finalized_retention_seconds: default_finalized_retention_seconds(),
        }
    }
}

/// Graceful shutdown polling bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ShutdownConfig {
    /// Delay between `is_stopped` checks.
    #[serde(default = "default_check_interval_millis")]
    pub check_interval_millis: u64,
    /// Maximum number of `is_stopped` checks.
    #[serde(default = "default_max_checks")]
    pub max_checks: u32,
    /// Overall wall-clock bound for the whole poll.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            check_interval_millis: default_check_interval_millis(),
            max_checks: default_max_checks(),
            timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

impl ShutdownConfig {
    /// Delay between consecutive checks.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_millis)
    }

    /// Wall-clock bound of a single supervision.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_image() -> String {
    "ubuntu:latest".into()
}

fn default_working_dir() -> String {
    "/home/save-agent".into()
}

fn default_docker_binary() -> String {
    "docker".into()
}

fn default_volume_mount_path() -> String {
    "/home/save-agent/save-execution".into()
}

fn default_create_poll_attempts() -> u32 {
    10
}

fn default_create_poll_interval_millis() -> u64 {
    1000
}

fn default_prune_interval_seconds() -> u64 {
    3600
}

fn default_staleness_threshold_seconds() -> u64 {
    60
}

fn default_watchdog_interval_seconds() -> u64 {
    10
}

fn default_finalized_retention_seconds() -> u64 {
    3600
}

fn default_check_interval_millis() -> u64 {
    1000
}

fn default_max_checks() -> u32 {
    60
}

fn default_shutdown_timeout_seconds() -> u64 {
    60
}

fn default_http_port() -> u16 {
    5100
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

/// Global configuration parsed from `orchestrator.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// HTTP port for the agent-facing API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Address the HTTP server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Backend RPC settings.
    pub backend: BackendConfig,
    /// Agent container settings.
    pub agent: AgentConfig,
    /// Container engine settings.
    #[serde(default)]
    pub docker: DockerConfig,
    /// Crash detection thresholds.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Graceful shutdown bounds.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides on top of the parsed file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an override produces an invalid config.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = env::var(BACKEND_URL_ENV) {
            if !url.is_empty() {
                info!(url, "backend url overridden from environment");
                self.backend.url = url;
            }
        }
        self.validate()
    }

    /// Staleness threshold as a `chrono` duration, for timestamp arithmetic.
    #[must_use]
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.liveness.staleness_threshold_seconds).unwrap_or(i64::MAX),
        )
    }

    /// Interval between watchdog passes.
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.liveness.watchdog_interval_seconds)
    }

    /// How long finalized execution ids are remembered.
    #[must_use]
    pub fn finalized_retention(&self) -> Duration {
        Duration::from_secs(self.liveness.finalized_retention_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        let url = self.backend.url.trim_end_matches('/').to_owned();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "backend.url must be an http(s) url, got '{}'",
                self.backend.url
            )));
        }
        self.backend.url = url;

        if self.backend.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "backend.request_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.agent.run_command.trim().is_empty() {
            return Err(AppError::Config("agent.run_command must not be empty".into()));
        }

        if self.docker.create_poll_attempts == 0 {
            return Err(AppError::Config(
                "docker.create_poll_attempts must be greater than zero".into(),
            ));
        }

        if self.liveness.staleness_threshold_seconds == 0
            || self.liveness.watchdog_interval_seconds == 0
            || self.liveness.finalized_retention_seconds == 0
        {
            return Err(AppError::Config(
                "liveness thresholds must be greater than zero".into(),
            ));
        }

        if self.shutdown.max_checks == 0 || self.shutdown.timeout_seconds == 0 {
            return Err(AppError::Config(
                "shutdown.max_checks and shutdown.timeout_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
