//! Per-execution container launch configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, DockerConfig};
use crate::models::execution::InitializeAgentsRequest;

/// SDK value that selects the configured default image.
pub const DEFAULT_SDK: &str = "default";

/// Container engine resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU limit, engine syntax.
    pub cpu: Option<String>,
    /// Memory limit, engine syntax.
    pub memory: Option<String>,
}

/// Volume provisioned for one execution and mounted into all of its agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedVolume {
    /// Engine-side volume name.
    pub name: String,
    /// Mount point inside each container.
    pub mount_path: String,
}

/// Everything needed to launch the agents of one execution.
///
/// Built once before containers are created and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRunConfiguration {
    /// Image reference.
    pub image: String,
    /// Command run inside the container.
    pub run_command: String,
    /// Resource limits.
    pub resources: ResourceLimits,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Environment passed to the agent.
    pub env: BTreeMap<String, String>,
    /// Volume shared by the execution's agents.
    pub volume: ProvisionedVolume,
}

impl ContainerRunConfiguration {
    /// Build the launch configuration for an `initializeAgents` request.
    #[must_use]
    pub fn for_request(
        request: &InitializeAgentsRequest,
        agent: &AgentConfig,
        docker: &DockerConfig,
    ) -> Self {
        let sdk = request.sdk.trim();
        let image = if sdk.is_empty() || sdk.eq_ignore_ascii_case(DEFAULT_SDK) {
            agent.default_image.clone()
        } else {
            sdk.to_owned()
        };

        let mut env = BTreeMap::new();
        env.insert("SAVE_ORCHESTRATOR_URL".to_owned(), agent.orchestrator_url.clone());
        env.insert("SAVE_EXECUTION_ID".to_owned(), request.execution_id.clone());
        if let Some(ref organization) = request.organization {
            env.insert("SAVE_ORGANIZATION".to_owned(), organization.clone());
        }
        if let Some(ref project) = request.project {
            env.insert("SAVE_PROJECT".to_owned(), project.clone());
        }

        Self {
            image,
            run_command: agent.run_command.clone(),
            resources: ResourceLimits {
                cpu: agent.cpu_limit.clone(),
                memory: agent.memory_limit.clone(),
            },
            working_dir: agent.working_dir.clone(),
            env,
            volume: ProvisionedVolume {
                name: volume_name(&request.execution_id),
                mount_path: docker.volume_mount_path.clone(),
            },
        }
    }
}

/// Engine-side volume name for an execution.
#[must_use]
pub fn volume_name(execution_id: &str) -> String {
    format!("save-execution-{execution_id}")
}
