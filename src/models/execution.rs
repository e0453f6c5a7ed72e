//! Execution status as tracked by the backend.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Requested, agents not yet provisioned.
    Pending,
    /// Agents are registered and working.
    Running,
    /// Provisioning failed or every agent crashed.
    Error,
    /// All agents shut down gracefully.
    Finished,
}

/// Request body of `POST /initializeAgents`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeAgentsRequest {
    /// Execution the agents will work for.
    pub execution_id: String,
    /// SDK image reference, or `default` for the configured image.
    #[serde(default)]
    pub sdk: String,
    /// Number of agent containers to launch.
    pub replicas: u32,
    /// Owning organization of the project under test.
    #[serde(default)]
    pub organization: Option<String>,
    /// Project under test.
    #[serde(default)]
    pub project: Option<String>,
}
