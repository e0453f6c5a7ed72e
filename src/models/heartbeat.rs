//! Heartbeat request and the closed set of responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentState;

/// Execution progress counters reported alongside a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    /// Execution the reporting agent belongs to.
    pub execution_id: String,
    /// Completion of the current batch, 0..=100.
    #[serde(default)]
    pub percent_completion: u8,
}

/// Periodic status report sent by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Container identifier of the reporting agent.
    pub agent_id: String,
    /// State the agent is currently in.
    pub state: AgentState,
    /// Progress counters.
    pub execution_progress: ExecutionProgress,
    /// Agent-side clock at the time of sending.
    pub timestamp: DateTime<Utc>,
}

/// Payload an agent needs before it can request work.
///
/// The contents are owned by the backend and passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AgentInitConfig(pub serde_json::Value);

/// Next batch of tests for an agent, passed through from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AgentRunConfig(pub serde_json::Value);

/// Orchestrator reply to a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum HeartbeatResponse {
    /// Initialization payload for a starting agent.
    InitResponse {
        /// Backend-provided initialization data.
        config: AgentInitConfig,
    },
    /// Next batch of work.
    NewJobResponse {
        /// Backend-provided batch description.
        config: AgentRunConfig,
    },
    /// Keep doing whatever the agent is doing.
    ContinueResponse,
    /// No work right now; do not shut down.
    WaitResponse,
    /// Shut down gracefully.
    TerminateResponse,
}

impl HeartbeatResponse {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitResponse { .. } => "init",
            Self::NewJobResponse { .. } => "new_job",
            Self::ContinueResponse => "continue",
            Self::WaitResponse => "wait",
            Self::TerminateResponse => "terminate",
        }
    }
}
