//! Agent identity and self-reported lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by an agent in its heartbeat.
///
/// The orchestrator only ever writes `Crashed`, `Terminated` and
/// `StoppedByOrch` itself; a live agent reporting one of them is an anomaly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Agent process started and waits for its initialization payload.
    Starting,
    /// Agent has nothing to do and asks for work.
    Idle,
    /// Agent is executing a batch.
    Busy,
    /// Agent finished its batch and uploaded results.
    Finished,
    /// Agent was presumed dead by the orchestrator.
    Crashed,
    /// Agent shut down after a terminate signal.
    Terminated,
    /// Backend rejected the agent's requests.
    BackendFailure,
    /// Agent could not reach the backend.
    BackendUnreachable,
    /// The test runner CLI inside the agent failed.
    CliFailed,
    /// Agent was stopped explicitly through `/stopAgents`.
    StoppedByOrch,
}

impl AgentState {
    /// All states, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Starting,
        Self::Idle,
        Self::Busy,
        Self::Finished,
        Self::Crashed,
        Self::Terminated,
        Self::BackendFailure,
        Self::BackendUnreachable,
        Self::CliFailed,
        Self::StoppedByOrch,
    ];

    /// Whether the agent may still pick up or be running work.
    ///
    /// Siblings in one of these states block termination of an idle agent.
    #[must_use]
    pub fn blocks_termination(self) -> bool {
        matches!(self, Self::Starting | Self::Busy)
    }

    /// States a live agent must never report about itself.
    #[must_use]
    pub fn is_orchestrator_only(self) -> bool {
        matches!(self, Self::Crashed | Self::Terminated | Self::StoppedByOrch)
    }
}

/// Current status of one agent as stored by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Container identifier of the agent.
    pub container_id: String,
    /// Most recently persisted state.
    pub state: AgentState,
    /// When the state was reported.
    pub time: DateTime<Utc>,
}
