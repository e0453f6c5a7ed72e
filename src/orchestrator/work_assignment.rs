//! Work assignment decisions backed by the backend's queue.

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::models::heartbeat::{AgentInitConfig, AgentRunConfig};
use crate::Result;

/// Decides what an agent gets next.
///
/// Adds no locking of its own: exactly-once delivery of a batch relies on
/// the backend's dequeue being atomic, and an agent only asks for a batch
/// after reporting the previous one as done.
pub struct WorkAssignmentService {
    backend: Arc<dyn Backend>,
}

impl WorkAssignmentService {
    /// Build the service on top of a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Initialization payload for a starting agent, if the backend has one yet.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn init_config(&self, agent_id: &str) -> Result<Option<AgentInitConfig>> {
        self.backend.get_init_config(agent_id).await
    }

    /// Dequeue the next batch for `agent_id`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn try_assign_next(&self, agent_id: &str) -> Result<Option<AgentRunConfig>> {
        let batch = self.backend.get_next_run_config(agent_id).await?;
        debug!(agent_id, assigned = batch.is_some(), "next batch requested");
        Ok(batch)
    }

    /// Whether no agent of the execution is still starting or busy.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn all_siblings_idle_or_finished(&self, execution_id: &str) -> Result<bool> {
        let statuses = self
            .backend
            .get_agent_statuses_for_execution(execution_id)
            .await?;
        let blocking = statuses
            .iter()
            .filter(|status| status.state.blocks_termination())
            .count();
        debug!(
            execution_id,
            agents = statuses.len(),
            blocking,
            "sibling statuses checked"
        );
        Ok(blocking == 0)
    }
}
