//! Heartbeat protocol state machine.
//!
//! Every heartbeat persists the reported state, refreshes liveness, and is
//! answered according to the agent's state. Failures never reach the
//! agent as errors: they degrade to [`HeartbeatResponse::ContinueResponse`]
//! so the agent repeats its current state on the next heartbeat.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};

use super::liveness::LivenessTracker;
use super::shutdown::GracefulShutdown;
use super::work_assignment::WorkAssignmentService;
use crate::backend::Backend;
use crate::models::agent::AgentState;
use crate::models::heartbeat::{Heartbeat, HeartbeatResponse};
use crate::{AppError, Result};

/// Answers agent heartbeats.
pub struct HeartbeatHandler {
    backend: Arc<dyn Backend>,
    liveness: Arc<LivenessTracker>,
    work: WorkAssignmentService,
    shutdown: Arc<GracefulShutdown>,
}

impl HeartbeatHandler {
    /// Build a handler.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        liveness: Arc<LivenessTracker>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        Self {
            work: WorkAssignmentService::new(Arc::clone(&backend)),
            backend,
            liveness,
            shutdown,
        }
    }

    /// Handle one heartbeat and compute the response.
    pub async fn handle(&self, heartbeat: Heartbeat) -> HeartbeatResponse {
        let span = info_span!(
            "heartbeat",
            agent_id = %heartbeat.agent_id,
            execution_id = %heartbeat.execution_progress.execution_id,
            state = ?heartbeat.state,
        );
        async move {
            match self.process(&heartbeat).await {
                Ok(response) => {
                    info!(response = response.kind(), "heartbeat answered");
                    response
                }
                Err(err) => {
                    if matches!(err, AppError::Invariant(_)) {
                        error!(%err, "heartbeat violates agent ownership");
                    } else {
                        warn!(%err, "heartbeat processing failed, agent will retry");
                    }
                    HeartbeatResponse::ContinueResponse
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, heartbeat: &Heartbeat) -> Result<HeartbeatResponse> {
        let agent_id = heartbeat.agent_id.as_str();
        let execution_id = heartbeat.execution_progress.execution_id.as_str();

        let persisted = self
            .backend
            .update_agent_status(agent_id, heartbeat.state, heartbeat.timestamp)
            .await;
        self.liveness.upsert(execution_id, agent_id, Utc::now())?;
        persisted?;

        let response = match heartbeat.state {
            AgentState::Starting => match self.work.init_config(agent_id).await? {
                Some(config) => HeartbeatResponse::InitResponse { config },
                None => HeartbeatResponse::WaitResponse,
            },
            AgentState::Idle => self.on_idle(agent_id, execution_id).await?,
            AgentState::Finished => {
                if self.backend.check_saved_data(agent_id).await? {
                    self.on_idle(agent_id, execution_id).await?
                } else {
                    warn!("not all results were saved, failing outstanding test executions");
                    self.backend
                        .mark_test_executions_as_failed(&[agent_id.to_owned()])
                        .await?;
                    HeartbeatResponse::WaitResponse
                }
            }
            AgentState::Busy => HeartbeatResponse::ContinueResponse,
            AgentState::BackendFailure
            | AgentState::BackendUnreachable
            | AgentState::CliFailed => HeartbeatResponse::WaitResponse,
            AgentState::Crashed | AgentState::Terminated | AgentState::StoppedByOrch => {
                warn!("live agent reported an orchestrator-only state, watching it as crashed");
                self.liveness.mark_as_crashed(agent_id)?;
                HeartbeatResponse::WaitResponse
            }
        };

        if matches!(response, HeartbeatResponse::TerminateResponse) {
            self.supervise_shutdown(execution_id, agent_id)?;
        }
        Ok(response)
    }

    async fn on_idle(&self, agent_id: &str, execution_id: &str) -> Result<HeartbeatResponse> {
        if let Some(config) = self.work.try_assign_next(agent_id).await? {
            return Ok(HeartbeatResponse::NewJobResponse { config });
        }
        if self.work.all_siblings_idle_or_finished(execution_id).await? {
            Ok(HeartbeatResponse::TerminateResponse)
        } else {
            Ok(HeartbeatResponse::WaitResponse)
        }
    }

    fn supervise_shutdown(&self, execution_id: &str, agent_id: &str) -> Result<()> {
        if self.liveness.mark_as_terminating(agent_id)? {
            drop(
                self.shutdown
                    .spawn(execution_id.to_owned(), agent_id.to_owned()),
            );
        }
        Ok(())
    }
}
