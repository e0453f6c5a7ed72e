//! Agent provisioning pipeline behind `POST /initializeAgents`.
//!
//! `create` → `start` → register containers for liveness → register
//! agents with the backend → mark the execution running. Any failure is
//! terminal for the execution: it is marked `ERROR` with the failure
//! message and the pipeline stops without retrying.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};

use super::liveness::LivenessTracker;
use crate::backend::Backend;
use crate::config::GlobalConfig;
use crate::models::container::ContainerRunConfiguration;
use crate::models::execution::{ExecutionStatus, InitializeAgentsRequest};
use crate::runner::ContainerRunner;
use crate::{AppError, Result};

/// Launches the agents of an execution.
pub struct Provisioner {
    config: Arc<GlobalConfig>,
    backend: Arc<dyn Backend>,
    runner: Arc<dyn ContainerRunner>,
    liveness: Arc<LivenessTracker>,
    in_flight: Mutex<HashSet<String>>,
}

impl Provisioner {
    /// Build a provisioner.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        backend: Arc<dyn Backend>,
        runner: Arc<dyn ContainerRunner>,
        liveness: Arc<LivenessTracker>,
    ) -> Self {
        Self {
            config,
            backend,
            runner,
            liveness,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn in_flight_guard(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executions whose pipeline is currently running.
    #[must_use]
    pub fn in_flight(&self) -> HashSet<String> {
        self.in_flight_guard().clone()
    }

    /// Reject requests that cannot possibly be provisioned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an empty execution id or zero replicas.
    pub fn validate(request: &InitializeAgentsRequest) -> Result<()> {
        if request.execution_id.trim().is_empty() {
            return Err(AppError::Config("executionId must not be empty".into()));
        }
        if request.replicas == 0 {
            return Err(AppError::Config("replicas must be greater than zero".into()));
        }
        Ok(())
    }

    /// Run the pipeline to completion.
    ///
    /// On failure the execution is marked `ERROR` and whatever was created
    /// is cleaned up before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the pipeline.
    pub async fn initialize_agents(&self, request: InitializeAgentsRequest) -> Result<Vec<String>> {
        let span = info_span!(
            "initialize_agents",
            execution_id = %request.execution_id,
            replicas = request.replicas
        );
        async move {
            self.in_flight_guard().insert(request.execution_id.clone());
            let result = match self.provision(&request).await {
                Ok(container_ids) => {
                    info!(containers = container_ids.len(), "agents provisioned");
                    Ok(container_ids)
                }
                Err(err) => {
                    error!(%err, "provisioning failed, marking execution as errored");
                    self.abort(&request.execution_id, &err).await;
                    Err(err)
                }
            };
            self.in_flight_guard().remove(&request.execution_id);
            result
        }
        .instrument(span)
        .await
    }

    async fn provision(&self, request: &InitializeAgentsRequest) -> Result<Vec<String>> {
        Self::validate(request)?;
        let execution_id = request.execution_id.as_str();
        let configuration =
            ContainerRunConfiguration::for_request(request, &self.config.agent, &self.config.docker);

        let container_ids = self
            .runner
            .create(execution_id, &configuration, request.replicas)
            .await?;
        self.runner.start(execution_id).await?;

        let now = Utc::now();
        for container_id in &container_ids {
            self.liveness.upsert(execution_id, container_id, now)?;
        }

        self.backend.add_agents(execution_id, &container_ids).await?;
        self.backend
            .update_execution_status(execution_id, ExecutionStatus::Running, None)
            .await?;
        Ok(container_ids)
    }

    async fn abort(&self, execution_id: &str, cause: &AppError) {
        if let Err(err) = self
            .backend
            .update_execution_status(execution_id, ExecutionStatus::Error, Some(cause.to_string()))
            .await
        {
            error!(%err, execution_id, "failed to mark execution as errored");
        }
        self.liveness.delete_all_by_execution_id(execution_id);
        if let Err(err) = self.runner.cleanup(execution_id).await {
            warn!(%err, execution_id, "failed to clean up after provisioning failure");
        }
    }
}
