//! Shared application state and HTTP route handlers.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, info_span, warn, Instrument};

use crate::backend::Backend;
use crate::config::GlobalConfig;
use crate::models::agent::AgentState;
use crate::models::execution::InitializeAgentsRequest;
use crate::models::heartbeat::{Heartbeat, HeartbeatResponse};
use crate::orchestrator::finalizer::ExecutionFinalizer;
use crate::orchestrator::heartbeat::HeartbeatHandler;
use crate::orchestrator::liveness::LivenessTracker;
use crate::orchestrator::provisioning::Provisioner;
use crate::orchestrator::shutdown::GracefulShutdown;
use crate::orchestrator::watchdog::Watchdog;
use crate::runner::ContainerRunner;
use crate::AppError;

/// Everything the HTTP handlers and background tasks share.
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// Backend RPC client.
    pub backend: Arc<dyn Backend>,
    /// Execution backend for agent containers.
    pub runner: Arc<dyn ContainerRunner>,
    /// Liveness registry of this service instance.
    pub liveness: Arc<LivenessTracker>,
    /// Once-per-execution finalization.
    pub finalizer: Arc<ExecutionFinalizer>,
    /// Heartbeat protocol handler.
    pub heartbeats: HeartbeatHandler,
    /// Provisioning pipeline.
    pub provisioner: Arc<Provisioner>,
    /// Crash/timeout watchdog.
    pub watchdog: Arc<Watchdog>,
}

impl AppState {
    /// Wire all orchestrator components around one liveness tracker.
    #[must_use]
    pub fn new(
        config: GlobalConfig,
        backend: Arc<dyn Backend>,
        runner: Arc<dyn ContainerRunner>,
    ) -> Self {
        let config = Arc::new(config);
        let liveness = Arc::new(LivenessTracker::new(config.staleness_threshold()));
        let finalizer = Arc::new(ExecutionFinalizer::new(
            Arc::clone(&backend),
            Arc::clone(&runner),
            Arc::clone(&liveness),
            config.finalized_retention(),
        ));
        let shutdown = Arc::new(GracefulShutdown::new(
            Arc::clone(&runner),
            Arc::clone(&liveness),
            Arc::clone(&finalizer),
            config.shutdown.clone(),
        ));
        let heartbeats =
            HeartbeatHandler::new(Arc::clone(&backend), Arc::clone(&liveness), shutdown);
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&config),
            Arc::clone(&backend),
            Arc::clone(&runner),
            Arc::clone(&liveness),
        ));
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&backend),
            Arc::clone(&runner),
            Arc::clone(&liveness),
            Arc::clone(&finalizer),
        ));

        Self {
            config,
            backend,
            runner,
            liveness,
            finalizer,
            heartbeats,
            provisioner,
            watchdog,
        }
    }

    /// Executions whose runner resources must survive a prune: those with
    /// tracked containers and those still being provisioned.
    #[must_use]
    pub fn protected_executions(&self) -> HashSet<String> {
        let mut protected = self.liveness.execution_ids();
        protected.extend(self.provisioner.in_flight());
        protected
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Invariant(_) => StatusCode::CONFLICT,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Runner(_) | Self::Http(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Handler for `GET /health`.
pub async fn health() -> &'static str {
    "ok"
}

/// Handler for `POST /heartbeat`.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(heartbeat): Json<Heartbeat>,
) -> Json<HeartbeatResponse> {
    Json(state.heartbeats.handle(heartbeat).await)
}

/// Handler for `POST /initializeAgents`.
///
/// Validates the request, then provisions in the background and answers
/// `202 Accepted` right away.
///
/// # Errors
///
/// Returns `AppError::Config` (400) for an unusable request.
pub async fn initialize_agents(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InitializeAgentsRequest>,
) -> Result<StatusCode, AppError> {
    Provisioner::validate(&request)?;
    info!(
        execution_id = %request.execution_id,
        replicas = request.replicas,
        "agent initialization accepted"
    );
    let provisioner = Arc::clone(&state.provisioner);
    tokio::spawn(async move {
        // Failures are recorded on the execution by the pipeline itself.
        let _ = provisioner.initialize_agents(request).await;
    });
    Ok(StatusCode::ACCEPTED)
}

/// Handler for `POST /stopAgents`.
///
/// Stops each listed container and returns the ids that were stopped.
pub async fn stop_agents(
    State(state): State<Arc<AppState>>,
    Json(container_ids): Json<Vec<String>>,
) -> Json<Vec<String>> {
    let span = info_span!("stop_agents", count = container_ids.len());
    async move {
        let mut stopped = Vec::with_capacity(container_ids.len());
        for container_id in container_ids {
            if let Err(err) = state.runner.stop_by_agent_id(&container_id).await {
                warn!(%err, container_id, "failed to stop agent");
                continue;
            }
            if let Err(err) = state
                .backend
                .update_agent_status(&container_id, AgentState::StoppedByOrch, Utc::now())
                .await
            {
                warn!(%err, container_id, "failed to persist stopped state");
            }
            state.liveness.delete(&container_id);
            stopped.push(container_id);
        }
        info!(stopped = stopped.len(), "agents stopped on request");
        Json(stopped)
    }
    .instrument(span)
    .await
}

/// Query of `POST /cleanup`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupParams {
    /// Execution whose containers and volumes are removed.
    pub execution_id: String,
}

/// Handler for `POST /cleanup?executionId=`.
///
/// # Errors
///
/// Returns `AppError::Runner` (500) if the runner cannot remove resources.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CleanupParams>,
) -> Result<StatusCode, AppError> {
    let execution_id = params.execution_id;
    state.runner.cleanup(&execution_id).await?;
    let removed = state.liveness.delete_all_by_execution_id(&execution_id);
    info!(execution_id, containers = removed.len(), "execution cleaned up");
    Ok(StatusCode::OK)
}
