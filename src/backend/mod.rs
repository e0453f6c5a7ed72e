//! Narrow RPC interface to the backend service that owns execution data.
//!
//! The orchestrator never stores executions, agents or test results
//! itself. Everything it needs to know or persist goes through
//! [`Backend`]; [`http::HttpBackend`] is the production implementation.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::models::agent::{AgentState, AgentStatus};
use crate::models::execution::ExecutionStatus;
use crate::models::heartbeat::{AgentInitConfig, AgentRunConfig};
use crate::Result;

/// Backend operations consumed by the orchestrator.
///
/// `get_next_run_config` must be atomic on the backend side: a batch is
/// handed to exactly one agent.
pub trait Backend: Send + Sync {
    /// Fetch the initialization payload for a starting agent, if ready.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn get_init_config(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AgentInitConfig>>> + Send + '_>>;

    /// Dequeue the next batch of tests for an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn get_next_run_config(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AgentRunConfig>>> + Send + '_>>;

    /// Persist the state an agent reported.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn update_agent_status(
        &self,
        agent_id: &str,
        state: AgentState,
        time: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Whether every result produced by the agent was durably saved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn check_saved_data(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Mark the outstanding test executions of the given agents as failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn mark_test_executions_as_failed(
        &self,
        agent_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Current status of every agent registered for an execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn get_agent_statuses_for_execution(
        &self,
        execution_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AgentStatus>>> + Send + '_>>;

    /// Update the status of an execution, with an optional reason.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        reason: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Register freshly created containers as agents of an execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` on transport or protocol failure.
    fn add_agents(
        &self,
        execution_id: &str,
        container_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
