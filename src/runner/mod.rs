//! Execution backend abstraction for agent containers.
//!
//! [`ContainerRunner`] hides whether agents run on the local container
//! engine or on a cluster scheduler. [`docker::DockerRunner`] drives the
//! local engine through its CLI.

pub mod docker;
pub mod prune;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use crate::models::container::ContainerRunConfiguration;
use crate::Result;

/// Operations the orchestrator needs from an execution backend.
///
/// Every stop/cleanup operation is idempotent: a missing container or
/// run-unit counts as already stopped.
pub trait ContainerRunner: Send + Sync {
    /// Provision storage and launch `replicas` agent containers.
    ///
    /// Returns as soon as at least one container has been observed, with
    /// the identifiers observed at that point.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` if provisioning fails or no container
    /// shows up within the polling budget.
    fn create(
        &self,
        execution_id: &str,
        configuration: &ContainerRunConfiguration,
        replicas: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;

    /// Start the execution's containers; a no-op where creation implies running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` if the engine refuses to start them.
    fn start(&self, execution_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Stop the execution's run-unit. Not-found is success.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` on engine failure.
    fn stop(&self, execution_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Delete a single container. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` on engine failure.
    fn stop_by_agent_id(
        &self,
        container_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Whether the container no longer exists or is observably terminated.
    ///
    /// A container still being torn down is not stopped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` if the engine cannot be queried.
    fn is_stopped(
        &self,
        container_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Remove the run-unit and provisioned volumes. Safe on a clean slate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` on engine failure.
    fn cleanup(&self, execution_id: &str)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Garbage-collect orphaned backend resources.
    ///
    /// Resources belonging to an execution in `keep` are never touched,
    /// whatever state they are in.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runner` on engine failure.
    fn prune(
        &self,
        keep: HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
