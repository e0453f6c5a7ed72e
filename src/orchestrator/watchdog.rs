//! Periodic crash/timeout watchdog.
//!
//! Each pass resolves which tracked containers the runner reports as
//! stopped (outside the tracker lock), promotes silent containers to
//! crashed, reacts to crashed containers, and finalizes executions that
//! have no surviving agents.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::finalizer::{ExecutionFinalizer, FinalizeReason};
use super::liveness::{LivenessTracker, UpdateSummary};
use crate::backend::Backend;
use crate::models::agent::AgentState;
use crate::runner::ContainerRunner;

/// One watchdog instance per service.
pub struct Watchdog {
    backend: Arc<dyn Backend>,
    runner: Arc<dyn ContainerRunner>,
    liveness: Arc<LivenessTracker>,
    finalizer: Arc<ExecutionFinalizer>,
}

impl Watchdog {
    /// Build a watchdog.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        runner: Arc<dyn ContainerRunner>,
        liveness: Arc<LivenessTracker>,
        finalizer: Arc<ExecutionFinalizer>,
    ) -> Self {
        Self {
            backend,
            runner,
            liveness,
            finalizer,
        }
    }

    /// Run a single pass as of `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> UpdateSummary {
        self.finalizer.forget_expired();
        let stopped = self.resolve_stopped().await;
        let summary = self
            .liveness
            .update_by_status(|id| stopped.contains(id), now);

        for container_id in &summary.stopped_unexpectedly {
            warn!(container_id, "container stopped without being told to terminate");
        }

        for execution_id in &summary.emptied_executions {
            debug!(execution_id, "all containers of execution stopped");
            self.finalizer
                .finalize(execution_id, FinalizeReason::Completed)
                .await;
        }

        if let Some(handling) = self
            .liveness
            .process_crashed(|crashed| self.handle_crashed(crashed, now))
        {
            handling.await;
        }

        if let Some(handling) = self
            .liveness
            .process_execution_with_all_crashed_containers(|executions| {
                self.handle_all_crashed(executions)
            })
        {
            handling.await;
        }

        summary
    }

    async fn resolve_stopped(&self) -> HashSet<String> {
        let ids = self.liveness.container_ids();
        let checks = ids.iter().map(|id| self.runner.is_stopped(id));
        let results = join_all(checks).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(true) => Some(id),
                Ok(false) => None,
                Err(err) => {
                    warn!(%err, container_id = %id, "failed to check container state");
                    None
                }
            })
            .collect()
    }

    async fn handle_crashed(&self, crashed: HashSet<String>, now: DateTime<Utc>) {
        let crashed: Vec<String> = crashed.into_iter().collect();
        info!(count = crashed.len(), containers = ?crashed, "handling crashed agents");

        for container_id in &crashed {
            if let Err(err) = self
                .backend
                .update_agent_status(container_id, AgentState::Crashed, now)
                .await
            {
                warn!(%err, container_id, "failed to persist crashed state");
            }
        }

        if let Err(err) = self.backend.mark_test_executions_as_failed(&crashed).await {
            warn!(%err, "failed to mark test executions of crashed agents as failed");
        }

        for container_id in &crashed {
            if let Err(err) = self.runner.stop_by_agent_id(container_id).await {
                warn!(%err, container_id, "failed to stop crashed agent");
            }
        }
        self.liveness.mark_crash_handled(&crashed);
    }

    async fn handle_all_crashed(&self, executions: HashSet<String>) {
        for execution_id in executions {
            warn!(execution_id, "every agent of the execution crashed, cleaning up");
            self.finalizer
                .finalize(&execution_id, FinalizeReason::AllAgentsCrashed)
                .await;
        }
    }
}

/// Spawn the watchdog loop, ticking every `interval` until `cancel` fires.
#[must_use]
pub fn spawn_watchdog(
    watchdog: Arc<Watchdog>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("watchdog shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let summary = watchdog.run_pass(Utc::now()).await;
                        if !summary.is_empty() {
                            info!(
                                crashed = summary.newly_crashed.len(),
                                purged = summary.purged.len(),
                                "watchdog pass changed liveness"
                            );
                        }
                    }
                }
            }
        }
        .instrument(info_span!("watchdog")),
    )
}
