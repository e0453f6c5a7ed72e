//! Graceful shutdown supervision after a terminate signal.
//!
//! Once an agent has been told to terminate, its container is polled with
//! [`ContainerRunner::is_stopped`] at a fixed sub-interval. The poll is
//! bounded by both a check count and a wall-clock timeout, whichever comes
//! first, so it always hands control back: a stopped container is purged
//! from the [`LivenessTracker`], one that is still around is marked
//! crashed and left to the watchdog.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::finalizer::{ExecutionFinalizer, FinalizeReason};
use super::liveness::LivenessTracker;
use crate::config::ShutdownConfig;
use crate::runner::ContainerRunner;

/// How a supervised shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The runner reported the container stopped in time.
    Stopped,
    /// The container did not stop within the bounds.
    TimedOut,
}

/// Supervises the actual stop of agents that received a terminate signal.
pub struct GracefulShutdown {
    runner: Arc<dyn ContainerRunner>,
    liveness: Arc<LivenessTracker>,
    finalizer: Arc<ExecutionFinalizer>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    /// Build a supervisor.
    #[must_use]
    pub fn new(
        runner: Arc<dyn ContainerRunner>,
        liveness: Arc<LivenessTracker>,
        finalizer: Arc<ExecutionFinalizer>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            runner,
            liveness,
            finalizer,
            config,
        }
    }

    /// Supervise in a background task.
    #[must_use]
    pub fn spawn(
        self: &Arc<Self>,
        execution_id: String,
        container_id: String,
    ) -> JoinHandle<ShutdownOutcome> {
        let this = Arc::clone(self);
        let span = info_span!(
            "graceful_shutdown",
            execution_id = %execution_id,
            container_id = %container_id
        );
        tokio::spawn(
            async move { this.supervise(&execution_id, &container_id).await }.instrument(span),
        )
    }

    /// Wait for the container to stop, then finalize the execution once.
    pub async fn supervise(&self, execution_id: &str, container_id: &str) -> ShutdownOutcome {
        let outcome = match tokio::time::timeout(
            self.config.timeout(),
            self.poll_until_stopped(container_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ShutdownOutcome::TimedOut,
        };

        match outcome {
            ShutdownOutcome::Stopped => {
                self.liveness.delete(container_id);
                info!(container_id, "agent stopped gracefully");
            }
            ShutdownOutcome::TimedOut => {
                warn!(
                    container_id,
                    timeout_seconds = self.config.timeout_seconds,
                    "agent did not stop in time, marking as crashed"
                );
                if let Err(err) = self.liveness.mark_as_crashed(container_id) {
                    debug!(%err, container_id, "container no longer tracked");
                }
            }
        }

        self.finalizer
            .finalize(execution_id, FinalizeReason::Completed)
            .await;
        outcome
    }

    async fn poll_until_stopped(&self, container_id: &str) -> ShutdownOutcome {
        for check in 1..=self.config.max_checks {
            tokio::time::sleep(self.config.check_interval()).await;
            match self.runner.is_stopped(container_id).await {
                Ok(true) => {
                    debug!(container_id, check, "container reported stopped");
                    return ShutdownOutcome::Stopped;
                }
                Ok(false) => {}
                Err(err) => warn!(%err, container_id, check, "failed to check container state"),
            }
        }
        ShutdownOutcome::TimedOut
    }
}
