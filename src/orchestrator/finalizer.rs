//! Execution finalization: final status, resource release, bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::liveness::LivenessTracker;
use crate::backend::Backend;
use crate::models::execution::ExecutionStatus;
use crate::runner::ContainerRunner;

/// Why an execution is being finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// Agents shut down (or were purged) after running out of work.
    Completed,
    /// Every remaining container of the execution crashed.
    AllAgentsCrashed,
}

impl FinalizeReason {
    fn status(self) -> (ExecutionStatus, Option<String>) {
        match self {
            Self::Completed => (ExecutionStatus::Finished, None),
            Self::AllAgentsCrashed => (
                ExecutionStatus::Error,
                Some("all agents of the execution crashed".to_owned()),
            ),
        }
    }
}

/// Finalizes each execution at most once.
///
/// Finalized ids are remembered for `retention`, long enough for late
/// shutdown supervisors and watchdog passes of the same execution to
/// observe them, then forgotten.
pub struct ExecutionFinalizer {
    backend: Arc<dyn Backend>,
    runner: Arc<dyn ContainerRunner>,
    liveness: Arc<LivenessTracker>,
    retention: Duration,
    finalized: Mutex<HashMap<String, Instant>>,
}

impl ExecutionFinalizer {
    /// Build a finalizer that remembers finalized executions for `retention`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        runner: Arc<dyn ContainerRunner>,
        liveness: Arc<LivenessTracker>,
        retention: Duration,
    ) -> Self {
        Self {
            backend,
            runner,
            liveness,
            retention,
            finalized: Mutex::new(HashMap::new()),
        }
    }

    fn finalized(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.finalized.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the execution has been finalized by this instance within
    /// the retention window.
    #[must_use]
    pub fn is_finalized(&self, execution_id: &str) -> bool {
        self.finalized()
            .get(execution_id)
            .is_some_and(|at| at.elapsed() <= self.retention)
    }

    /// Drop finalized ids older than the retention window. Returns how
    /// many were forgotten.
    pub fn forget_expired(&self) -> usize {
        let mut finalized = self.finalized();
        let before = finalized.len();
        finalized.retain(|_, at| at.elapsed() <= self.retention);
        let forgotten = before - finalized.len();
        if forgotten > 0 {
            debug!(
                forgotten,
                remaining = finalized.len(),
                "expired finalized executions forgotten"
            );
        }
        forgotten
    }

    /// Persist the final status and release the execution's resources.
    ///
    /// A completed execution is left alone while it still has live
    /// containers. Returns `true` only for the call that finalized.
    /// Backend and runner failures are logged, not propagated: the
    /// execution is considered finalized either way.
    pub async fn finalize(&self, execution_id: &str, reason: FinalizeReason) -> bool {
        if reason == FinalizeReason::Completed && self.liveness.has_live_containers(execution_id) {
            debug!(execution_id, "execution still has live agents, not finalizing");
            return false;
        }

        self.forget_expired();
        let claimed = {
            let mut finalized = self.finalized();
            if finalized.contains_key(execution_id) {
                false
            } else {
                finalized.insert(execution_id.to_owned(), Instant::now());
                true
            }
        };
        if !claimed {
            debug!(execution_id, "execution already finalized");
            return false;
        }

        let removed = self.liveness.delete_all_by_execution_id(execution_id);
        let (status, message) = reason.status();

        if let Err(err) = self
            .backend
            .update_execution_status(execution_id, status, message)
            .await
        {
            error!(%err, execution_id, ?status, "failed to persist final execution status");
        }

        if let Err(err) = self.runner.cleanup(execution_id).await {
            error!(%err, execution_id, "failed to clean up execution resources");
        }

        info!(
            execution_id,
            ?status,
            containers = removed.len(),
            "execution finalized"
        );
        true
    }
}
