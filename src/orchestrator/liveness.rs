//! In-memory liveness registry for agent containers.
//!
//! Tracks which containers belong to which execution, when each container
//! was last heard from, and which containers are considered crashed.
//! A single [`RwLock`] guards all indexes; status queries share the lock
//! while every mutation takes it exclusively. No I/O ever happens while
//! the lock is held: callbacks receive cloned snapshots after release.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::{AppError, Result};

#[derive(Debug, Default)]
struct Inner {
    by_execution: HashMap<String, HashSet<String>>,
    owner: HashMap<String, String>,
    last_heartbeat: HashMap<String, DateTime<Utc>>,
    crashed: HashSet<String>,
    crash_handled: HashSet<String>,
    terminating: HashSet<String>,
}

impl Inner {
    fn remove_container(&mut self, container_id: &str) -> bool {
        let Some(execution_id) = self.owner.remove(container_id) else {
            return false;
        };
        if let Some(containers) = self.by_execution.get_mut(&execution_id) {
            containers.remove(container_id);
            if containers.is_empty() {
                self.by_execution.remove(&execution_id);
            }
        }
        self.last_heartbeat.remove(container_id);
        self.crashed.remove(container_id);
        self.crash_handled.remove(container_id);
        self.terminating.remove(container_id);
        true
    }
}

/// Outcome of one [`LivenessTracker::update_by_status`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Containers promoted to crashed during this call.
    pub newly_crashed: Vec<String>,
    /// Subset of `newly_crashed` that the runner reported stopped without
    /// the container ever being told to terminate.
    pub stopped_unexpectedly: Vec<String>,
    /// Stopped containers removed because they were terminating or their
    /// crash had already been handled.
    pub purged: Vec<String>,
    /// Executions left without any container by the purge.
    pub emptied_executions: Vec<String>,
}

impl UpdateSummary {
    /// Whether the call changed anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.newly_crashed.is_empty() && self.purged.is_empty()
    }
}

/// Thread-safe registry of container liveness, owned by the service instance.
#[derive(Debug)]
pub struct LivenessTracker {
    inner: RwLock<Inner>,
    staleness_threshold: Duration,
}

impl LivenessTracker {
    /// Create an empty tracker that presumes containers crashed after
    /// `staleness_threshold` of silence.
    #[must_use]
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            staleness_threshold,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a container or refresh its last heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Invariant` if the container is already registered
    /// under a different execution. The existing binding is left untouched.
    pub fn upsert(
        &self,
        execution_id: &str,
        container_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.write();
        match inner.owner.get(container_id) {
            Some(owner) if owner != execution_id => {
                return Err(AppError::Invariant(format!(
                    "container {container_id} belongs to execution {owner}, \
                     refusing to move it to {execution_id}"
                )));
            }
            Some(_) => {}
            None => {
                inner
                    .owner
                    .insert(container_id.to_owned(), execution_id.to_owned());
                inner
                    .by_execution
                    .entry(execution_id.to_owned())
                    .or_default()
                    .insert(container_id.to_owned());
            }
        }
        inner
            .last_heartbeat
            .insert(container_id.to_owned(), timestamp);
        Ok(())
    }

    /// Flag a known container as crashed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the container is not registered.
    pub fn mark_as_crashed(&self, container_id: &str) -> Result<()> {
        let mut inner = self.write();
        if !inner.owner.contains_key(container_id) {
            return Err(AppError::NotFound(format!(
                "container {container_id} is not tracked"
            )));
        }
        inner.terminating.remove(container_id);
        if inner.crashed.insert(container_id.to_owned()) {
            warn!(container_id, "container marked as crashed");
        }
        Ok(())
    }

    /// Record that a container is under graceful-shutdown supervision.
    ///
    /// Returns `false` if it already was, so callers start at most one
    /// supervision per container. Terminating containers are not promoted
    /// to crashed for staleness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the container is not registered.
    pub fn mark_as_terminating(&self, container_id: &str) -> Result<bool> {
        let mut inner = self.write();
        if !inner.owner.contains_key(container_id) {
            return Err(AppError::NotFound(format!(
                "container {container_id} is not tracked"
            )));
        }
        Ok(inner.terminating.insert(container_id.to_owned()))
    }

    /// Whether a container is under graceful-shutdown supervision.
    #[must_use]
    pub fn is_terminating(&self, container_id: &str) -> bool {
        self.read().terminating.contains(container_id)
    }

    /// Whether a container is flagged crashed.
    #[must_use]
    pub fn is_crashed(&self, container_id: &str) -> bool {
        self.read().crashed.contains(container_id)
    }

    /// Record that the crash of these containers has been reported and
    /// acted upon. Containers that are not crashed are ignored.
    pub fn mark_crash_handled<I, S>(&self, container_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.write();
        for container_id in container_ids {
            let container_id = container_id.as_ref();
            if inner.crashed.contains(container_id) {
                inner.crash_handled.insert(container_id.to_owned());
            }
        }
    }

    /// Remove a container from every index. Returns whether it was known.
    pub fn delete(&self, container_id: &str) -> bool {
        self.write().remove_container(container_id)
    }

    /// Remove several containers from every index.
    pub fn delete_all<I, S>(&self, container_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.write();
        for container_id in container_ids {
            inner.remove_container(container_id.as_ref());
        }
    }

    /// Drop all bookkeeping for an execution. Returns the removed containers.
    pub fn delete_all_by_execution_id(&self, execution_id: &str) -> Vec<String> {
        let mut inner = self.write();
        let containers: Vec<String> = inner
            .by_execution
            .get(execution_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for container_id in &containers {
            inner.remove_container(container_id);
        }
        inner.by_execution.remove(execution_id);
        containers
    }

    /// Whether any container is still registered for the execution.
    #[must_use]
    pub fn contains_any_by_execution_id(&self, execution_id: &str) -> bool {
        self.read()
            .by_execution
            .get(execution_id)
            .is_some_and(|set| !set.is_empty())
    }

    /// Whether the execution has a registered container that is not crashed.
    #[must_use]
    pub fn has_live_containers(&self, execution_id: &str) -> bool {
        let inner = self.read();
        inner
            .by_execution
            .get(execution_id)
            .is_some_and(|set| set.iter().any(|id| !inner.crashed.contains(id)))
    }

    /// Execution owning a container, if tracked.
    #[must_use]
    pub fn execution_id_of(&self, container_id: &str) -> Option<String> {
        self.read().owner.get(container_id).cloned()
    }

    /// Snapshot of every tracked container id.
    #[must_use]
    pub fn container_ids(&self) -> Vec<String> {
        self.read().owner.keys().cloned().collect()
    }

    /// Snapshot of the containers of one execution.
    #[must_use]
    pub fn container_ids_by_execution_id(&self, execution_id: &str) -> Vec<String> {
        self.read()
            .by_execution
            .get(execution_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Call `f` with the crashed set, only if it is non-empty.
    ///
    /// `f` runs after the lock has been released.
    pub fn process_crashed<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(HashSet<String>) -> R,
    {
        let crashed = {
            let inner = self.read();
            if inner.crashed.is_empty() {
                return None;
            }
            inner.crashed.clone()
        };
        Some(f(crashed))
    }

    /// Call `f` with the executions whose every container is crashed,
    /// only if there is at least one.
    ///
    /// `f` runs after the lock has been released.
    pub fn process_execution_with_all_crashed_containers<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(HashSet<String>) -> R,
    {
        let executions: HashSet<String> = {
            let inner = self.read();
            inner
                .by_execution
                .iter()
                .filter(|(_, containers)| {
                    !containers.is_empty()
                        && containers.iter().all(|id| inner.crashed.contains(id))
                })
                .map(|(execution_id, _)| execution_id.clone())
                .collect()
        };
        if executions.is_empty() {
            None
        } else {
            Some(f(executions))
        }
    }

    /// Periodic maintenance.
    ///
    /// A container for which `is_stopped` returns `true` is purged only if
    /// it was terminating or its crash was already handled (see
    /// [`Self::mark_crash_handled`]). A stopped container that is crashed
    /// but not yet handled stays tracked. Any other stopped container died
    /// on its own and is marked crashed, so it goes through the crashed
    /// path before it disappears. Every remaining non-crashed,
    /// non-terminating container silent for longer than the staleness
    /// threshold (relative to `now`) is marked crashed as well. The
    /// predicate must be pre-resolved: it is evaluated under the lock.
    pub fn update_by_status<F>(&self, is_stopped: F, now: DateTime<Utc>) -> UpdateSummary
    where
        F: Fn(&str) -> bool,
    {
        let mut summary = UpdateSummary::default();
        let mut inner = self.write();

        let stopped: Vec<String> = inner
            .owner
            .keys()
            .filter(|id| is_stopped(id.as_str()))
            .cloned()
            .collect();
        for container_id in stopped {
            let purgeable = inner.crash_handled.contains(&container_id)
                || inner.terminating.contains(&container_id);
            if !purgeable {
                if inner.crashed.contains(&container_id) {
                    continue;
                }
                inner.crashed.insert(container_id.clone());
                summary.stopped_unexpectedly.push(container_id.clone());
                summary.newly_crashed.push(container_id);
                continue;
            }

            let owner = inner.owner.get(&container_id).cloned();
            if inner.remove_container(&container_id) {
                summary.purged.push(container_id);
            }
            if let Some(execution_id) = owner {
                if !inner.by_execution.contains_key(&execution_id)
                    && !summary.emptied_executions.contains(&execution_id)
                {
                    summary.emptied_executions.push(execution_id);
                }
            }
        }

        let stale: Vec<String> = inner
            .last_heartbeat
            .iter()
            .filter(|(id, last)| {
                !inner.crashed.contains(*id)
                    && !inner.terminating.contains(*id)
                    && now.signed_duration_since(**last) > self.staleness_threshold
            })
            .map(|(id, _)| id.clone())
            .collect();
        for container_id in stale {
            inner.crashed.insert(container_id.clone());
            summary.newly_crashed.push(container_id);
        }
        drop(inner);

        if !summary.is_empty() {
            debug!(
                crashed = ?summary.newly_crashed,
                stopped_unexpectedly = ?summary.stopped_unexpectedly,
                purged = ?summary.purged,
                "liveness statuses updated"
            );
        }
        summary
    }

    /// Executions that currently have at least one tracked container.
    #[must_use]
    pub fn execution_ids(&self) -> HashSet<String> {
        self.read().by_execution.keys().cloned().collect()
    }
}
