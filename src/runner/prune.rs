//! Scheduled garbage collection of orphaned runner resources.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::ContainerRunner;

/// Spawn the prune background task.
///
/// The first prune happens immediately, then every `interval`. `protected`
/// is asked on every tick for the executions whose resources must survive
/// the prune.
#[must_use]
pub fn spawn_prune_task<P>(
    runner: Arc<dyn ContainerRunner>,
    interval: Duration,
    protected: P,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    P: Fn() -> HashSet<String> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("prune task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = runner.prune(protected()).await {
                        error!(?err, "runner prune failed");
                    }
                }
            }
        }
    })
}
