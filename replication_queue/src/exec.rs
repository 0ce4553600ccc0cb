//! The worker seam and the background loops that drive the queue.

use crate::interface::{MergeScheduler, PartStore};
use crate::queue::{QueueEntry, ReplicatedQueue};
use async_trait::async_trait;
use coordinator::{Coordinator, NodeEvent};
use observability_deps::tracing::{debug, info, warn};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Error surfaced by a worker for a hard failure.
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Applies one log entry: fetches a part, runs a merge, attaches, drops.
#[async_trait]
pub trait Worker: Send + Sync + Debug {
    /// Apply `entry`. `Ok(true)` means fully applied and the entry can be
    /// removed; `Ok(false)` means not applied this time with no hard error.
    /// An `Err` is captured onto the entry and never propagated further.
    async fn execute(&self, entry: &QueueEntry) -> Result<bool, WorkerError>;
}

impl ReplicatedQueue {
    /// Run `worker` on `entry`; if it reports the entry as applied, remove
    /// it from the coordinator and from RAM.
    ///
    /// Returns `false` iff the worker failed. The failure is stored in
    /// `entry.exception()` and the entry stays queued for a later retry;
    /// nothing is rethrown across this boundary.
    ///
    /// `get_coordinator` is only consulted on success, so a session that was
    /// re-established while the worker ran is picked up for the removal.
    pub async fn process_entry<G>(
        &self,
        get_coordinator: G,
        entry: Arc<QueueEntry>,
        worker: &dyn Worker,
    ) -> bool
    where
        G: FnOnce() -> Arc<dyn Coordinator> + Send,
    {
        match worker.execute(&entry).await {
            Ok(applied) => {
                if applied {
                    let coord = get_coordinator();
                    self.remove(coord.as_ref(), &entry).await;
                }
                true
            }
            Err(e) => {
                entry.set_exception(Arc::from(e));
                false
            }
        }
    }
}

const IDLE_SLEEP: Duration = Duration::from_secs(1);
const ERROR_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Select-and-execute loop. Runs until `shutdown` is cancelled; several of
/// these may share one queue.
pub async fn run_queue_executor(
    queue: Arc<ReplicatedQueue>,
    coordinator: Arc<dyn Coordinator>,
    merger: Arc<dyn MergeScheduler>,
    store: Arc<dyn PartStore>,
    worker: Arc<dyn Worker>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("queue executor shutdown");
            return;
        }

        let selected = queue.select_entry_to_process(merger.as_ref(), store.as_ref());
        match selected {
            Some((entry, guard)) => {
                let ok = queue
                    .process_entry(
                        || Arc::clone(&coordinator),
                        Arc::clone(&entry),
                        worker.as_ref(),
                    )
                    .await;
                if !ok {
                    debug!(
                        part = %entry.entry().new_part_name,
                        num_tries = entry.num_tries(),
                        "entry failed and stays queued",
                    );
                }
                drop(guard);
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }
    }
}

/// Log-pull loop. After an up-to-date pull it parks on a coordinator watch
/// until the log grows; coordinator errors are retried on the next tick.
pub async fn run_log_puller(
    queue: Arc<ReplicatedQueue>,
    coordinator: Arc<dyn Coordinator>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("log puller shutdown");
            return;
        }

        let log_grew = Arc::new(NodeEvent::new());
        match queue
            .pull_logs_to_queue(coordinator.as_ref(), Some(Arc::clone(&log_grew)))
            .await
        {
            Ok(_) => {
                tokio::select! {
                    _ = log_grew.wait() => {}
                    _ = shutdown.cancelled() => {}
                }
            }
            Err(e) => {
                warn!(%e, "log pull failed");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_RETRY_SLEEP) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }
    }
}
