//! Reconciliation workers
//!
//! A [`Controller`] drains a [`WorkQueue`] with a fixed pool of tokio tasks.
//! The queue guarantees a key is never processed by two workers at once, which
//! is the only concurrency contract a [`Reconciler`] may rely on.

mod orphaned_volume;

pub use orphaned_volume::OrphanedVolumeReconciler;

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::Error;

/// What to do with a key after a successful sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until the next change notification
    AwaitChange,
    /// Look again after a fixed delay; not a failure, no backoff
    Requeue(Duration),
}

impl Action {
    /// Wait for the next change notification
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Requeue after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }
}

/// Level-triggered reconciliation of one key
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Queue key type
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Bring the object behind `key` to its desired state
    ///
    /// Must stop issuing live calls promptly once `cancel` fires. An `Err`
    /// sends the key back through the queue's per-key backoff.
    async fn sync(&self, key: &Self::Key, cancel: CancellationToken) -> Result<Action, Error>;
}

/// Worker pool that feeds keys from a queue to a reconciler
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
}

impl<R: Reconciler> Controller<R> {
    /// Create a controller draining `queue` into `reconciler`
    pub fn new(reconciler: Arc<R>, queue: Arc<WorkQueue<R::Key>>) -> Self {
        Self { reconciler, queue }
    }

    /// Run `workers` workers until `shutdown` fires
    ///
    /// Shutdown stops the queue from handing out keys and cancels in-flight
    /// syncs through child tokens. Returns once every worker has exited.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) {
        info!(
            controller = self.reconciler.name(),
            workers, "starting reconcile workers"
        );

        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(worker(
                id,
                self.reconciler.clone(),
                self.queue.clone(),
                shutdown.clone(),
            ));
        }

        let stopper = tokio::spawn({
            let queue = self.queue.clone();
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                queue.shut_down();
            }
        });

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconcile worker exited abnormally");
            }
        }
        stopper.abort();
        info!(controller = self.reconciler.name(), "reconcile workers stopped");
    }
}

async fn worker<R: Reconciler>(
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let result = reconciler.sync(&key, shutdown.child_token()).await;
        handle_result(reconciler.name(), &queue, &key, result);
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Apply a sync outcome to the queue
///
/// Success clears the key's failure history; an error schedules a backoff
/// retry. Must be called before `done` so a delayed re-add is never lost.
fn handle_result<K>(
    controller: &'static str,
    queue: &WorkQueue<K>,
    key: &K,
    result: Result<Action, Error>,
) where
    K: Clone + Eq + Hash + Display + Send,
{
    match result {
        Ok(Action::AwaitChange) => {
            debug!(%controller, key = %key, "sync completed");
            queue.forget(key);
        }
        Ok(Action::Requeue(delay)) => {
            debug!(%controller, key = %key, delay_secs = delay.as_secs_f64(), "sync completed, requeueing");
            queue.forget(key);
            queue.add_after(key.clone(), delay);
        }
        Err(e) => {
            let requeues = queue.num_requeues(key);
            if e.is_retryable() {
                warn!(%controller, key = %key, requeues, error = %e, "sync failed, retrying with backoff");
            } else {
                error!(%controller, key = %key, requeues, error = %e, "sync failed with a non-retryable error");
            }
            queue.add_rate_limited(key.clone());
        }
    }
}
