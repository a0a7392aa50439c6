//! # Lease renewal (spec.md §4.4 "lease renewal", §4.6 "background task")
//!
//! Extends a message's visibility timeout at a fixed interval while its
//! handler is still running, capped at a total lifetime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use crate::traits::{MessageBus, ReceiptHandle};

/// Handle to a running lease-renewal task; dropping or calling [`LeaseGuard::stop`]
/// ends it. The renewal loop itself self-terminates once `lease_max_total`
/// has elapsed, regardless of whether the caller stops it first.
pub struct LeaseGuard {
    stop_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl LeaseGuard {
    /// Spawns the renewal loop. Returns immediately; the loop runs until
    /// `stop()` is called, the handle is dropped, or `lease_max_total`
    /// elapses (spec.md §6 `lease_max_total_seconds`).
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        receipt: ReceiptHandle,
        renewal_interval: Duration,
        lease_duration: Duration,
        lease_max_total: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + lease_max_total;
            let mut interval = tokio::time::interval(renewal_interval);
            interval.tick().await; // first tick fires immediately; consume it.

            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = interval.tick() => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!(
                                queue = %receipt.queue_name,
                                msg_id = receipt.msg_id,
                                "lease renewal stopping: lease_max_total_seconds reached"
                            );
                            return;
                        }
                        if let Err(e) = bus.extend_visibility(&receipt, lease_duration).await {
                            warn!(
                                queue = %receipt.queue_name,
                                msg_id = receipt.msg_id,
                                error = %e,
                                "failed to extend message visibility"
                            );
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}
