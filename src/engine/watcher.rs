//! Queue watcher: long-polls one workstream queue on behalf of a consumer.
//!
//! A slot in the hand-off channel is reserved before each receive, so the
//! watcher never reads a message it cannot pass on. An in-flight receive is
//! allowed to finish after cancellation; whatever it returned is abandoned
//! so it becomes visible again at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::model::{Delivered, QueueHandle, WorkMessage};
use crate::store::WorkQueue;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct QueueWatcher {
    pub deliveries: mpsc::Receiver<Delivered<WorkMessage>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl QueueWatcher {
    pub fn spawn(queues: Arc<dyn WorkQueue>, queue: QueueHandle, wait: Duration) -> Self {
        let (tx, deliveries) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let span = tracing::debug_span!("queue.watch", queue = %queue);
        let task = tokio::spawn(watch(queues, queue, wait, tx, cancel.clone()).instrument(span));
        Self {
            deliveries,
            cancel,
            task,
        }
    }

    /// Stop polling and return every message read but not yet handled.
    pub async fn stop(mut self) -> Vec<Delivered<WorkMessage>> {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "queue watcher task failed");
        }
        self.deliveries.close();
        let mut held = Vec::new();
        while let Ok(delivery) = self.deliveries.try_recv() {
            held.push(delivery);
        }
        held
    }
}

async fn watch(
    queues: Arc<dyn WorkQueue>,
    queue: QueueHandle,
    wait: Duration,
    tx: mpsc::Sender<Delivered<WorkMessage>>,
    cancel: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match queues.receive(&queue, wait).await {
            Ok(Some(delivery)) if cancel.is_cancelled() => {
                abandon(queues.as_ref(), &queue, delivery.receipt).await;
                break;
            }
            Ok(Some(delivery)) => {
                debug!(
                    message_id = %delivery.message.message_id,
                    arrival_order = delivery.message.arrival_order,
                    read_count = delivery.read_count,
                    "message received"
                );
                permit.send(delivery);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "workstream queue receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

pub(crate) async fn abandon(queues: &dyn WorkQueue, queue: &QueueHandle, receipt: i64) {
    if let Err(e) = queues.abandon(queue, receipt).await {
        warn!(%queue, receipt, error = %e, "failed to abandon held message");
    }
}
