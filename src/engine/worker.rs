//! Worker supervisor: one claim broker, one lease sweeper and up to N
//! concurrent consumers.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::Services;
use super::broker::{ClaimBroker, ClaimGrant};
use super::consumer::WorkConsumer;
use super::sweeper::LeaseSweeper;
use crate::config::WorkerConfig;
use crate::event::ReleaseReason;
use crate::model::{WorkerId, WorkstreamKey};

pub struct Worker {
    worker_id: WorkerId,
    config: WorkerConfig,
    services: Services,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(worker_id: WorkerId, config: WorkerConfig, services: Services) -> Self {
        Self {
            worker_id,
            config,
            services,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Cancelling this token stops the broker and every consumer, each
    /// releasing its claim.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown and every consumer has released.
    pub async fn run(self) {
        info!(
            worker_id = %self.worker_id,
            max_concurrent_claims = self.config.max_concurrent_claims,
            "worker started"
        );
        let capacity = Arc::new(Semaphore::new(self.config.max_concurrent_claims));
        let (grants_tx, mut grants) = mpsc::channel::<ClaimGrant>(1);
        let broker = ClaimBroker::new(
            self.worker_id.clone(),
            self.config.lease,
            self.config.offer_poll_wait,
            Arc::clone(&self.services.ownership),
            Arc::clone(&self.services.offers),
            Arc::clone(&self.services.queues),
            Arc::clone(&self.services.events),
        );
        let broker_task = tokio::spawn(broker.run(capacity, grants_tx, self.shutdown.clone()));
        let sweeper = LeaseSweeper::new(
            self.config.sweep_interval,
            Arc::clone(&self.services.ownership),
            Arc::clone(&self.services.offers),
            Arc::clone(&self.services.queues),
        );
        let sweeper_task = tokio::spawn(sweeper.run(self.shutdown.clone()));

        let mut consumers: JoinSet<(WorkstreamKey, ReleaseReason)> = JoinSet::new();
        loop {
            tokio::select! {
                grant = grants.recv() => match grant {
                    Some(ClaimGrant { record, permit, serving }) => {
                        let consumer = WorkConsumer::new(
                            record,
                            self.config.clone(),
                            self.services.clone(),
                            self.shutdown.child_token(),
                        );
                        consumers.spawn(async move {
                            let key = consumer.key().clone();
                            let reason = consumer.run().await;
                            drop(serving);
                            drop(permit);
                            (key, reason)
                        });
                    }
                    // The broker only stops on shutdown.
                    None => break,
                },
                Some(done) = consumers.join_next() => log_consumer_exit(done),
            }
        }

        if let Err(e) = broker_task.await {
            error!(error = %e, "claim broker task failed");
        }
        if let Err(e) = sweeper_task.await {
            error!(error = %e, "lease sweeper task failed");
        }
        while let Some(done) = consumers.join_next().await {
            log_consumer_exit(done);
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }
}

fn log_consumer_exit(done: Result<(WorkstreamKey, ReleaseReason), tokio::task::JoinError>) {
    match done {
        Ok((key, reason)) => info!(workstream = %key, %reason, "consumer finished"),
        Err(e) => error!(error = %e, "consumer task failed"),
    }
}
