//! Lease sweeper: re-offers workstreams whose owner stopped renewing.
//!
//! Claim offers are acknowledged once a claim lands, and intake only
//! announces while no live owner exists. An owner that dies holding a claim
//! would leave its queued messages with nobody to offer them. Lapsed
//! records are reaped with a conditional delete, so each one is re-offered
//! by exactly one sweeper across the fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ClaimOffer, WorkstreamKey};
use crate::store::{OfferQueue, OwnershipStore, WorkQueue};

/// Lapsed records reaped per sweep.
const SWEEP_BATCH: usize = 100;

pub struct LeaseSweeper {
    interval: Duration,
    ownership: Arc<dyn OwnershipStore>,
    offers: Arc<dyn OfferQueue>,
    queues: Arc<dyn WorkQueue>,
}

impl LeaseSweeper {
    pub fn new(
        interval: Duration,
        ownership: Arc<dyn OwnershipStore>,
        offers: Arc<dyn OfferQueue>,
        queues: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            interval,
            ownership,
            offers,
            queues,
        }
    }

    /// Reap one batch of lapsed leases and announce the workstreams that
    /// still have queued messages. Returns the keys re-offered.
    pub async fn sweep_once(&self) -> Result<Vec<WorkstreamKey>> {
        let reaped = self.ownership.reap_expired(SWEEP_BATCH).await?;
        let mut offered = Vec::new();
        for key in reaped {
            let queue = key.queue_handle();
            // An unknown depth is announced anyway; the broker drops the
            // offer if the queue turns out empty.
            let pending = self.queues.pending(&queue).await.unwrap_or_else(|e| {
                warn!(workstream = %key, error = %e, "cannot check queue depth of reaped workstream");
                1
            });
            if pending == 0 {
                debug!(workstream = %key, "reaped lapsed lease, nothing queued");
                continue;
            }
            if let Err(e) = self.offers.announce(&ClaimOffer::for_key(&key)).await {
                warn!(workstream = %key, error = %e, "failed to re-offer reaped workstream");
                continue;
            }
            info!(workstream = %key, pending, "re-offered workstream after lapsed lease");
            offered.push(key);
        }
        Ok(offered)
    }

    /// Sweep every interval until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "lease sweep failed");
                    }
                }
            }
        }
        debug!("lease sweeper stopped");
    }
}
