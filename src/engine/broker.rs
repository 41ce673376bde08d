//! Claim broker: turns claim offers into owned workstreams.
//!
//! Only the conditional write decides ownership. An offer that loses the
//! race is acknowledged and dropped; an offer whose claim attempt errored
//! is left unacknowledged so the queue redelivers it. Offers for a
//! workstream whose queue is already empty are stale and dropped unclaimed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::Result;
use crate::event::{EventKind, EventSink};
use crate::model::{ClaimOffer, ClaimOutcome, Delivered, OwnershipRecord, WorkerId, WorkstreamKey};
use crate::store::{OfferQueue, OwnershipStore, WorkQueue};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

type ServingCounts = Arc<Mutex<HashMap<WorkstreamKey, usize>>>;

fn lock(counts: &ServingCounts) -> MutexGuard<'_, HashMap<WorkstreamKey, usize>> {
    counts.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a workstream as served by this worker for as long as it lives.
pub struct ServingGuard {
    key: WorkstreamKey,
    counts: ServingCounts,
}

impl ServingGuard {
    fn new(key: WorkstreamKey, counts: &ServingCounts) -> Self {
        *lock(counts).entry(key.clone()).or_default() += 1;
        Self {
            key,
            counts: Arc::clone(counts),
        }
    }
}

impl Drop for ServingGuard {
    fn drop(&mut self) {
        let mut counts = lock(&self.counts);
        if let Some(count) = counts.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.key);
            }
        }
    }
}

/// A successful claim with the capacity slot it occupies.
pub struct ClaimGrant {
    pub record: OwnershipRecord,
    pub permit: OwnedSemaphorePermit,
    pub serving: ServingGuard,
}

pub struct ClaimBroker {
    worker_id: WorkerId,
    lease: Duration,
    poll_wait: Duration,
    ownership: Arc<dyn OwnershipStore>,
    offers: Arc<dyn OfferQueue>,
    queues: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSink>,
    serving: ServingCounts,
}

impl ClaimBroker {
    pub fn new(
        worker_id: WorkerId,
        lease: Duration,
        poll_wait: Duration,
        ownership: Arc<dyn OwnershipStore>,
        offers: Arc<dyn OfferQueue>,
        queues: Arc<dyn WorkQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            worker_id,
            lease,
            poll_wait,
            ownership,
            offers,
            queues,
            events,
            serving: ServingCounts::default(),
        }
    }

    /// Whether a consumer of this worker currently holds a grant for `key`.
    pub fn is_serving(&self, key: &WorkstreamKey) -> bool {
        lock(&self.serving).contains_key(key)
    }

    /// Acknowledge and drop `offer` if its workstream has nothing queued.
    ///
    /// Intake announces once per message that arrives while the workstream
    /// is unowned, so one claim usually drains the work of several offers.
    /// Anything enqueued after this check announces an offer of its own.
    pub async fn discard_if_stale(&self, offer: &Delivered<ClaimOffer>) -> bool {
        let key = &offer.message.workstream_key;
        match self.queues.pending(&offer.message.queue_handle).await {
            Ok(0) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(workstream = %key, error = %e, "cannot check queue depth, claiming anyway");
                return false;
            }
        }
        debug!(workstream = %key, "claim offer is stale, queue empty");
        if let Err(e) = self.offers.ack_offer(offer.receipt).await {
            warn!(receipt = offer.receipt, error = %e, "failed to acknowledge stale claim offer");
        }
        true
    }

    /// Long-poll the offer queue once.
    pub async fn poll_for_offer(&self) -> Result<Option<Delivered<ClaimOffer>>> {
        self.offers.poll_offer(self.poll_wait).await
    }

    /// Attempt the conditional claim for an offered workstream.
    pub async fn try_claim(&self, offer: &Delivered<ClaimOffer>) -> Result<ClaimOutcome> {
        let key = &offer.message.workstream_key;
        let span = tracing::info_span!(
            "claim.attempt",
            workstream = %key,
            worker_id = %self.worker_id
        );
        async {
            let outcome = match self.claim(key).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.events.emit(EventKind::ClaimFailed {
                        workstream: key.clone(),
                        worker_id: self.worker_id.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };
            match &outcome {
                ClaimOutcome::Claimed(_) => self.events.emit(EventKind::Claimed {
                    workstream: key.clone(),
                    worker_id: self.worker_id.clone(),
                }),
                ClaimOutcome::AlreadyOwned => self.events.emit(EventKind::ClaimRejected {
                    workstream: key.clone(),
                    worker_id: self.worker_id.clone(),
                }),
            }
            if let Err(e) = self.offers.ack_offer(offer.receipt).await {
                warn!(receipt = offer.receipt, error = %e, "failed to acknowledge claim offer");
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn claim(&self, key: &WorkstreamKey) -> Result<ClaimOutcome> {
        match self.ownership.try_claim(key, &self.worker_id, self.lease).await? {
            // A claim that landed but whose reply was lost leaves this worker
            // recorded as owner with no consumer. Renew only succeeds if so.
            ClaimOutcome::AlreadyOwned if !self.is_serving(key) => {
                match self.ownership.renew(key, &self.worker_id, self.lease).await? {
                    Some(record) => {
                        info!(workstream = %key, "adopted unserved claim held by this worker");
                        Ok(ClaimOutcome::Claimed(record))
                    }
                    None => Ok(ClaimOutcome::AlreadyOwned),
                }
            }
            outcome => Ok(outcome),
        }
    }

    /// Poll and claim until shutdown, handing each claim to `grants`.
    ///
    /// A capacity permit is taken before polling, so the broker never
    /// claims more workstreams than the worker may run at once.
    pub async fn run(
        self,
        capacity: Arc<Semaphore>,
        grants: mpsc::Sender<ClaimGrant>,
        shutdown: CancellationToken,
    ) {
        info!(worker_id = %self.worker_id, "claim broker started");
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&capacity).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let offer = tokio::select! {
                _ = shutdown.cancelled() => break,
                offer = self.poll_for_offer() => offer,
            };
            let offer = match offer {
                Ok(Some(offer)) => offer,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "claim offer poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                    }
                }
            };
            debug!(
                workstream = %offer.message.workstream_key,
                read_count = offer.read_count,
                "claim offer received"
            );
            if self.discard_if_stale(&offer).await {
                continue;
            }

            match self.try_claim(&offer).await {
                Ok(ClaimOutcome::Claimed(record)) => {
                    let serving = ServingGuard::new(record.workstream_key.clone(), &self.serving);
                    let grant = ClaimGrant {
                        record,
                        permit,
                        serving,
                    };
                    if let Err(mpsc::error::SendError(grant)) = grants.send(grant).await {
                        // Supervisor is gone; hand the claim straight back.
                        let key = &grant.record.workstream_key;
                        if let Err(e) = self.ownership.release(key, &self.worker_id).await {
                            warn!(workstream = %key, error = %e, "failed to release orphaned claim");
                        }
                        break;
                    }
                }
                Ok(ClaimOutcome::AlreadyOwned) => {}
                // Claim errors are already reported; the offer will come back.
                Err(_) => {}
            }
        }
        info!(worker_id = %self.worker_id, "claim broker stopped");
    }
}
