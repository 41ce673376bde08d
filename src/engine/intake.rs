//! Intake: the queue-side half of message ingestion.
//!
//! Enqueue first, then look for an owner. A workstream being released at
//! the same moment re-checks its queue after deleting its record, so one
//! of the two sides always announces.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::Services;
use crate::error::Result;
use crate::event::{EventKind, EventSink};
use crate::model::{ClaimOffer, NewWorkMessage, WorkMessage};
use crate::store::{EnqueueResult, OfferQueue, OwnershipStore, WorkQueue};

#[derive(Debug, Clone)]
pub enum SubmitResult {
    /// The message was queued. `offered` says whether a claim offer went out.
    Accepted { message: WorkMessage, offered: bool },
    /// A message with this id was already accepted for the workstream.
    Duplicate { message_id: String },
}

pub struct Intake {
    queues: Arc<dyn WorkQueue>,
    ownership: Arc<dyn OwnershipStore>,
    offers: Arc<dyn OfferQueue>,
    events: Arc<dyn EventSink>,
}

impl Intake {
    pub fn new(
        queues: Arc<dyn WorkQueue>,
        ownership: Arc<dyn OwnershipStore>,
        offers: Arc<dyn OfferQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            queues,
            ownership,
            offers,
            events,
        }
    }

    pub fn from_services(services: &Services) -> Self {
        Self::new(
            Arc::clone(&services.queues),
            Arc::clone(&services.ownership),
            Arc::clone(&services.offers),
            Arc::clone(&services.events),
        )
    }

    #[instrument(
        skip_all,
        fields(workstream = %message.workstream_key(), message_id = %message.message_id())
    )]
    pub async fn submit(&self, message: NewWorkMessage) -> Result<SubmitResult> {
        let key = message.workstream_key().clone();
        let message = match self.queues.enqueue(&key.queue_handle(), message).await? {
            EnqueueResult::Enqueued(message) => message,
            EnqueueResult::Duplicate { message_id } => {
                self.events.emit(EventKind::Duplicate {
                    workstream: key,
                    message_id: message_id.clone(),
                });
                return Ok(SubmitResult::Duplicate { message_id });
            }
        };

        let owned = self
            .ownership
            .get(&key)
            .await?
            .is_some_and(|record| !record.is_expired());
        if owned {
            debug!(arrival_order = message.arrival_order, "workstream owned, no offer needed");
        } else {
            self.offers.announce(&ClaimOffer::for_key(&key)).await?;
            info!(arrival_order = message.arrival_order, "announced claim offer");
        }
        Ok(SubmitResult::Accepted {
            message,
            offered: !owned,
        })
    }
}
