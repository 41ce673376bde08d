//! Storage and queue seams.
//!
//! The coordinator talks to its durable collaborators only through these
//! traits. `crate::db::Db` implements all of them on Postgres + pgmq;
//! [`memory`] provides in-process versions with the same semantics.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    ClaimOffer, ClaimOutcome, Delivered, NewWorkMessage, OwnershipRecord, QueueHandle,
    ThreadContext, WorkMessage, WorkerId, WorkstreamKey,
};

/// Consistent key-value store arbitrating workstream ownership.
///
/// Every mutation is a single atomic conditional write. Implementations must
/// never read-then-write for these transitions.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Create-if-absent: succeeds only when no live record exists for `key`.
    async fn try_claim(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome>;

    /// Extend-if-owned-by-me. `None` means the lease is gone or held by
    /// someone else; the caller has lost authority over the key.
    async fn renew(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<Option<OwnershipRecord>>;

    /// Delete-if-owned-by-me. Returns whether a record was removed.
    async fn release(&self, key: &WorkstreamKey, worker_id: &WorkerId) -> Result<bool>;

    /// The stored record, expired or not.
    async fn get(&self, key: &WorkstreamKey) -> Result<Option<OwnershipRecord>>;

    /// Delete up to `limit` records whose lease has lapsed, returning their
    /// keys. Each lapsed record is returned to exactly one caller.
    async fn reap_expired(&self, limit: usize) -> Result<Vec<WorkstreamKey>>;
}

/// Best-effort, at-least-once queue of claim offers.
#[async_trait]
pub trait OfferQueue: Send + Sync {
    async fn announce(&self, offer: &ClaimOffer) -> Result<()>;

    /// Long-poll for up to `wait`. A returned offer stays invisible to other
    /// pollers until acknowledged or its visibility window lapses.
    async fn poll_offer(&self, wait: Duration) -> Result<Option<Delivered<ClaimOffer>>>;

    async fn ack_offer(&self, receipt: i64) -> Result<()>;
}

/// What happened when a message was offered to a workstream queue.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Enqueued(WorkMessage),
    /// A message with this id was already accepted for the workstream.
    Duplicate { message_id: String },
}

/// Per-workstream ordered, deduplicated durable queues.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, handle: &QueueHandle, message: NewWorkMessage) -> Result<EnqueueResult>;

    /// Long-poll the oldest visible message for up to `wait`.
    async fn receive(
        &self,
        handle: &QueueHandle,
        wait: Duration,
    ) -> Result<Option<Delivered<WorkMessage>>>;

    /// Remove a handled message.
    async fn ack(&self, handle: &QueueHandle, receipt: i64) -> Result<()>;

    /// Make a received-but-unhandled message visible again immediately.
    async fn abandon(&self, handle: &QueueHandle, receipt: i64) -> Result<()>;

    /// Number of messages still in the queue, visible or not.
    async fn pending(&self, handle: &QueueHandle) -> Result<u64>;
}

/// Durable record of thread contexts and which one is active per workstream.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn get_thread(&self, key: &WorkstreamKey, thread_id: &str)
    -> Result<Option<ThreadContext>>;

    /// The context most recently switched to for `key`.
    async fn active_thread(&self, key: &WorkstreamKey) -> Result<Option<ThreadContext>>;

    /// Upsert `context` and mark it active for its workstream.
    async fn record_switch(&self, context: &ThreadContext) -> Result<()>;

    /// Note the latest message handled in a thread.
    async fn touch(&self, key: &WorkstreamKey, thread_id: &str, message_id: &str) -> Result<()>;
}

/// Outcome of one dispatched message, handed to the result-delivery path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub message_id: String,
    pub workstream_key: WorkstreamKey,
    pub thread_id: String,
    pub worker_id: WorkerId,
    pub success: bool,
    pub result_summary: String,
    pub committed: bool,
    pub continuation_token: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Where completed (or failed) dispatch results go.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, record: &ResultRecord) -> Result<()>;
}
