//! In-process store and queue implementations.
//!
//! Same contracts as the Postgres backends: conditional ownership writes,
//! visibility-timeout queues with long-poll, per-workstream dedup. Used by
//! tests and single-process runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    EnqueueResult, OfferQueue, OwnershipStore, ResultRecord, ResultSink, ThreadStore, WorkQueue,
};
use crate::error::Result;
use crate::model::{
    ClaimOffer, ClaimOutcome, Delivered, NewWorkMessage, OwnershipRecord, QueueHandle,
    ThreadContext, WorkMessage, WorkerId, WorkstreamKey,
};

/// Every mutation happens inside one critical section, so a poisoned lock
/// still guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryOwnershipStore {
    records: Mutex<HashMap<WorkstreamKey, OwnershipRecord>>,
}

impl MemoryOwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a record regardless of owner, as an operator or outage would.
    pub fn revoke(&self, key: &WorkstreamKey) -> Option<OwnershipRecord> {
        lock(&self.records).remove(key)
    }
}

#[async_trait]
impl OwnershipStore for MemoryOwnershipStore {
    async fn try_claim(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome> {
        let mut records = lock(&self.records);
        let now = Utc::now();
        if records.get(key).is_some_and(|r| !r.is_expired_at(now)) {
            return Ok(ClaimOutcome::AlreadyOwned);
        }
        let record = OwnershipRecord {
            workstream_key: key.clone(),
            worker_id: worker_id.clone(),
            claimed_at: now,
            last_activity_at: now,
            lease_expires_at: now + lease_delta(lease),
        };
        records.insert(key.clone(), record.clone());
        Ok(ClaimOutcome::Claimed(record))
    }

    async fn renew(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<Option<OwnershipRecord>> {
        let mut records = lock(&self.records);
        let now = Utc::now();
        match records.get_mut(key) {
            Some(record) if record.is_held_by(worker_id, now) => {
                record.last_activity_at = now;
                record.lease_expires_at = now + lease_delta(lease);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, key: &WorkstreamKey, worker_id: &WorkerId) -> Result<bool> {
        let mut records = lock(&self.records);
        if records.get(key).is_some_and(|r| r.is_owned_by(worker_id)) {
            records.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, key: &WorkstreamKey) -> Result<Option<OwnershipRecord>> {
        Ok(lock(&self.records).get(key).cloned())
    }

    async fn reap_expired(&self, limit: usize) -> Result<Vec<WorkstreamKey>> {
        let mut records = lock(&self.records);
        let now = Utc::now();
        let lapsed: Vec<WorkstreamKey> = records
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.workstream_key.clone())
            .take(limit)
            .collect();
        for key in &lapsed {
            records.remove(key);
        }
        Ok(lapsed)
    }
}

// ---------------------------------------------------------------------------
// Visibility-timeout queue
// ---------------------------------------------------------------------------

struct Entry<T> {
    message: T,
    enqueued_at: chrono::DateTime<Utc>,
    visible_at: Instant,
    read_count: i32,
}

struct QueueState<T> {
    next_id: i64,
    entries: BTreeMap<i64, Entry<T>>,
}

/// FIFO by receipt id; a received entry is hidden until acked, abandoned,
/// or its visibility window lapses.
struct VisibilityQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: Clone> VisibilityQueue<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn push_with(&self, build: impl FnOnce(i64) -> T) -> T {
        let message = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            let message = build(id);
            state.entries.insert(
                id,
                Entry {
                    message: message.clone(),
                    enqueued_at: Utc::now(),
                    visible_at: Instant::now(),
                    read_count: 0,
                },
            );
            message
        };
        self.notify.notify_waiters();
        message
    }

    async fn receive(&self, wait: Duration, visibility: Duration) -> Option<Delivered<T>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut state = lock(&self.state);
                let now = Instant::now();
                if let Some((id, entry)) = state
                    .entries
                    .iter_mut()
                    .find(|(_, e)| e.visible_at <= now)
                {
                    entry.visible_at = now + visibility;
                    entry.read_count += 1;
                    return Some(Delivered {
                        receipt: *id,
                        read_count: entry.read_count,
                        enqueued_at: entry.enqueued_at,
                        message: entry.message.clone(),
                    });
                }
                state.entries.values().map(|e| e.visible_at).min()
            };

            if Instant::now() >= deadline {
                return None;
            }
            let wake = next_visible.map_or(deadline, |v| v.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    fn remove(&self, id: i64) -> bool {
        lock(&self.state).entries.remove(&id).is_some()
    }

    fn make_visible(&self, id: i64) {
        let found = {
            let mut state = lock(&self.state);
            match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.visible_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }
}

// ---------------------------------------------------------------------------
// Claim offers
// ---------------------------------------------------------------------------

pub struct MemoryOfferQueue {
    queue: VisibilityQueue<ClaimOffer>,
    visibility: Duration,
}

impl MemoryOfferQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            queue: VisibilityQueue::new(),
            visibility,
        }
    }

    /// Offers not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl OfferQueue for MemoryOfferQueue {
    async fn announce(&self, offer: &ClaimOffer) -> Result<()> {
        self.queue.push_with(|_| offer.clone());
        Ok(())
    }

    async fn poll_offer(&self, wait: Duration) -> Result<Option<Delivered<ClaimOffer>>> {
        Ok(self.queue.receive(wait, self.visibility).await)
    }

    async fn ack_offer(&self, receipt: i64) -> Result<()> {
        self.queue.remove(receipt);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workstream queues
// ---------------------------------------------------------------------------

pub struct MemoryWorkQueue {
    queues: Mutex<HashMap<QueueHandle, Arc<VisibilityQueue<WorkMessage>>>>,
    accepted: Mutex<HashSet<(QueueHandle, String)>>,
    visibility: Duration,
}

impl MemoryWorkQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            accepted: Mutex::new(HashSet::new()),
            visibility,
        }
    }

    fn queue(&self, handle: &QueueHandle) -> Arc<VisibilityQueue<WorkMessage>> {
        Arc::clone(
            lock(&self.queues)
                .entry(handle.clone())
                .or_insert_with(|| Arc::new(VisibilityQueue::new())),
        )
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, handle: &QueueHandle, message: NewWorkMessage) -> Result<EnqueueResult> {
        let queue = self.queue(handle);
        let mut accepted = lock(&self.accepted);
        let dedup = (handle.clone(), message.message_id().to_string());
        if accepted.contains(&dedup) {
            return Ok(EnqueueResult::Duplicate {
                message_id: dedup.1,
            });
        }
        let message = queue.push_with(|id| message.into_message(id));
        accepted.insert(dedup);
        Ok(EnqueueResult::Enqueued(message))
    }

    async fn receive(
        &self,
        handle: &QueueHandle,
        wait: Duration,
    ) -> Result<Option<Delivered<WorkMessage>>> {
        let queue = self.queue(handle);
        Ok(queue.receive(wait, self.visibility).await)
    }

    async fn ack(&self, handle: &QueueHandle, receipt: i64) -> Result<()> {
        self.queue(handle).remove(receipt);
        Ok(())
    }

    async fn abandon(&self, handle: &QueueHandle, receipt: i64) -> Result<()> {
        self.queue(handle).make_visible(receipt);
        Ok(())
    }

    async fn pending(&self, handle: &QueueHandle) -> Result<u64> {
        Ok(self.queue(handle).len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Thread contexts
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<(WorkstreamKey, String), ThreadContext>>,
    active: Mutex<HashMap<WorkstreamKey, String>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn get_thread(
        &self,
        key: &WorkstreamKey,
        thread_id: &str,
    ) -> Result<Option<ThreadContext>> {
        Ok(lock(&self.threads)
            .get(&(key.clone(), thread_id.to_string()))
            .cloned())
    }

    async fn active_thread(&self, key: &WorkstreamKey) -> Result<Option<ThreadContext>> {
        let Some(thread_id) = lock(&self.active).get(key).cloned() else {
            return Ok(None);
        };
        self.get_thread(key, &thread_id).await
    }

    async fn record_switch(&self, context: &ThreadContext) -> Result<()> {
        lock(&self.threads).insert(
            (context.workstream_key.clone(), context.thread_id.clone()),
            context.clone(),
        );
        lock(&self.active).insert(context.workstream_key.clone(), context.thread_id.clone());
        Ok(())
    }

    async fn touch(&self, key: &WorkstreamKey, thread_id: &str, message_id: &str) -> Result<()> {
        if let Some(ctx) = lock(&self.threads).get_mut(&(key.clone(), thread_id.to_string())) {
            ctx.last_message_id = Some(message_id.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryResultSink {
    records: Mutex<Vec<ResultRecord>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivered results in delivery order.
    pub fn records(&self) -> Vec<ResultRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn deliver(&self, record: &ResultRecord) -> Result<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }
}
