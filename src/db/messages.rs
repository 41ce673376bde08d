//! Per-workstream pgmq queues with a dedup ledger.
//!
//! Enqueue inserts `(workstream_key, message_id)` into `workstream_messages`
//! and calls `pgmq.send` in one transaction, so a message id is accepted at
//! most once per workstream and never half-accepted. The pgmq `msg_id` is
//! the message's arrival order.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Db;
use super::pgmq::record_queue_op;
use crate::error::Result;
use crate::model::{Delivered, NewWorkMessage, QueueHandle, WorkMessage, WorkstreamKey};
use crate::store::{EnqueueResult, WorkQueue};

/// Body stored in pgmq. `arrival_order` is the pgmq msg_id, not stored.
#[derive(Debug, Serialize, Deserialize)]
struct QueuedBody {
    message_id: String,
    workstream_key: WorkstreamKey,
    thread_id: String,
    payload: serde_json::Value,
    continuation_token: Option<String>,
}

impl From<&NewWorkMessage> for QueuedBody {
    fn from(m: &NewWorkMessage) -> Self {
        Self {
            message_id: m.message_id.clone(),
            workstream_key: m.workstream_key.clone(),
            thread_id: m.thread_id.clone(),
            payload: m.payload.clone(),
            continuation_token: m.continuation_token.clone(),
        }
    }
}

impl QueuedBody {
    fn into_message(self, arrival_order: i64) -> WorkMessage {
        WorkMessage {
            message_id: self.message_id,
            workstream_key: self.workstream_key,
            thread_id: self.thread_id,
            payload: self.payload,
            arrival_order,
            continuation_token: self.continuation_token,
        }
    }
}

impl Db {
    async fn enqueue_once(
        &self,
        handle: &QueueHandle,
        message: &NewWorkMessage,
    ) -> Result<EnqueueResult> {
        self.ensure_queue(handle.as_str()).await?;
        let mut tx = self.pool.begin().await?;

        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO workstream_messages (workstream_key, message_id, queue_name, thread_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (workstream_key, message_id) DO NOTHING
             RETURNING message_id",
        )
        .bind(message.workstream_key.to_string())
        .bind(&message.message_id)
        .bind(handle.as_str())
        .bind(&message.thread_id)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(EnqueueResult::Duplicate {
                message_id: message.message_id.clone(),
            });
        }

        let body = serde_json::to_value(QueuedBody::from(message))?;
        let msg_id: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(handle.as_str())
            .bind(&body)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE workstream_messages SET pgmq_msg_id = $1
             WHERE workstream_key = $2 AND message_id = $3",
        )
        .bind(msg_id.0)
        .bind(message.workstream_key.to_string())
        .bind(&message.message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_queue_op(handle.as_str(), "send");
        Ok(EnqueueResult::Enqueued(message.clone().into_message(msg_id.0)))
    }

    async fn receive_once(
        &self,
        handle: &QueueHandle,
        wait: Duration,
    ) -> Result<Option<Delivered<WorkMessage>>> {
        self.ensure_queue(handle.as_str()).await?;
        loop {
            let Some(msg) = self
                .read_with_poll(handle.as_str(), self.visibility_timeout, wait)
                .await?
            else {
                return Ok(None);
            };
            match serde_json::from_value::<QueuedBody>(msg.message) {
                Ok(body) => {
                    return Ok(Some(Delivered {
                        receipt: msg.msg_id,
                        read_count: msg.read_ct,
                        enqueued_at: msg.enqueued_at,
                        message: body.into_message(msg.msg_id),
                    }));
                }
                Err(e) => {
                    // A poison message would otherwise block the FIFO forever.
                    warn!(queue = %handle, msg_id = msg.msg_id, error = %e, "malformed work message, archiving");
                    self.archive_message(handle.as_str(), msg.msg_id).await?;
                }
            }
        }
    }
}

#[async_trait]
impl WorkQueue for Db {
    async fn enqueue(&self, handle: &QueueHandle, message: NewWorkMessage) -> Result<EnqueueResult> {
        self.retry
            .run("queue.enqueue", || self.enqueue_once(handle, &message))
            .await
    }

    async fn receive(
        &self,
        handle: &QueueHandle,
        wait: Duration,
    ) -> Result<Option<Delivered<WorkMessage>>> {
        self.retry
            .run("queue.receive", || self.receive_once(handle, wait))
            .await
    }

    async fn ack(&self, handle: &QueueHandle, receipt: i64) -> Result<()> {
        self.retry
            .run("queue.ack", || self.delete_message(handle.as_str(), receipt))
            .await?;
        Ok(())
    }

    async fn abandon(&self, handle: &QueueHandle, receipt: i64) -> Result<()> {
        self.retry
            .run("queue.abandon", || self.set_visibility(handle.as_str(), receipt, 0))
            .await
    }

    async fn pending(&self, handle: &QueueHandle) -> Result<u64> {
        self.ensure_queue(handle.as_str()).await?;
        let len = self
            .retry
            .run("queue.pending", || self.queue_length(handle.as_str()))
            .await?;
        Ok(u64::try_from(len).unwrap_or(0))
    }
}
