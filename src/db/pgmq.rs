//! pgmq queue operations via direct SQLx, and the claim-offer queue.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.set_vt, pgmq.archive, pgmq.delete, pgmq.metrics.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::warn;

use super::{Db, OFFER_QUEUE, whole_secs};
use crate::error::Result;
use crate::model::{ClaimOffer, Delivered};
use crate::store::OfferQueue;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

pub(crate) fn record_queue_op(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        record_queue_op(queue_name, "create");
        Ok(())
    }

    /// Create the queue once per process; later calls hit the local cache.
    pub async fn ensure_queue(&self, queue_name: &str) -> Result<()> {
        if self.created_queues_contains(queue_name) {
            return Ok(());
        }
        self.create_queue(queue_name).await?;
        self.created_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(queue_name.to_string());
        Ok(())
    }

    fn created_queues_contains(&self, queue_name: &str) -> bool {
        self.created_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(queue_name)
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        record_queue_op(queue_name, "send");
        Ok(row.0)
    }

    /// Read the oldest visible message, long-polling for up to `wait`.
    /// The message stays hidden for `visibility` unless deleted or reset.
    pub async fn read_with_poll(
        &self,
        queue_name: &str,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, vt, message
             FROM pgmq.read_with_poll($1, $2, 1, $3, 100)",
        )
        .bind(queue_name)
        .bind(whole_secs(visibility))
        .bind(whole_secs(wait))
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });
        record_queue_op(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Change when a read message becomes visible again; zero means now.
    pub async fn set_visibility(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .execute(&self.pool)
            .await?;
        record_queue_op(queue_name, "set_vt");
        Ok(())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_queue_op(queue_name, "archive");
        Ok(())
    }

    /// Delete a message permanently. Returns whether it still existed.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        record_queue_op(queue_name, "delete");
        Ok(row.0)
    }

    /// Messages in the queue, visible or not.
    pub async fn queue_length(&self, queue_name: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl OfferQueue for Db {
    async fn announce(&self, offer: &ClaimOffer) -> Result<()> {
        let payload = serde_json::to_value(offer)?;
        self.retry
            .run("offer.announce", || self.send_to_queue(OFFER_QUEUE, &payload, 0))
            .await?;
        Ok(())
    }

    async fn poll_offer(&self, wait: Duration) -> Result<Option<Delivered<ClaimOffer>>> {
        let Some(msg) = self
            .retry
            .run("offer.poll", || {
                self.read_with_poll(OFFER_QUEUE, self.visibility_timeout, wait)
            })
            .await?
        else {
            return Ok(None);
        };
        match serde_json::from_value::<ClaimOffer>(msg.message.clone()) {
            Ok(offer) => Ok(Some(Delivered {
                receipt: msg.msg_id,
                read_count: msg.read_ct,
                enqueued_at: msg.enqueued_at,
                message: offer,
            })),
            Err(e) => {
                warn!(msg_id = msg.msg_id, error = %e, "malformed claim offer, archiving");
                self.archive_message(OFFER_QUEUE, msg.msg_id).await?;
                Ok(None)
            }
        }
    }

    async fn ack_offer(&self, receipt: i64) -> Result<()> {
        self.retry
            .run("offer.ack", || self.delete_message(OFFER_QUEUE, receipt))
            .await?;
        Ok(())
    }
}
