//! Workstream identity, queue messages, and claim offers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Workstream key
// ---------------------------------------------------------------------------

/// Identifies an isolation unit: one project worked on by one user.
///
/// Rendered as `project#user`. Neither half may be empty or contain `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkstreamKey {
    project: String,
    user: String,
}

/// Namespace for deriving stable per-workstream queue names.
const QUEUE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a44_4b7e_9c5a_0d3e_71b2_a9f4);

impl WorkstreamKey {
    pub fn new(project: impl Into<String>, user: impl Into<String>) -> Result<Self> {
        let project = project.into();
        let user = user.into();
        for (label, part) in [("project", &project), ("user", &user)] {
            if part.is_empty() {
                return Err(Error::InvalidKey(format!("{label} must not be empty")));
            }
            if part.contains('#') {
                return Err(Error::InvalidKey(format!("{label} must not contain '#': {part}")));
            }
        }
        Ok(Self { project, user })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Resolve the durable queue that carries this workstream's messages.
    ///
    /// The name is derived from a UUIDv5 of the key so it stays within
    /// pgmq's identifier limits regardless of key length or characters.
    pub fn queue_handle(&self) -> QueueHandle {
        let id = Uuid::new_v5(&QUEUE_NAMESPACE, self.to_string().as_bytes());
        QueueHandle(format!("ws_{}", id.simple()))
    }
}

impl std::fmt::Display for WorkstreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.project, self.user)
    }
}

impl std::str::FromStr for WorkstreamKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (project, user) = s
            .split_once('#')
            .ok_or_else(|| Error::InvalidKey(format!("expected project#user, got '{s}'")))?;
        Self::new(project, user)
    }
}

impl TryFrom<String> for WorkstreamKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<WorkstreamKey> for String {
    fn from(key: WorkstreamKey) -> Self {
        key.to_string()
    }
}

/// Name of the durable queue resource holding one workstream's messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueHandle(pub String);

impl QueueHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Claim offer
// ---------------------------------------------------------------------------

/// Trigger announcing that a workstream has pending work and no owner.
///
/// Not authoritative: several workers may receive the same offer and only
/// the one whose conditional write lands becomes the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOffer {
    pub workstream_key: WorkstreamKey,
    pub queue_handle: QueueHandle,
}

impl ClaimOffer {
    pub fn for_key(key: &WorkstreamKey) -> Self {
        Self {
            workstream_key: key.clone(),
            queue_handle: key.queue_handle(),
        }
    }
}

// ---------------------------------------------------------------------------
// Work message
// ---------------------------------------------------------------------------

/// A task message in a workstream's ordered queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessage {
    /// Dedup key. Redeliveries carry the same id.
    pub message_id: String,
    pub workstream_key: WorkstreamKey,
    /// Conversation thread this message belongs to.
    pub thread_id: String,
    /// Opaque to the coordinator; interpreted by the task executor.
    pub payload: serde_json::Value,
    /// Position in the workstream queue. Monotonic per workstream.
    pub arrival_order: i64,
    /// Pending callback the executor's result must resolve, if any.
    pub continuation_token: Option<String>,
}

impl WorkMessage {
    /// Messages are ordered within their workstream, so the key is the group.
    pub fn sequence_group(&self) -> &WorkstreamKey {
        &self.workstream_key
    }
}

/// A message handed out by a durable queue, with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Delivered<T> {
    /// Queue-assigned id used to acknowledge or abandon this delivery.
    pub receipt: i64,
    /// How many times the queue has handed this message out.
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub message: T,
}

/// Builder for messages entering a workstream. `arrival_order` is assigned
/// by the queue on enqueue.
#[derive(Debug, Clone)]
pub struct NewWorkMessage {
    pub(crate) message_id: String,
    pub(crate) workstream_key: WorkstreamKey,
    pub(crate) thread_id: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) continuation_token: Option<String>,
}

impl NewWorkMessage {
    pub fn new(
        workstream_key: WorkstreamKey,
        message_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            workstream_key,
            thread_id: thread_id.into(),
            payload: serde_json::Value::Null,
            continuation_token: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn workstream_key(&self) -> &WorkstreamKey {
        &self.workstream_key
    }

    /// Materialize the message once the queue has assigned its position.
    pub fn into_message(self, arrival_order: i64) -> WorkMessage {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let key: WorkstreamKey = "p1#u1".parse().unwrap();
        assert_eq!(key.project(), "p1");
        assert_eq!(key.user(), "u1");
        assert_eq!(key.to_string(), "p1#u1");
    }

    #[test]
    fn key_rejects_malformed_input() {
        assert!("p1".parse::<WorkstreamKey>().is_err());
        assert!("#u1".parse::<WorkstreamKey>().is_err());
        assert!("p1#".parse::<WorkstreamKey>().is_err());
        assert!("p1#u1#x".parse::<WorkstreamKey>().is_err());
    }

    #[test]
    fn queue_handle_is_stable_and_distinct() {
        let a = WorkstreamKey::new("site-a", "alice@example.com").unwrap();
        let b = WorkstreamKey::new("site-a", "bob@example.com").unwrap();
        assert_eq!(a.queue_handle(), a.queue_handle());
        assert_ne!(a.queue_handle(), b.queue_handle());
        let name = a.queue_handle().0;
        assert!(name.starts_with("ws_"));
        assert!(name.len() <= 47);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn new_message_keeps_its_workstream_as_sequence_group() {
        let key = WorkstreamKey::new("p1", "u1").unwrap();
        let message = NewWorkMessage::new(key.clone(), "m1", "t1")
            .continuation("cb-1")
            .into_message(7);
        assert_eq!(message.sequence_group(), &key);
        assert_eq!(message.arrival_order, 7);
        assert_eq!(message.continuation_token.as_deref(), Some("cb-1"));
        assert!(message.payload.is_null());
    }

    #[test]
    fn key_serializes_as_string() {
        let key = WorkstreamKey::new("p1", "u1").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"p1#u1\"");
        let back: WorkstreamKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
