//! Per-thread durable work contexts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workstream::WorkstreamKey;

/// Durable context (e.g. a branch) a conversation thread works in.
///
/// Created on the first message for a thread, updated on every switch,
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContext {
    pub thread_id: String,
    pub workstream_key: WorkstreamKey,
    /// Backend-specific id of the durable context, e.g. a branch name.
    pub context_id: String,
    pub last_message_id: Option<String>,
    pub last_switched_at: DateTime<Utc>,
}

impl ThreadContext {
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            workstream_key: self.workstream_key.clone(),
            thread_id: self.thread_id.clone(),
            context_id: self.context_id.clone(),
        }
    }
}

/// An activated context, passed to the executor and later flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHandle {
    pub workstream_key: WorkstreamKey,
    pub thread_id: String,
    pub context_id: String,
}
