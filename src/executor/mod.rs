//! Task executor seam.
//!
//! The executor performs the slow, cancellable content-generation work for
//! one message. The coordinator only starts it, asks it to stop, and reads
//! its report.

pub mod hook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{ContextHandle, WorkMessage, WorkstreamKey};

pub use hook::{HookConfig, HookExecutor};

/// Everything the executor needs for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub workstream_key: WorkstreamKey,
    pub message_id: String,
    pub thread_id: String,
    pub payload: serde_json::Value,
    pub continuation_token: Option<String>,
    pub context: ContextHandle,
}

impl ExecutionRequest {
    pub fn new(message: &WorkMessage, context: ContextHandle) -> Self {
        Self {
            workstream_key: message.workstream_key.clone(),
            message_id: message.message_id.clone(),
            thread_id: message.thread_id.clone(),
            payload: message.payload.clone(),
            continuation_token: message.continuation_token.clone(),
            context,
        }
    }
}

/// What a finished invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub result_summary: String,
    /// Whether the executor durably committed its effects.
    #[serde(default)]
    pub committed: bool,
}

impl ExecutionOutcome {
    pub fn success(summary: impl Into<String>, committed: bool) -> Self {
        Self {
            success: true,
            result_summary: summary.into(),
            committed,
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            result_summary: summary.into(),
            committed: false,
        }
    }
}

/// How an invocation ended from the executor's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionReport {
    Finished(ExecutionOutcome),
    /// The executor honoured the stop signal. `committed` says whether the
    /// partial work it flushed before stopping landed durably.
    Stopped { committed: bool },
}

/// Runs one message. Implementations should watch `cancel` and return
/// [`ExecutionReport::Stopped`] promptly once it fires, after persisting
/// whatever partial result they can. Commits must be all-or-nothing per
/// invocation: the coordinator may drop the future at any await point once
/// the grace period lapses.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport>;
}
