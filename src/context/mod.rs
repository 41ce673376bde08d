//! Durable per-thread work contexts (e.g. version-control branches).

pub mod git;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ContextHandle, WorkstreamKey};

pub use git::{GitContextBackend, GitContextConfig};

/// Backend that materializes a thread's durable context on this worker.
#[async_trait]
pub trait ContextBackend: Send + Sync {
    /// Make the thread's context the active one, creating it if needed.
    async fn activate(&self, key: &WorkstreamKey, thread_id: &str) -> Result<ContextHandle>;

    /// Persist any unpersisted state of `context`. Returns whether anything
    /// was written.
    async fn flush(&self, context: &ContextHandle) -> Result<bool>;
}

/// Backend for executors that manage no durable context of their own.
/// The context id is the thread id and flushing writes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughContextBackend;

#[async_trait]
impl ContextBackend for PassthroughContextBackend {
    async fn activate(&self, key: &WorkstreamKey, thread_id: &str) -> Result<ContextHandle> {
        Ok(ContextHandle {
            workstream_key: key.clone(),
            thread_id: thread_id.to_string(),
            context_id: thread_id.to_string(),
        })
    }

    async fn flush(&self, _context: &ContextHandle) -> Result<bool> {
        Ok(false)
    }
}
