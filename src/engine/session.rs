//! Session/branch manager: keeps the active thread context of one claimed
//! workstream in step with the message being dispatched.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, instrument, warn};

use crate::context::ContextBackend;
use crate::error::Result;
use crate::event::{EventKind, EventSink};
use crate::model::{ContextHandle, ThreadContext, WorkstreamKey};
use crate::store::ThreadStore;
use crate::telemetry::metrics;

pub struct SessionManager {
    key: WorkstreamKey,
    threads: Arc<dyn ThreadStore>,
    backend: Arc<dyn ContextBackend>,
    events: Arc<dyn EventSink>,
    /// Context activated on this worker during the current claim.
    current: Option<ContextHandle>,
}

impl SessionManager {
    pub fn new(
        key: WorkstreamKey,
        threads: Arc<dyn ThreadStore>,
        backend: Arc<dyn ContextBackend>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            key,
            threads,
            backend,
            events,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&ContextHandle> {
        self.current.as_ref()
    }

    /// Make `thread_id`'s context the active one.
    ///
    /// The previous thread's context is flushed before the new one is
    /// activated. A failed flush is reported and the switch goes ahead.
    #[instrument(skip_all, fields(workstream = %self.key, thread_id = %thread_id))]
    pub async fn ensure_context(&mut self, thread_id: &str) -> Result<ContextHandle> {
        if let Some(current) = self.current.as_ref().filter(|c| c.thread_id == thread_id) {
            debug!("thread already active");
            return Ok(current.clone());
        }

        let previous = self.current.take();
        let flush_label = match &previous {
            Some(prev) => match self.backend.flush(prev).await {
                Ok(_) => "ok",
                Err(e) => {
                    self.events.emit(EventKind::FlushFailed {
                        workstream: self.key.clone(),
                        thread_id: prev.thread_id.clone(),
                        error: e.to_string(),
                    });
                    "failed"
                }
            },
            None => "none",
        };

        let stored = self.threads.get_thread(&self.key, thread_id).await?;
        let handle = self.backend.activate(&self.key, thread_id).await?;
        let context = ThreadContext {
            thread_id: thread_id.to_string(),
            workstream_key: self.key.clone(),
            context_id: handle.context_id.clone(),
            last_message_id: stored.and_then(|s| s.last_message_id),
            last_switched_at: Utc::now(),
        };
        self.threads.record_switch(&context).await?;
        self.current = Some(handle.clone());

        metrics::context_switches().add(1, &[KeyValue::new("flush", flush_label)]);
        self.events.emit(EventKind::ContextSwitched {
            workstream: self.key.clone(),
            from_thread: previous.map(|p| p.thread_id),
            to_thread: thread_id.to_string(),
            context_id: handle.context_id.clone(),
        });
        Ok(handle)
    }

    /// Note that `message_id` was handled in the current thread.
    pub async fn touch(&self, message_id: &str) {
        let Some(current) = &self.current else {
            return;
        };
        if let Err(e) = self
            .threads
            .touch(&self.key, &current.thread_id, message_id)
            .await
        {
            warn!(workstream = %self.key, %message_id, error = %e, "failed to record last message");
        }
    }

    /// Flush the active context ahead of handing the workstream back.
    pub async fn flush_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        if let Err(e) = self.backend.flush(&current).await {
            self.events.emit(EventKind::FlushFailed {
                workstream: self.key.clone(),
                thread_id: current.thread_id.clone(),
                error: e.to_string(),
            });
        }
    }

    /// Forget the active context without touching it.
    pub fn abandon(&mut self) {
        self.current = None;
    }
}
