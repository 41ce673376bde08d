//! Structured observability events.
//!
//! Every claim, dispatch, interrupt, context switch, lease failure and
//! release is emitted through an [`EventSink`]. The tracing sink is the
//! production voice; the recording sink keeps an ordered trace that can be
//! inspected after the fact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::model::{WorkerId, WorkstreamKey};
use crate::telemetry::metrics;

/// Why a consumer gave up its claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Idle timer expired with nothing to do.
    Idle,
    /// The ownership record was gone or held by someone else.
    LeaseLost,
    /// The worker is shutting down.
    Shutdown,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReleaseReason::Idle => "idle",
            ReleaseReason::LeaseLost => "lease_lost",
            ReleaseReason::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// How an interrupted executor invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// The executor stopped on its own within the grace period.
    Ack,
    /// The grace period lapsed and the invocation was cancelled hard.
    Forced,
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterruptKind::Ack => "ack",
            InterruptKind::Forced => "forced",
        };
        write!(f, "{s}")
    }
}

/// A structured event with its position in the sink's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per sink.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Claimed {
        workstream: WorkstreamKey,
        worker_id: WorkerId,
    },
    ClaimRejected {
        workstream: WorkstreamKey,
        worker_id: WorkerId,
    },
    ClaimFailed {
        workstream: WorkstreamKey,
        worker_id: WorkerId,
        error: String,
    },
    Duplicate {
        workstream: WorkstreamKey,
        message_id: String,
    },
    Dispatched {
        workstream: WorkstreamKey,
        message_id: String,
        thread_id: String,
        arrival_order: i64,
    },
    Completed {
        workstream: WorkstreamKey,
        message_id: String,
        success: bool,
        duration_ms: u64,
    },
    InterruptRequested {
        workstream: WorkstreamKey,
        message_id: String,
        superseded_by: String,
    },
    Interrupted {
        workstream: WorkstreamKey,
        message_id: String,
        kind: InterruptKind,
        waited_ms: u64,
    },
    ContextSwitched {
        workstream: WorkstreamKey,
        from_thread: Option<String>,
        to_thread: String,
        context_id: String,
    },
    FlushFailed {
        workstream: WorkstreamKey,
        thread_id: String,
        error: String,
    },
    LeaseRenewalFailed {
        workstream: WorkstreamKey,
        worker_id: WorkerId,
    },
    ResultDiscarded {
        workstream: WorkstreamKey,
        message_id: String,
    },
    Released {
        workstream: WorkstreamKey,
        worker_id: WorkerId,
        reason: ReleaseReason,
    },
}

/// Receives observability events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, kind: EventKind);
}

/// Logs each event at its severity and bumps the matching metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, kind: EventKind) {
        match kind {
            EventKind::Claimed {
                workstream,
                worker_id,
            } => {
                info!(%workstream, %worker_id, "claimed workstream");
                metrics::claims().add(1, &[KeyValue::new("result", "claimed")]);
            }
            EventKind::ClaimRejected {
                workstream,
                worker_id,
            } => {
                info!(%workstream, %worker_id, "workstream already owned, discarding offer");
                metrics::claims().add(1, &[KeyValue::new("result", "already_owned")]);
            }
            EventKind::ClaimFailed {
                workstream,
                worker_id,
                error,
            } => {
                warn!(%workstream, %worker_id, %error, "claim attempt failed");
                metrics::claims().add(1, &[KeyValue::new("result", "error")]);
            }
            EventKind::Duplicate {
                workstream,
                message_id,
            } => {
                info!(%workstream, %message_id, "duplicate delivery ignored");
            }
            EventKind::Dispatched {
                workstream,
                message_id,
                thread_id,
                arrival_order,
            } => {
                info!(%workstream, %message_id, %thread_id, arrival_order, "dispatching message");
            }
            EventKind::Completed {
                workstream,
                message_id,
                success,
                duration_ms,
            } => {
                let result = if success { "success" } else { "failure" };
                if success {
                    info!(%workstream, %message_id, duration_ms, "dispatch completed");
                } else {
                    warn!(%workstream, %message_id, duration_ms, "executor reported failure");
                }
                metrics::dispatches().add(1, &[KeyValue::new("result", result)]);
                metrics::dispatch_duration_ms()
                    .record(duration_ms as f64, &[KeyValue::new("result", result)]);
            }
            EventKind::InterruptRequested {
                workstream,
                message_id,
                superseded_by,
            } => {
                info!(%workstream, %message_id, %superseded_by, "interrupt requested");
            }
            EventKind::Interrupted {
                workstream,
                message_id,
                kind,
                waited_ms,
            } => {
                match kind {
                    InterruptKind::Ack => {
                        info!(%workstream, %message_id, waited_ms, "executor acknowledged stop");
                    }
                    InterruptKind::Forced => {
                        warn!(%workstream, %message_id, waited_ms, "forced-interrupt");
                    }
                }
                metrics::interrupts().add(1, &[KeyValue::new("kind", kind.to_string())]);
                metrics::dispatches().add(1, &[KeyValue::new("result", "interrupted")]);
            }
            EventKind::ContextSwitched {
                workstream,
                from_thread,
                to_thread,
                context_id,
            } => {
                info!(
                    %workstream,
                    from_thread = from_thread.as_deref().unwrap_or("-"),
                    %to_thread,
                    %context_id,
                    "context switched"
                );
            }
            EventKind::FlushFailed {
                workstream,
                thread_id,
                error,
            } => {
                error!(
                    %workstream,
                    %thread_id,
                    %error,
                    "FAILED TO FLUSH previous thread context; switching anyway, its unflushed edits may be lost"
                );
            }
            EventKind::LeaseRenewalFailed {
                workstream,
                worker_id,
            } => {
                error!(%workstream, %worker_id, "lease lost, stopping dispatch");
                metrics::lease_renewal_failures().add(1, &[]);
            }
            EventKind::ResultDiscarded {
                workstream,
                message_id,
            } => {
                warn!(%workstream, %message_id, "result discarded after lease loss");
                metrics::dispatches().add(1, &[KeyValue::new("result", "abandoned")]);
            }
            EventKind::Released {
                workstream,
                worker_id,
                reason,
            } => {
                info!(%workstream, %worker_id, %reason, "released workstream");
                metrics::releases().add(1, &[KeyValue::new("reason", reason.to_string())]);
            }
        }
    }
}

/// Keeps every event in emission order.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    seq: AtomicU64,
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, kind: EventKind) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        events.push(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}
