//! Workstream span helpers.
//!
//! Spans for the claim lifecycle and each dispatched message, plus
//! consumer state-transition recording.

use tracing::Span;

use crate::model::{WorkerId, WorkstreamKey};

/// Start a span covering one claim, from successful claim to release.
///
/// The `workstream.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_claim_span(key: &WorkstreamKey, worker_id: &WorkerId) -> Span {
    tracing::info_span!(
        "workstream.claim",
        "workstream.key" = %key,
        "worker.id" = %worker_id,
        "workstream.state" = tracing::field::Empty,
    )
}

/// Start a span for one executor invocation.
pub fn start_dispatch_span(key: &WorkstreamKey, message_id: &str, thread_id: &str) -> Span {
    tracing::info_span!(
        "workstream.dispatch",
        "workstream.key" = %key,
        "message.id" = message_id,
        "thread.id" = thread_id,
        "dispatch.result" = tracing::field::Empty,
    )
}

/// Record a consumer state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("workstream.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
