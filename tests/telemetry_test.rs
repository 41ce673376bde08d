//! Integration tests for telemetry initialization and span helpers.

use workclaim::event::{EventKind, EventSink, ReleaseReason, TracingEventSink};
use workclaim::model::{WorkerId, WorkstreamKey};
use workclaim::telemetry::work::{record_state_transition, start_claim_span, start_dispatch_span};
use workclaim::telemetry::{TelemetryConfig, init_telemetry};

fn key() -> WorkstreamKey {
    WorkstreamKey::new("p1", "u1").unwrap()
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "workclaim-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn claim_span_creates_and_records_transition() {
    let span = start_claim_span(&key(), &WorkerId::new("w1"));
    record_state_transition(&span, "claimed", "idle_owned");
    record_state_transition(&span, "idle_owned", "dispatching");
}

#[test]
fn dispatch_span_accepts_result() {
    let span = start_dispatch_span(&key(), "m1", "t1");
    span.record("dispatch.result", "success");
}

#[test]
fn tracing_sink_accepts_every_event() {
    let sink = TracingEventSink;
    let key = key();
    let worker_id = WorkerId::new("w1");
    sink.emit(EventKind::Claimed {
        workstream: key.clone(),
        worker_id: worker_id.clone(),
    });
    sink.emit(EventKind::Completed {
        workstream: key.clone(),
        message_id: "m1".into(),
        success: false,
        duration_ms: 12,
    });
    sink.emit(EventKind::FlushFailed {
        workstream: key.clone(),
        thread_id: "t1".into(),
        error: "push rejected".into(),
    });
    sink.emit(EventKind::Released {
        workstream: key,
        worker_id,
        reason: ReleaseReason::Idle,
    });
}

#[test]
fn events_serialize_with_type_tag() {
    let event = EventKind::Released {
        workstream: key(),
        worker_id: WorkerId::new("w1"),
        reason: ReleaseReason::LeaseLost,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "released");
    assert_eq!(json["workstream"], "p1#u1");
    assert_eq!(json["reason"], "lease_lost");
}
