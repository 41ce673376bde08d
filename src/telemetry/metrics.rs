//! Metric instrument factories for workclaim.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workclaim"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for workclaim instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workclaim")
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "already_owned" | "error").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.claims")
        .with_description("Number of workstream claim attempts")
        .build()
}

/// Counter: claims given up.
/// Labels: `reason` ("idle" | "lease_lost" | "shutdown").
pub fn releases() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.releases")
        .with_description("Number of workstream releases")
        .build()
}

/// Counter: lease renewals that found the lease gone.
pub fn lease_renewal_failures() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.lease.renewal_failures")
        .with_description("Lease renewals that discovered lost ownership")
        .build()
}

/// Counter: interrupts of in-flight work.
/// Labels: `kind` ("ack" | "forced").
pub fn interrupts() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.interrupts")
        .with_description("Interrupts of in-flight executor invocations")
        .build()
}

/// Histogram: length of the forced-interrupt streak when a forced interrupt occurs.
/// Labels: `workstream`.
pub fn forced_interrupt_streak() -> Histogram<u64> {
    meter()
        .u64_histogram("workclaim.interrupts.forced_streak")
        .with_description("Consecutive forced interrupts for one workstream")
        .build()
}

/// Counter: dispatched messages by result.
/// Labels: `result` ("success" | "failure" | "interrupted" | "abandoned").
pub fn dispatches() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.dispatches")
        .with_description("Messages dispatched to the task executor")
        .build()
}

/// Histogram: dispatch duration in milliseconds.
/// Labels: `result`.
pub fn dispatch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workclaim.dispatch.duration_ms")
        .with_description("Executor invocation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: context switches.
/// Labels: `flush` ("ok" | "failed" | "none").
pub fn context_switches() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.context.switches")
        .with_description("Thread context switches within a workstream")
        .build()
}

/// Counter: queue-level operations (announce, poll, send, read, ack, abandon).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workclaim.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Gauge: consecutive transient store failures (0 when healthy).
pub fn store_consecutive_failures() -> Gauge<u64> {
    meter()
        .u64_gauge("workclaim.store.consecutive_failures")
        .with_description("Consecutive transient store or queue failures")
        .build()
}
