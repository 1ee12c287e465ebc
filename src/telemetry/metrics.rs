//! Metric instrument factories for rmsq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"rmsq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for rmsq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("rmsq")
}

/// Counter: put_request calls.
/// Labels: `result` ("created" | "updated" | "canceled" | "duplicate" | "error").
pub fn requests_put() -> Counter<u64> {
    meter()
        .u64_counter("rmsq.requests.put")
        .with_description("Number of requests enqueued or updated")
        .build()
}

/// Counter: requests flipped to Assigned.
/// Labels: `mode` ("named" | "anonymous" | "bulk").
pub fn requests_claimed() -> Counter<u64> {
    meter()
        .u64_counter("rmsq.requests.claimed")
        .with_description("Number of requests claimed by workers")
        .build()
}

/// Counter: request status changes.
/// Labels: `from`, `to`.
pub fn status_changes() -> Counter<u64> {
    meter()
        .u64_counter("rmsq.requests.status_changes")
        .with_description("Number of request status changes")
        .build()
}

/// Counter: operations run through a handler.
/// Labels: `operation_type`, `result`.
pub fn operations_handled() -> Counter<u64> {
    meter()
        .u64_counter("rmsq.operations.handled")
        .with_description("Number of operations executed by the agent")
        .build()
}

/// Histogram: agent cycle duration in milliseconds.
/// Labels: `requests`.
pub fn cycle_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rmsq.agent.cycle_duration_ms")
        .with_description("Agent cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}
