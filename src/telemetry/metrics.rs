//! Metric instruments, created from the global `"outbox-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("outbox-rs")
}

/// Counter: units added by producers.
pub fn units_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("outbox.units.enqueued")
        .with_description("Number of units enqueued")
        .build()
}

/// Counter: finished attempts.
/// Labels: `result` ("completed" | "retry" | "dropped").
pub fn unit_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("outbox.units.outcomes")
        .with_description("Outcome of unit attempts")
        .build()
}

/// Counter: store reads or writes that failed.
/// Labels: `operation` ("load" | "save").
pub fn persistence_failures() -> Counter<u64> {
    meter()
        .u64_counter("outbox.persistence.failures")
        .with_description("Number of failed persistence operations")
        .build()
}

/// Counter: blocks handed to an execution context by the throttler.
/// Labels: `context`.
pub fn throttle_dispatches() -> Counter<u64> {
    meter()
        .u64_counter("outbox.throttle.dispatches")
        .with_description("Number of throttled blocks dispatched")
        .build()
}

/// Histogram: attempt duration in milliseconds.
/// Labels: `result` ("ok" | "error").
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("outbox.attempt.duration_ms")
        .with_description("Unit attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}
