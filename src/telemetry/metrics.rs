//! Metric instrument factories for queue-tasks.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"queue-tasks"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

fn meter() -> Meter {
    opentelemetry::global::meter("queue-tasks")
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("poll" | "poll_empty" | "delete" | "send"),
/// `result` ("ok" | "error").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("queue_tasks.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: messages passed to the message handler.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn messages_handled() -> Counter<u64> {
    meter()
        .u64_counter("queue_tasks.messages.handled")
        .with_description("Number of queue messages handled")
        .build()
}

/// Counter: stream records passed to the record handler.
/// Labels: `stream`, `result` ("ok" | "error").
pub fn records_handled() -> Counter<u64> {
    meter()
        .u64_counter("queue_tasks.records.handled")
        .with_description("Number of stream records handled")
        .build()
}

/// Counter: failed stream fetches and cursor requests.
/// Labels: `stream`, `operation` ("fetch" | "cursor" | "list_shards").
pub fn stream_errors() -> Counter<u64> {
    meter()
        .u64_counter("queue_tasks.stream.errors")
        .with_description("Number of failed stream backend calls")
        .build()
}

/// Up-down counter: entities currently tracked as incomplete.
pub fn tracked_entities() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("queue_tasks.tracker.entities")
        .with_description("Entities whose migration is incomplete")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `consumer` ("queue" | "stream").
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("queue_tasks.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
