//! Integration tests for telemetry initialization and span helpers.

use queue_tasks::telemetry::consumer::{record_position, start_shard_span, start_worker_span};
use queue_tasks::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process, so a
    // second initialization in here is expected to fail cleanly.
    let _first = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "queue-tasks-test".to_string(),
        log_level: "debug".to_string(),
    });
    let second = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "queue-tasks-test".to_string(),
        log_level: "debug".to_string(),
    });
    assert!(second.is_err());
}

#[test]
fn default_guard_flushes_and_drops_without_providers() {
    let guard = TelemetryGuard::default();
    guard.force_flush();
}

#[test]
fn worker_span_creates() {
    let span = start_worker_span("tasks", 3);
    let _entered = span.enter();
}

#[test]
fn shard_span_records_position() {
    let span = start_shard_span("changes", "shardId-000000000000");
    record_position(&span, 42);
}

#[test]
fn metric_instruments_build_against_the_global_meter() {
    metrics::queue_operations().add(1, &[]);
    metrics::messages_handled().add(1, &[]);
    metrics::records_handled().add(1, &[]);
    metrics::stream_errors().add(1, &[]);
    metrics::tracked_entities().add(-1, &[]);
    metrics::handler_duration_ms().record(1.5, &[]);
}
