//! Span helpers for the consumer loops.

use tracing::Span;

/// Span covering one queue worker's lifetime.
pub fn start_worker_span(queue: &str, worker_id: usize) -> Span {
    tracing::info_span!("queue.worker", "queue.name" = queue, "worker.id" = worker_id)
}

/// Span covering one shard task's lifetime.
///
/// `shard.sequence` is declared empty and updated via [`record_position`].
pub fn start_shard_span(stream: &str, shard_id: &str) -> Span {
    tracing::info_span!(
        "stream.shard",
        "stream.name" = stream,
        "shard.id" = shard_id,
        "shard.sequence" = tracing::field::Empty,
    )
}

/// Record the last sequence number handled on a shard span.
pub fn record_position(span: &Span, sequence: u64) {
    span.record("shard.sequence", sequence);
}
