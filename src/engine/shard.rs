//! Per-shard stream consumer.
//!
//! Discovers every shard of a stream and tails each one from its trim
//! horizon in its own task. Records reach the handler in shard order; a
//! handler error drops that record and the loop carries on. A shard whose
//! fetch returns no next cursor is closed and its task ends.

use super::backoff::Backoff;
use super::sleep_or_cancel;
use crate::backend::StreamBackend;
use crate::error::Result;
use crate::handler::RecordHandler;
use crate::model::{Cursor, ShardId};
use crate::telemetry::consumer::{record_position, start_shard_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, warn};

pub const DEFAULT_FETCH_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct ShardConsumerConfig {
    pub stream_name: String,
    /// Records requested per fetch.
    pub fetch_limit: usize,
    /// Pause between successful fetches, to stay under backend rate limits.
    pub poll_interval: Duration,
    /// First delay after a failed fetch.
    pub retry_initial: Duration,
    /// Longest delay between retries of a failing fetch.
    pub retry_max: Duration,
}

impl ShardConsumerConfig {
    pub fn new(stream_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            poll_interval: Duration::from_secs(1),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }

    pub fn fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn retry(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max;
        self
    }
}

struct ShardContext {
    stream: Arc<dyn StreamBackend>,
    handler: Arc<dyn RecordHandler>,
    config: ShardConsumerConfig,
    token: CancellationToken,
}

pub struct ShardConsumer {
    stream: Arc<dyn StreamBackend>,
    config: ShardConsumerConfig,
    token: CancellationToken,
    tasks: TaskTracker,
    /// Held by `start` from discovery until its tasks are spawned.
    spawning: Mutex<()>,
}

impl ShardConsumer {
    pub fn new(
        stream: Arc<dyn StreamBackend>,
        config: ShardConsumerConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            stream,
            config,
            token,
            tasks: TaskTracker::new(),
            spawning: Mutex::new(()),
        }
    }

    /// Shard tasks still running.
    pub fn active_shards(&self) -> usize {
        self.tasks.len()
    }

    /// List every shard of the stream, following pagination to the end.
    pub async fn discover_shards(&self) -> Result<Vec<ShardId>> {
        let stream_name = &self.config.stream_name;
        let mut shards: Vec<ShardId> = Vec::new();
        let mut exclusive_start: Option<ShardId> = None;
        loop {
            let page = self
                .stream
                .list_shards(stream_name, exclusive_start.as_ref())
                .await
                .inspect_err(|_| {
                    metrics::stream_errors().add(
                        1,
                        &[
                            KeyValue::new("stream", stream_name.clone()),
                            KeyValue::new("operation", "list_shards"),
                        ],
                    );
                })?;
            let last = page.shards.last().cloned();
            shards.extend(page.shards);
            match last {
                Some(last) if page.has_more => exclusive_start = Some(last),
                _ => break,
            }
        }
        Ok(shards)
    }

    /// Consume every shard until each is closed or the token is cancelled.
    ///
    /// Returns the number of shards consumed.
    ///
    /// # Errors
    ///
    /// Fails if shard discovery fails; no shard task is started then.
    pub async fn start(&self, handler: Arc<dyn RecordHandler>) -> Result<usize> {
        let spawning = self.spawning.lock().await;
        let shards = self.discover_shards().await?;
        info!(
            stream = %self.config.stream_name,
            shards = shards.len(),
            "found shards"
        );

        let ctx = Arc::new(ShardContext {
            stream: Arc::clone(&self.stream),
            handler,
            config: self.config.clone(),
            token: self.token.clone(),
        });

        if !self.token.is_cancelled() {
            for shard in &shards {
                let span = start_shard_span(&self.config.stream_name, &shard.0);
                let task = consume_shard(Arc::clone(&ctx), shard.clone(), span.clone());
                self.tasks.spawn(task.instrument(span));
            }
        }
        drop(spawning);

        self.tasks.close();
        self.tasks.wait().await;
        info!(stream = %self.config.stream_name, "shard consumer stopped");
        Ok(shards.len())
    }

    /// Cancel every shard task and wait for them to exit.
    ///
    /// A `start` still discovering shards is waited for too; it then spawns
    /// nothing.
    pub async fn stop(&self) {
        self.token.cancel();
        drop(self.spawning.lock().await);
        self.tasks.close();
        self.tasks.wait().await;
        info!(stream = %self.config.stream_name, "consumer stopped");
    }
}

async fn consume_shard(ctx: Arc<ShardContext>, shard: ShardId, span: Span) {
    let stream_name = ctx.config.stream_name.as_str();
    let stream_label = KeyValue::new("stream", stream_name.to_string());
    info!("starting shard");

    let mut cursor: Cursor = match ctx.stream.trim_horizon_cursor(stream_name, &shard).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!(error = %e, "could not get a trim horizon cursor, abandoning shard");
            metrics::stream_errors().add(
                1,
                &[stream_label, KeyValue::new("operation", "cursor")],
            );
            return;
        }
    };
    let mut backoff = Backoff::new(ctx.config.retry_initial, ctx.config.retry_max);

    loop {
        if ctx.token.is_cancelled() {
            info!("stopping shard");
            return;
        }

        let output = match ctx.stream.fetch(&cursor, ctx.config.fetch_limit).await {
            Ok(output) => {
                backoff.reset();
                output
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "fetch failed");
                metrics::stream_errors().add(
                    1,
                    &[stream_label.clone(), KeyValue::new("operation", "fetch")],
                );
                if !sleep_or_cancel(&ctx.token, delay).await {
                    info!("stopping shard");
                    return;
                }
                continue;
            }
        };

        for record in &output.records {
            debug!(
                sequence = record.sequence_number.0,
                partition_key = %record.partition_key,
                bytes = record.data.len(),
                "record received"
            );
            let started = Instant::now();
            let outcome = ctx.handler.handle(&shard, record).await;
            metrics::handler_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("consumer", "stream")],
            );
            let result = match outcome {
                Ok(()) => "ok",
                Err(e) => {
                    warn!(
                        sequence = record.sequence_number.0,
                        error = %e,
                        "record handler failed, dropping record"
                    );
                    "error"
                }
            };
            metrics::records_handled().add(
                1,
                &[stream_label.clone(), KeyValue::new("result", result)],
            );
            record_position(&span, record.sequence_number.0);
        }

        match output.next_cursor {
            Some(next) => cursor = next,
            None => {
                info!("shard has been closed");
                return;
            }
        }

        if !sleep_or_cancel(&ctx.token, ctx.config.poll_interval).await {
            info!("stopping shard");
            return;
        }
    }
}
