//! Queue worker pool.
//!
//! `worker_count` independent workers long-poll the same queue. Each worker
//! handles the messages of one poll sequentially and deletes every message
//! its handler accepted. Rejected messages are left alone and reappear once
//! their visibility timeout expires.

use super::backoff::Backoff;
use super::sleep_or_cancel;
use crate::backend::{MAX_SEND_BATCH, QueueBackend};
use crate::error::{Error, Result};
use crate::handler::MessageHandler;
use crate::model::Message;
use crate::telemetry::consumer::start_worker_span;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Largest batch a single poll may request.
pub const MAX_BATCH_SIZE: usize = MAX_SEND_BATCH;
/// Longest long-poll wait a single poll may request.
pub const MAX_WAIT_TIME_SECONDS: u64 = 20;

/// Immutable per-run worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Queue the workers drain. Used for logs and metrics labels.
    pub queue_name: String,
    pub worker_count: usize,
    pub batch_size: usize,
    pub wait_time: Duration,
}

impl WorkerPoolConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker pool needs at least one worker".to_string()));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.wait_time > Duration::from_secs(MAX_WAIT_TIME_SECONDS) {
            return Err(Error::Config(format!(
                "long-poll wait must be at most {MAX_WAIT_TIME_SECONDS}s"
            )));
        }
        Ok(())
    }
}

/// Everything one worker needs, shared by all workers of a pool.
struct WorkerContext {
    queue: Arc<dyn QueueBackend>,
    handler: Arc<dyn MessageHandler>,
    config: WorkerPoolConfig,
    token: CancellationToken,
    poll_backoff: (Duration, Duration),
}

/// Decrements the active-worker count however the worker exits.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    queue: Arc<dyn QueueBackend>,
    config: WorkerPoolConfig,
    token: CancellationToken,
    active_workers: Arc<AtomicUsize>,
    poll_backoff: (Duration, Duration),
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        config: WorkerPoolConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            config,
            token,
            active_workers: Arc::new(AtomicUsize::new(0)),
            poll_backoff: (Duration::from_millis(100), Duration::from_secs(5)),
        }
    }

    /// Backoff bounds applied after consecutive poll failures.
    pub fn with_poll_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_backoff = (initial, max);
        self
    }

    /// Workers currently inside their polling loop.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawn the workers and wait until all of them have exited.
    ///
    /// Workers only exit once the pool's token is cancelled.
    ///
    /// # Errors
    ///
    /// Fails before spawning anything if the configuration is invalid.
    pub async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.config.validate()?;

        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&self.queue),
            handler,
            config: self.config.clone(),
            token: self.token.clone(),
            poll_backoff: self.poll_backoff,
        });

        info!(
            queue = %self.config.queue_name,
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            wait_secs = self.config.wait_time.as_secs(),
            "starting worker pool"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.worker_count {
            let guard = ActiveGuard::enter(&self.active_workers);
            let span = start_worker_span(&self.config.queue_name, worker_id);
            workers.spawn(run_worker(Arc::clone(&ctx), guard).instrument(span));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "queue worker panicked");
            }
        }
        info!(queue = %self.config.queue_name, "worker pool stopped");
        Ok(())
    }
}

async fn run_worker(ctx: Arc<WorkerContext>, _active: ActiveGuard) {
    info!("worker started");
    let (initial, max) = ctx.poll_backoff;
    let mut backoff = Backoff::new(initial, max);
    let queue_label = KeyValue::new("queue", ctx.config.queue_name.clone());

    loop {
        if ctx.token.is_cancelled() {
            break;
        }

        let messages = match ctx
            .queue
            .poll(ctx.config.batch_size, ctx.config.wait_time)
            .await
        {
            Ok(messages) => {
                backoff.reset();
                messages
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "poll failed");
                metrics::queue_operations().add(
                    1,
                    &[
                        queue_label.clone(),
                        KeyValue::new("operation", "poll"),
                        KeyValue::new("result", "error"),
                    ],
                );
                if !sleep_or_cancel(&ctx.token, delay).await {
                    break;
                }
                continue;
            }
        };

        metrics::queue_operations().add(
            1,
            &[
                queue_label.clone(),
                KeyValue::new(
                    "operation",
                    if messages.is_empty() { "poll_empty" } else { "poll" },
                ),
                KeyValue::new("result", "ok"),
            ],
        );

        for message in &messages {
            process_message(&ctx, &queue_label, message).await;
        }
    }

    info!("worker shutting down");
}

async fn process_message(ctx: &WorkerContext, queue_label: &KeyValue, message: &Message) {
    let started = Instant::now();
    let outcome = ctx.handler.handle(message).await;
    metrics::handler_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("consumer", "queue")],
    );

    if let Err(e) = outcome {
        warn!(
            message_id = %message.message_id,
            receive_count = message.receive_count,
            error = %e,
            "handler failed, leaving message for redelivery"
        );
        metrics::messages_handled().add(
            1,
            &[queue_label.clone(), KeyValue::new("result", "error")],
        );
        return;
    }
    metrics::messages_handled().add(1, &[queue_label.clone(), KeyValue::new("result", "ok")]);

    let deleted = ctx.queue.delete(&message.receipt).await;
    let result = if deleted.is_ok() { "ok" } else { "error" };
    metrics::queue_operations().add(
        1,
        &[
            queue_label.clone(),
            KeyValue::new("operation", "delete"),
            KeyValue::new("result", result),
        ],
    );
    match deleted {
        Ok(()) => debug!(message_id = %message.message_id, "message deleted"),
        Err(e) => warn!(
            message_id = %message.message_id,
            error = %e,
            "delete failed, message may be redelivered"
        ),
    }
}
