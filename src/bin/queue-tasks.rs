//! queue-tasks CLI: run the queue and stream consumers, or seed them.

use clap::{Parser, Subcommand, ValueEnum};
use queue_tasks::backend::Backends;
use queue_tasks::config::{BackendKind, Config};
use queue_tasks::db::Db;
use queue_tasks::engine::{Lifecycle, ShardConsumer, ShardConsumerConfig, WorkerPool};
use queue_tasks::handler::{CompletionHandler, EntityMessageHandler, ParseFailurePolicy};
use queue_tasks::model::Entity;
use queue_tasks::producer::EntityProducer;
use queue_tasks::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use queue_tasks::tracker::EntityTracker;
use secrecy::ExposeSecret;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "queue-tasks", about = "Queue and change-stream migration consumers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue worker pool
    Consume,
    /// Tail the change stream and log entity completions
    ///
    /// Nothing is tracked in this process, so it runs until a signal. Use
    /// `run` to stop once every produced entity has completed.
    Stream {
        /// What to do with change records that cannot be parsed
        #[arg(long, value_enum, default_value_t = OnParseError::Skip)]
        on_parse_error: OnParseError,
    },
    /// Seed the table and queue with generated entities
    Produce {
        /// Number of entities to generate
        #[arg(long, default_value_t = 5)]
        entities: usize,
        /// Upper bound (exclusive) on messages per entity
        #[arg(long, default_value_t = 100)]
        max_messages: usize,
    },
    /// Produce, then run both consumers until every entity completes
    Run {
        /// Number of entities to generate
        #[arg(long, default_value_t = 5)]
        entities: usize,
        /// Upper bound (exclusive) on messages per entity
        #[arg(long, default_value_t = 100)]
        max_messages: usize,
    },
    /// Print one generated entity
    Entity {
        /// Upper bound (exclusive) on messages for the entity
        #[arg(long, default_value_t = 100)]
        max_messages: usize,
    },
    /// Create the Postgres schema, pgmq queue, and change-log shards
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnParseError {
    Skip,
    Reject,
}

impl From<OnParseError> for ParseFailurePolicy {
    fn from(value: OnParseError) -> Self {
        match value {
            OnParseError::Skip => ParseFailurePolicy::Skip,
            OnParseError::Reject => ParseFailurePolicy::Reject,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Consume => cmd_consume().await,
        Command::Stream { on_parse_error } => cmd_stream(on_parse_error.into()).await,
        Command::Produce {
            entities,
            max_messages,
        } => cmd_produce(entities, max_messages).await,
        Command::Run {
            entities,
            max_messages,
        } => cmd_run(entities, max_messages).await,
        Command::Entity { max_messages } => cmd_entity(max_messages),
        Command::Migrate => cmd_migrate().await,
    }
}

/// Load config and install telemetry. Keep the guard alive until exit.
fn setup() -> anyhow::Result<(Config, TelemetryGuard)> {
    let config = Config::from_env()?;
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "queue-tasks".to_string(),
        log_level: config.log_level.clone(),
    })?;
    Ok((config, guard))
}

fn cmd_entity(max_messages: usize) -> anyhow::Result<()> {
    let entity = Entity::generate(max_messages);
    println!("ID:        {}", entity.id());
    println!("Messages:  {}", entity.message_count());
    println!("Item:      {}", serde_json::to_string(&entity.to_item())?);
    Ok(())
}

async fn cmd_consume() -> anyhow::Result<()> {
    let (config, _guard) = setup()?;
    let backends = Backends::connect(&config).await?;
    let mut lifecycle = Lifecycle::new();
    spawn_pool(&mut lifecycle, &config, &backends);
    finish(lifecycle).await
}

async fn cmd_stream(policy: ParseFailurePolicy) -> anyhow::Result<()> {
    let (config, _guard) = setup()?;
    let backends = Backends::connect(&config).await?;
    let mut lifecycle = Lifecycle::new();
    // Produced elsewhere, so there is nothing to drain.
    let tracker = Arc::new(EntityTracker::new());
    spawn_shards(&mut lifecycle, &config, &backends, tracker, policy);
    finish(lifecycle).await
}

async fn cmd_produce(entities: usize, max_messages: usize) -> anyhow::Result<()> {
    let (config, _guard) = setup()?;
    let backends = Backends::connect(&config).await?;
    let producer = EntityProducer::new(
        backends.queue,
        backends.table,
        Arc::new(EntityTracker::new()),
    );
    let summary = producer
        .produce(&EntityProducer::generate(entities, max_messages))
        .await?;
    println!(
        "Produced {} entities: {} messages sent, {} rejected",
        summary.entities, summary.messages_sent, summary.messages_failed
    );
    Ok(())
}

async fn cmd_run(entities: usize, max_messages: usize) -> anyhow::Result<()> {
    if entities == 0 {
        anyhow::bail!("--entities must be at least 1 for a run to complete");
    }
    let (config, _guard) = setup()?;
    let backends = Backends::connect(&config).await?;
    let mut lifecycle = Lifecycle::new();
    let tracker = Arc::new(EntityTracker::with_shutdown(lifecycle.handle()));

    let producer = EntityProducer::new(
        Arc::clone(&backends.queue),
        Arc::clone(&backends.table),
        Arc::clone(&tracker),
    );
    producer
        .produce(&EntityProducer::generate(entities, max_messages))
        .await?;

    spawn_pool(&mut lifecycle, &config, &backends);
    spawn_shards(
        &mut lifecycle,
        &config,
        &backends,
        tracker,
        ParseFailurePolicy::default(),
    );
    finish(lifecycle).await
}

async fn cmd_migrate() -> anyhow::Result<()> {
    let (config, _guard) = setup()?;
    if config.backend_kind() == BackendKind::Memory {
        println!("Memory backend selected; nothing to migrate.");
        return Ok(());
    }
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.create_queue(&config.queue_name).await?;
    db.ensure_shards(&config.stream_name, config.shard_count)
        .await?;
    println!(
        "Migrated: queue {}, stream {} ({} shards)",
        config.queue_name, config.stream_name, config.shard_count
    );
    Ok(())
}

fn spawn_pool(lifecycle: &mut Lifecycle, config: &Config, backends: &Backends) {
    let pool = WorkerPool::new(
        Arc::clone(&backends.queue),
        config.pool_config(),
        lifecycle.token(),
    );
    let handler = Arc::new(EntityMessageHandler::new(Arc::clone(&backends.table)));
    lifecycle.spawn("worker-pool", async move { pool.start(handler).await });
}

fn spawn_shards(
    lifecycle: &mut Lifecycle,
    config: &Config,
    backends: &Backends,
    tracker: Arc<EntityTracker>,
    policy: ParseFailurePolicy,
) {
    let consumer = ShardConsumer::new(
        Arc::clone(&backends.stream),
        ShardConsumerConfig::new(&config.stream_name),
        lifecycle.token(),
    );
    let handler = Arc::new(CompletionHandler::new(tracker).with_policy(policy));
    lifecycle.spawn("shard-consumer", async move {
        consumer.start(handler).await.map(|_| ())
    });
}

async fn finish(lifecycle: Lifecycle) -> anyhow::Result<()> {
    let reason = lifecycle.run().await?;
    if !reason.is_graceful() {
        anyhow::bail!("stopped abnormally: {reason:?}");
    }
    Ok(())
}
