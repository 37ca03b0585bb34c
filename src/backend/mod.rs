//! Backend interfaces the consumers and producer depend on.
//!
//! Each trait models one external collaborator: a pull queue with
//! visibility-based deletion, a sharded append-only log, and a key-value
//! table of per-entity counters. Two families implement them: in-process
//! memory backends and Postgres (see [`crate::db`]).

pub mod memory;

use crate::config::{BackendKind, Config};
use crate::db::Db;
use crate::db::pgmq::PgmqQueue;
use crate::db::stream::PgChangeStream;
use crate::db::table::PgEntityTable;
use crate::error::{Error, Result};
use crate::model::{
    Cursor, EntityMessages, FetchOutput, Message, ReceiptToken, SendEntry, SendFailure, ShardId,
    ShardPage,
};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Most entries a single batch send accepts.
pub const MAX_SEND_BATCH: usize = 10;

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// Received messages stay hidden from other pollers until their
    /// visibility timeout expires or they are deleted.
    async fn poll(&self, max_messages: usize, wait: Duration) -> Result<Vec<Message>>;

    /// Delete a received message by its receipt token.
    async fn delete(&self, receipt: &ReceiptToken) -> Result<()>;

    /// Send up to [`MAX_SEND_BATCH`] messages. Returns the entries that failed.
    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<Vec<SendFailure>>;
}

#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// One page of the stream's shards, starting after `exclusive_start`.
    async fn list_shards(
        &self,
        stream: &str,
        exclusive_start: Option<&ShardId>,
    ) -> Result<ShardPage>;

    /// Cursor positioned at the oldest retained record of `shard`.
    async fn trim_horizon_cursor(&self, stream: &str, shard: &ShardId) -> Result<Cursor>;

    /// Read up to `limit` records after `cursor`.
    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<FetchOutput>;
}

#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Create or replace an entity's counter row.
    async fn put(&self, item: &EntityMessages) -> Result<()>;

    /// Atomically add `delta` to an existing counter. Returns the new value.
    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<i64>;
}

/// The three backends a run needs, behind trait objects.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn QueueBackend>,
    pub stream: Arc<dyn StreamBackend>,
    pub table: Arc<dyn TableBackend>,
}

impl Backends {
    /// In-process backends whose table writes feed the change stream.
    pub fn in_memory(config: &Config) -> Self {
        let stream = Arc::new(memory::MemoryStream::new(
            &config.stream_name,
            config.shard_count,
        ));
        let queue = Arc::new(memory::MemoryQueue::new(Duration::from_secs(
            config.visibility_timeout_seconds,
        )));
        let table = Arc::new(
            memory::MemoryTable::new(&config.table_name).with_change_stream(stream.clone()),
        );
        Self {
            queue,
            stream,
            table,
        }
    }

    /// Connect the backends selected by `DATABASE_URL`.
    ///
    /// For Postgres this migrates the schema, creates the pgmq queue, and
    /// registers the change-log shards.
    pub async fn connect(config: &Config) -> Result<Self> {
        match config.backend_kind() {
            BackendKind::Memory => Ok(Self::in_memory(config)),
            BackendKind::Postgres => {
                let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
                db.migrate().await?;
                db.create_queue(&config.queue_name).await?;
                db.ensure_shards(&config.stream_name, config.shard_count)
                    .await?;

                let queue = PgmqQueue::new(
                    db.clone(),
                    &config.queue_name,
                    config.visibility_timeout_seconds,
                );
                let stream = PgChangeStream::new(db.clone());
                let table = PgEntityTable::new(
                    db,
                    &config.table_name,
                    &config.stream_name,
                    config.shard_count,
                );
                Ok(Self {
                    queue: Arc::new(queue),
                    stream: Arc::new(stream),
                    table: Arc::new(table),
                })
            }
        }
    }
}

/// Split a batch into sendable entries and per-entry failures.
///
/// Rejects the whole call when the batch is empty, too large, or reuses an
/// entry id; individual entries with an empty body are reported as failures.
pub(crate) fn validate_batch(
    entries: Vec<SendEntry>,
) -> Result<(Vec<SendEntry>, Vec<SendFailure>)> {
    if entries.is_empty() {
        return Err(Error::Backend(
            "batch send requires at least one entry".to_string(),
        ));
    }
    if entries.len() > MAX_SEND_BATCH {
        return Err(Error::Backend(format!(
            "batch of {} entries exceeds the limit of {MAX_SEND_BATCH}",
            entries.len()
        )));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = entries.iter().find(|e| !seen.insert(e.id.as_str())) {
        return Err(Error::Backend(format!("duplicate batch entry id {}", dup.id)));
    }

    let (valid, invalid): (Vec<_>, Vec<_>) =
        entries.into_iter().partition(|e| !e.body.is_empty());
    let failures = invalid
        .into_iter()
        .map(|e| SendFailure {
            id: e.id,
            code: "InvalidMessageContents".to_string(),
            message: "message body must not be empty".to_string(),
        })
        .collect();
    Ok((valid, failures))
}
