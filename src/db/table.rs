//! Entity counter table with a transactional change log.
//!
//! Every write appends a change event to `stream_records` in the same
//! transaction, so the log never shows a write that did not commit.

use super::Db;
use crate::backend::TableBackend;
use crate::error::{Error, Result};
use crate::model::{ChangeEvent, EntityMessages, ShardId};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Postgres, Transaction};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub struct PgEntityTable {
    db: Arc<Db>,
    table_name: String,
    stream_name: String,
    shard_count: usize,
}

impl PgEntityTable {
    pub fn new(db: Arc<Db>, table_name: &str, stream_name: &str, shard_count: usize) -> Self {
        Self {
            db,
            table_name: table_name.to_string(),
            stream_name: stream_name.to_string(),
            shard_count: shard_count.max(1),
        }
    }

    /// Current counter value, if the entity exists.
    pub async fn get(&self, entity_id: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT message_count FROM entity_counters WHERE table_name = $1 AND entity_id = $2",
        )
        .bind(&self.table_name)
        .bind(entity_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|(count,)| count))
    }

    fn shard_for(&self, entity_id: &str) -> ShardId {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        ShardId::from_index((hasher.finish() % self.shard_count as u64) as usize)
    }

    async fn append_change(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity_id: &str,
        old: Option<i64>,
        new: i64,
    ) -> Result<()> {
        let shard = self.shard_for(entity_id);

        // Serializes appends per shard until commit.
        let closed: Option<(bool,)> = sqlx::query_as(
            "SELECT closed FROM stream_shards WHERE stream_name = $1 AND shard_id = $2 FOR UPDATE",
        )
        .bind(&self.stream_name)
        .bind(&shard.0)
        .fetch_optional(&mut **tx)
        .await?;
        match closed {
            None => {
                return Err(Error::NotFound(format!(
                    "shard {shard} of stream {}",
                    self.stream_name
                )));
            }
            Some((true,)) => {
                return Err(Error::Backend(format!("shard {shard} is closed")));
            }
            Some((false,)) => {}
        }

        let event = ChangeEvent::counter_change(&self.table_name, entity_id, old, new, Utc::now());
        sqlx::query(
            "INSERT INTO stream_records (stream_name, shard_id, partition_key, data)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&self.stream_name)
        .bind(&shard.0)
        .bind(entity_id)
        .bind(event.to_bytes()?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TableBackend for PgEntityTable {
    async fn put(&self, item: &EntityMessages) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let old: Option<(i64,)> = sqlx::query_as(
            "SELECT message_count FROM entity_counters
             WHERE table_name = $1 AND entity_id = $2 FOR UPDATE",
        )
        .bind(&self.table_name)
        .bind(&item.entity_id)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO entity_counters (table_name, entity_id, message_count)
             VALUES ($1, $2, $3)
             ON CONFLICT (table_name, entity_id)
             DO UPDATE SET message_count = EXCLUDED.message_count, updated_at = now()",
        )
        .bind(&self.table_name)
        .bind(&item.entity_id)
        .bind(item.message_count)
        .execute(&mut *tx)
        .await?;

        self.append_change(
            &mut tx,
            &item.entity_id,
            old.map(|(count,)| count),
            item.message_count,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<i64> {
        let mut tx = self.db.pool().begin().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE entity_counters
             SET message_count = message_count + $3, updated_at = now()
             WHERE table_name = $1 AND entity_id = $2
             RETURNING message_count",
        )
        .bind(&self.table_name)
        .bind(entity_id)
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await?;
        let (new,) = row.ok_or_else(|| {
            Error::NotFound(format!("entity {entity_id} in table {}", self.table_name))
        })?;

        self.append_change(&mut tx, entity_id, Some(new - delta), new)
            .await?;
        tx.commit().await?;
        Ok(new)
    }
}
