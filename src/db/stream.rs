//! Table-backed sharded change log.
//!
//! Cursor positions are the last consumed sequence number; the trim
//! horizon is position 0 since sequence numbers start at 1.

use super::Db;
use crate::backend::StreamBackend;
use crate::error::{Error, Result};
use crate::model::record::CursorPosition;
use crate::model::{Cursor, FetchOutput, Record, SequenceNumber, ShardId, ShardPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: i64 = 100;

impl Db {
    /// Register shards `0..shard_count` for a stream (idempotent).
    pub async fn ensure_shards(&self, stream_name: &str, shard_count: usize) -> Result<()> {
        for index in 0..shard_count {
            sqlx::query(
                "INSERT INTO stream_shards (stream_name, shard_id, shard_index)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (stream_name, shard_id) DO NOTHING",
            )
            .bind(stream_name)
            .bind(ShardId::from_index(index).0)
            .bind(index as i32)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    /// Mark a shard closed. Appends to it fail from now on.
    pub async fn close_shard(&self, stream_name: &str, shard: &ShardId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE stream_shards SET closed = true WHERE stream_name = $1 AND shard_id = $2",
        )
        .bind(stream_name)
        .bind(&shard.0)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("shard {shard} of stream {stream_name}")));
        }
        Ok(())
    }
}

pub struct PgChangeStream {
    db: Arc<Db>,
    page_size: i64,
}

impl PgChangeStream {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    async fn shard_closed(&self, stream: &str, shard: &ShardId) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT closed FROM stream_shards WHERE stream_name = $1 AND shard_id = $2",
        )
        .bind(stream)
        .bind(&shard.0)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|(closed,)| closed)
            .ok_or_else(|| Error::NotFound(format!("shard {shard} of stream {stream}")))
    }
}

#[async_trait]
impl StreamBackend for PgChangeStream {
    async fn list_shards(
        &self,
        stream: &str,
        exclusive_start: Option<&ShardId>,
    ) -> Result<ShardPage> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT shard_id FROM stream_shards
             WHERE stream_name = $1 AND ($2::text IS NULL OR shard_id > $2)
             ORDER BY shard_id
             LIMIT $3",
        )
        .bind(stream)
        .bind(exclusive_start.map(|s| s.0.as_str()))
        .bind(self.page_size + 1)
        .fetch_all(self.db.pool())
        .await?;

        if rows.is_empty() && exclusive_start.is_none() {
            return Err(Error::NotFound(format!("stream {stream}")));
        }

        let has_more = rows.len() as i64 > self.page_size;
        let shards = rows
            .into_iter()
            .take(self.page_size as usize)
            .map(|(id,)| ShardId(id))
            .collect();
        Ok(ShardPage { shards, has_more })
    }

    async fn trim_horizon_cursor(&self, stream: &str, shard: &ShardId) -> Result<Cursor> {
        self.shard_closed(stream, shard).await?;
        Ok(CursorPosition {
            stream: stream.to_string(),
            shard: shard.clone(),
            position: 0,
        }
        .encode())
    }

    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<FetchOutput> {
        if limit == 0 {
            return Err(Error::Backend("fetch limit must be positive".to_string()));
        }
        let position = CursorPosition::decode(cursor)
            .ok_or_else(|| Error::Backend(format!("malformed cursor {:?}", cursor.0)))?;

        // Closure is checked first: nothing is appended to a closed shard,
        // so the read below sees everything it will ever hold.
        let closed = self.shard_closed(&position.stream, &position.shard).await?;

        let rows: Vec<(i64, String, Vec<u8>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT sequence_number, partition_key, data, arrived_at FROM stream_records
             WHERE stream_name = $1 AND shard_id = $2 AND sequence_number > $3
             ORDER BY sequence_number
             LIMIT $4",
        )
        .bind(&position.stream)
        .bind(&position.shard.0)
        .bind(position.position as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await?;

        let drained = rows.len() < limit;
        let records: Vec<Record> = rows
            .into_iter()
            .map(|(sequence, partition_key, data, arrived_at)| Record {
                data,
                sequence_number: SequenceNumber(sequence as u64),
                partition_key,
                approximate_arrival: arrived_at,
            })
            .collect();

        let next_cursor = if closed && drained {
            None
        } else {
            let last = records
                .last()
                .map_or(position.position, |r| r.sequence_number.0);
            Some(
                CursorPosition {
                    position: last,
                    ..position
                }
                .encode(),
            )
        };
        Ok(FetchOutput {
            records,
            next_cursor,
        })
    }
}
