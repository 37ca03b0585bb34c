use super::lock;
use crate::backend::StreamBackend;
use crate::error::{Error, Result};
use crate::model::record::CursorPosition;
use crate::model::{Cursor, FetchOutput, Record, SequenceNumber, ShardId, ShardPage};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug)]
struct ShardState {
    id: ShardId,
    records: Vec<Record>,
    closed: bool,
}

#[derive(Debug)]
struct StreamState {
    shards: Vec<ShardState>,
    next_sequence: u64,
}

impl StreamState {
    fn shard(&self, id: &ShardId) -> Result<&ShardState> {
        self.shards
            .iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| Error::NotFound(format!("shard {id}")))
    }

    fn shard_mut(&mut self, id: &ShardId) -> Result<&mut ShardState> {
        self.shards
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| Error::NotFound(format!("shard {id}")))
    }
}

/// A named stream split into a fixed set of shards.
///
/// Cursor positions are offsets into a shard's record list; the trim
/// horizon is offset 0 since nothing is ever trimmed.
#[derive(Debug)]
pub struct MemoryStream {
    name: String,
    page_size: usize,
    state: Mutex<StreamState>,
}

impl MemoryStream {
    pub fn new(name: &str, shard_count: usize) -> Self {
        let shards = (0..shard_count)
            .map(|index| ShardState {
                id: ShardId::from_index(index),
                records: Vec::new(),
                closed: false,
            })
            .collect();
        Self {
            name: name.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(StreamState {
                shards,
                next_sequence: 1,
            }),
        }
    }

    /// Limit how many shards one `list_shards` page returns.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        lock(&self.state).shards.iter().map(|s| s.id.clone()).collect()
    }

    /// Append to the open shard the partition key hashes to.
    pub fn append(
        &self,
        partition_key: &str,
        data: Vec<u8>,
    ) -> Result<(ShardId, SequenceNumber)> {
        let shard = {
            let state = lock(&self.state);
            let open: Vec<&ShardState> = state.shards.iter().filter(|s| !s.closed).collect();
            if open.is_empty() {
                return Err(Error::Backend(format!(
                    "stream {} has no open shards",
                    self.name
                )));
            }
            let mut hasher = DefaultHasher::new();
            partition_key.hash(&mut hasher);
            open[(hasher.finish() % open.len() as u64) as usize].id.clone()
        };
        let sequence = self.append_to(&shard, partition_key, data)?;
        Ok((shard, sequence))
    }

    /// Append to a specific shard.
    pub fn append_to(
        &self,
        shard: &ShardId,
        partition_key: &str,
        data: Vec<u8>,
    ) -> Result<SequenceNumber> {
        let mut state = lock(&self.state);
        let sequence = SequenceNumber(state.next_sequence);
        let target = state.shard_mut(shard)?;
        if target.closed {
            return Err(Error::Backend(format!("shard {shard} is closed")));
        }
        target.records.push(Record {
            data,
            sequence_number: sequence,
            partition_key: partition_key.to_string(),
            approximate_arrival: Utc::now(),
        });
        state.next_sequence += 1;
        Ok(sequence)
    }

    /// Close a shard. Readers get no next cursor once they reach its end.
    pub fn close_shard(&self, shard: &ShardId) -> Result<()> {
        lock(&self.state).shard_mut(shard)?.closed = true;
        Ok(())
    }

    fn check_stream(&self, stream: &str) -> Result<()> {
        if stream == self.name {
            Ok(())
        } else {
            Err(Error::NotFound(format!("stream {stream}")))
        }
    }
}

#[async_trait]
impl StreamBackend for MemoryStream {
    async fn list_shards(
        &self,
        stream: &str,
        exclusive_start: Option<&ShardId>,
    ) -> Result<ShardPage> {
        self.check_stream(stream)?;
        let state = lock(&self.state);
        let mut remaining = state
            .shards
            .iter()
            .filter(|s| exclusive_start.is_none_or(|start| &s.id > start))
            .map(|s| s.id.clone());
        let shards: Vec<ShardId> = remaining.by_ref().take(self.page_size).collect();
        let has_more = remaining.next().is_some();
        Ok(ShardPage { shards, has_more })
    }

    async fn trim_horizon_cursor(&self, stream: &str, shard: &ShardId) -> Result<Cursor> {
        self.check_stream(stream)?;
        lock(&self.state).shard(shard)?;
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
        self.check_stream(&position.stream)?;

        let state = lock(&self.state);
        let shard = state.shard(&position.shard)?;
        let start = (position.position as usize).min(shard.records.len());
        let end = start.saturating_add(limit).min(shard.records.len());
        let records = shard.records[start..end].to_vec();

        let next_cursor = if shard.closed && end >= shard.records.len() {
            None
        } else {
            Some(
                CursorPosition {
                    position: end as u64,
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
