//! Sharded log types: shards, cursors, and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one shard within a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    /// Shard id in the conventional `shardId-000000000000` form.
    pub fn from_index(index: usize) -> Self {
        Self(format!("shardId-{index:012}"))
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a record within its shard. Strictly increasing per shard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record read from one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data: Vec<u8>,
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub approximate_arrival: DateTime<Utc>,
}

/// Opaque read position within a shard.
///
/// Callers treat the contents as opaque. The backends in this crate encode
/// `stream|shard|position`, where the meaning of `position` is up to the
/// backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

/// Decoded form of a [`Cursor`] produced by this crate's backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CursorPosition {
    pub stream: String,
    pub shard: ShardId,
    pub position: u64,
}

impl CursorPosition {
    pub fn encode(&self) -> Cursor {
        Cursor(format!("{}|{}|{}", self.stream, self.shard, self.position))
    }

    /// Split from the right so stream names may contain the separator.
    pub fn decode(cursor: &Cursor) -> Option<Self> {
        let mut parts = cursor.0.rsplitn(3, '|');
        let position = parts.next()?.parse().ok()?;
        let shard = ShardId(parts.next()?.to_string());
        let stream = parts.next()?.to_string();
        Some(Self {
            stream,
            shard,
            position,
        })
    }
}

/// One page of shard discovery.
#[derive(Debug, Clone, Default)]
pub struct ShardPage {
    pub shards: Vec<ShardId>,
    pub has_more: bool,
}

/// Result of one fetch against a shard.
///
/// `next_cursor == None` means the shard is closed and fully consumed.
#[derive(Debug, Clone)]
pub struct FetchOutput {
    pub records: Vec<Record>,
    pub next_cursor: Option<Cursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_decodes_stream_names_containing_separator() {
        let pos = CursorPosition {
            stream: "team|entity-changes".to_string(),
            shard: ShardId::from_index(3),
            position: 42,
        };
        let decoded = CursorPosition::decode(&pos.encode()).unwrap();
        assert_eq!(decoded, pos);
    }

    #[test]
    fn cursor_with_bad_position_is_rejected() {
        assert!(CursorPosition::decode(&Cursor("s|shardId-000000000000|x".into())).is_none());
        assert!(CursorPosition::decode(&Cursor("garbage".into())).is_none());
    }
}
