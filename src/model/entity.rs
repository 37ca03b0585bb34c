//! Entities to migrate and their table representation.

use rand::Rng;
use serde::{Deserialize, Serialize};

const ID_LEN: usize = 30;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// An entity whose messages must all be processed before it counts as migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    id: String,
    messages: Vec<String>,
}

impl Entity {
    /// Generate an entity with a random id and `0..max_messages` messages.
    pub fn generate(max_messages: usize) -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..ID_LEN)
            .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
            .collect();
        let count = if max_messages == 0 {
            0
        } else {
            rng.gen_range(0..max_messages)
        };
        Self::with_message_count(id, count)
    }

    /// Build an entity with a known id and message count.
    pub fn with_message_count(id: impl Into<String>, count: usize) -> Self {
        let id = id.into();
        let messages = (0..count)
            .map(|n| format!("Entity: {id} | Message # {n}"))
            .collect();
        Self { id, messages }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// The table row recording how many messages are outstanding.
    pub fn to_item(&self) -> EntityMessages {
        EntityMessages {
            entity_id: self.id.clone(),
            message_count: self.messages.len() as i64,
        }
    }
}

/// Table item: outstanding message count per entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMessages {
    pub entity_id: String,
    pub message_count: i64,
}
