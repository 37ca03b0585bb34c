use super::{MemoryStream, lock};
use crate::backend::TableBackend;
use crate::error::{Error, Result};
use crate::model::{ChangeEvent, EntityMessages};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Counter table that can publish a change event for every write.
#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    items: Mutex<HashMap<String, i64>>,
    changes: Option<Arc<MemoryStream>>,
}

impl MemoryTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(HashMap::new()),
            changes: None,
        }
    }

    /// Publish change events to `stream`, partitioned by entity id.
    pub fn with_change_stream(mut self, stream: Arc<MemoryStream>) -> Self {
        self.changes = Some(stream);
        self
    }

    pub fn get(&self, entity_id: &str) -> Option<i64> {
        lock(&self.items).get(entity_id).copied()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, entity_id: &str, old: Option<i64>, new: i64) -> Result<()> {
        let Some(stream) = &self.changes else {
            return Ok(());
        };
        let event = ChangeEvent::counter_change(&self.name, entity_id, old, new, Utc::now());
        stream.append(entity_id, event.to_bytes()?)?;
        Ok(())
    }
}

#[async_trait]
impl TableBackend for MemoryTable {
    async fn put(&self, item: &EntityMessages) -> Result<()> {
        // Publish under the lock so per-entity events keep write order, and
        // before writing so a failed publish leaves the row untouched.
        let mut items = lock(&self.items);
        let old = items.get(&item.entity_id).copied();
        self.publish(&item.entity_id, old, item.message_count)?;
        items.insert(item.entity_id.clone(), item.message_count);
        Ok(())
    }

    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<i64> {
        let mut items = lock(&self.items);
        let count = items.get_mut(entity_id).ok_or_else(|| {
            Error::NotFound(format!("entity {entity_id} in table {}", self.name))
        })?;
        let old = *count;
        let new = old + delta;
        self.publish(entity_id, Some(old), new)?;
        *count = new;
        Ok(new)
    }
}
