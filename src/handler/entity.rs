//! Default queue handler: one processed message decrements its entity's
//! outstanding count by one.

use super::MessageHandler;
use crate::backend::TableBackend;
use crate::error::Result;
use crate::model::Message;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub const ENTITY_ID_ATTRIBUTE: &str = "entity_id";
pub const MESSAGE_ID_ATTRIBUTE: &str = "message_id";

/// Completed entities remembered by default.
pub const DEFAULT_COMPLETED_CAPACITY: usize = 4096;

/// Decrements the entity counter once per `(entity_id, message_id)`.
///
/// Deliveries already applied in this process are acknowledged without
/// touching the table again, so a message redelivered after a failed delete
/// is not counted twice. A delivery claims its key before the table write, so
/// overlapping copies of one message decrement once.
///
/// Once an entity's counter reaches zero its message keys are dropped and
/// only the entity id is kept, in a set capped at the completed capacity.
pub struct EntityMessageHandler {
    table: Arc<dyn TableBackend>,
    deliveries: Mutex<Deliveries>,
}

#[derive(Default)]
struct Deliveries {
    /// Applied or in-flight message ids of entities still counting down.
    pending: HashMap<String, HashSet<String>>,
    completed: HashSet<String>,
    /// Completion order, oldest first.
    completed_order: VecDeque<String>,
    completed_capacity: usize,
}

impl Deliveries {
    /// Returns false if the delivery was already claimed or its entity is done.
    fn claim(&mut self, entity_id: &str, message_id: &str) -> bool {
        if self.completed.contains(entity_id) {
            return false;
        }
        self.pending
            .entry(entity_id.to_string())
            .or_default()
            .insert(message_id.to_string())
    }

    fn release(&mut self, entity_id: &str, message_id: &str) {
        if let Some(ids) = self.pending.get_mut(entity_id) {
            ids.remove(message_id);
            if ids.is_empty() {
                self.pending.remove(entity_id);
            }
        }
    }

    fn complete(&mut self, entity_id: &str) {
        self.pending.remove(entity_id);
        if self.completed_capacity == 0 || !self.completed.insert(entity_id.to_string()) {
            return;
        }
        self.completed_order.push_back(entity_id.to_string());
        while self.completed_order.len() > self.completed_capacity {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

impl EntityMessageHandler {
    pub fn new(table: Arc<dyn TableBackend>) -> Self {
        Self {
            table,
            deliveries: Mutex::new(Deliveries {
                completed_capacity: DEFAULT_COMPLETED_CAPACITY,
                ..Deliveries::default()
            }),
        }
    }

    /// Cap the number of completed entities remembered.
    pub fn with_completed_capacity(self, capacity: usize) -> Self {
        self.deliveries().completed_capacity = capacity;
        self
    }

    /// Message keys held for entities that have not completed.
    pub fn pending_deliveries(&self) -> usize {
        self.deliveries().pending.values().map(HashSet::len).sum()
    }

    /// Completed entities whose late redeliveries are still ignored.
    pub fn completed_entities(&self) -> usize {
        self.deliveries().completed.len()
    }

    fn deliveries(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageHandler for EntityMessageHandler {
    async fn handle(&self, message: &Message) -> Result<()> {
        // A message without its attributes can never succeed; accept it so
        // it is deleted instead of cycling forever.
        let Some(entity_id) = message.attribute(ENTITY_ID_ATTRIBUTE) else {
            warn!(message_id = %message.message_id, "message has no entity_id attribute");
            return Ok(());
        };
        let Some(message_id) = message.attribute(MESSAGE_ID_ATTRIBUTE) else {
            warn!(
                message_id = %message.message_id,
                entity_id,
                "message has no message_id attribute"
            );
            return Ok(());
        };

        let claimed = self.deliveries().claim(entity_id, message_id);
        if !claimed {
            debug!(entity_id, message_id, "duplicate delivery, already counted");
            return Ok(());
        }

        let remaining = match self.table.update_counter(entity_id, -1).await {
            Ok(remaining) => remaining,
            Err(e) => {
                // Unclaim so the redelivery is applied.
                self.deliveries().release(entity_id, message_id);
                return Err(e);
            }
        };
        if remaining <= 0 {
            self.deliveries().complete(entity_id);
        }
        debug!(entity_id, message_id, remaining, body = %message.body, "message processed");
        Ok(())
    }
}
