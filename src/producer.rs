//! Entity producer: seeds the counter table and the queue.
//!
//! Every entity is tracked before anything is published, so a consumer that
//! is already running can neither miss a completion nor see the tracker
//! drain halfway through production. Then, entity by entity, the producer
//! writes the counter row and publishes the messages in batches.

use crate::backend::{MAX_SEND_BATCH, QueueBackend, TableBackend};
use crate::error::Result;
use crate::handler::entity::{ENTITY_ID_ATTRIBUTE, MESSAGE_ID_ATTRIBUTE};
use crate::model::{Entity, SendEntry};
use crate::telemetry::metrics;
use crate::tracker::EntityTracker;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{info, warn};

/// Totals for one `produce` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProduceSummary {
    pub entities: usize,
    pub messages_sent: usize,
    pub messages_failed: usize,
}

pub struct EntityProducer {
    queue: Arc<dyn QueueBackend>,
    table: Arc<dyn TableBackend>,
    tracker: Arc<EntityTracker>,
}

impl EntityProducer {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        table: Arc<dyn TableBackend>,
        tracker: Arc<EntityTracker>,
    ) -> Self {
        Self {
            queue,
            table,
            tracker,
        }
    }

    /// Generate `count` random entities with up to `max_messages` each.
    pub fn generate(count: usize, max_messages: usize) -> Vec<Entity> {
        (0..count).map(|_| Entity::generate(max_messages)).collect()
    }

    /// Publish every entity in order.
    ///
    /// # Errors
    ///
    /// Stops at the first table write or batch send that fails outright.
    /// Entries a batch send rejects individually are logged and counted.
    pub async fn produce(&self, entities: &[Entity]) -> Result<ProduceSummary> {
        for entity in entities {
            self.tracker.add(entity.id());
        }

        let mut summary = ProduceSummary::default();
        for entity in entities {
            info!(
                entity_id = entity.id(),
                messages = entity.message_count(),
                "producing entity"
            );
            self.table.put(&entity.to_item()).await?;

            let failed = self.send_messages(entity).await?;
            summary.entities += 1;
            summary.messages_sent += entity.message_count() - failed;
            summary.messages_failed += failed;
        }
        info!(
            entities = summary.entities,
            sent = summary.messages_sent,
            failed = summary.messages_failed,
            "production complete"
        );
        Ok(summary)
    }

    /// Send an entity's messages. Returns how many entries were rejected.
    async fn send_messages(&self, entity: &Entity) -> Result<usize> {
        let mut failed = 0;
        for (chunk_index, chunk) in entity.messages().chunks(MAX_SEND_BATCH).enumerate() {
            let offset = chunk_index * MAX_SEND_BATCH;
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, body)| {
                    let index = offset + i;
                    SendEntry::new(format!("msg{index}"), body.as_str())
                        .attribute(ENTITY_ID_ATTRIBUTE, entity.id())
                        .attribute(MESSAGE_ID_ATTRIBUTE, (index + 1).to_string())
                })
                .collect();

            let failures = self.queue.send_batch(entries).await.inspect_err(|_| {
                metrics::queue_operations().add(
                    1,
                    &[
                        KeyValue::new("operation", "send"),
                        KeyValue::new("result", "error"),
                    ],
                );
            })?;
            for failure in &failures {
                warn!(
                    entity_id = entity.id(),
                    entry = %failure.id,
                    code = %failure.code,
                    reason = %failure.message,
                    "message rejected by queue"
                );
            }
            metrics::queue_operations().add(
                1,
                &[
                    KeyValue::new("operation", "send"),
                    KeyValue::new("result", "ok"),
                ],
            );
            failed += failures.len();
        }
        Ok(failed)
    }
}
