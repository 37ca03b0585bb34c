//! Producer batching, attributes, and tracking.

use async_trait::async_trait;
use queue_tasks::backend::QueueBackend;
use queue_tasks::backend::memory::MemoryTable;
use queue_tasks::error::{Error, Result};
use queue_tasks::model::{Entity, Message, ReceiptToken, SendEntry, SendFailure};
use queue_tasks::producer::{EntityProducer, ProduceSummary};
use queue_tasks::tracker::EntityTracker;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Queue that records every batch and can reject entries or whole calls.
#[derive(Default)]
struct BatchRecorder {
    batches: Mutex<Vec<Vec<SendEntry>>>,
    reject_ids: Vec<&'static str>,
    fail_calls: bool,
}

impl BatchRecorder {
    fn batches(&self) -> Vec<Vec<SendEntry>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueBackend for BatchRecorder {
    async fn poll(&self, _max_messages: usize, _wait: Duration) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn delete(&self, receipt: &ReceiptToken) -> Result<()> {
        Err(Error::NotFound(format!("receipt {receipt}")))
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<Vec<SendFailure>> {
        if self.fail_calls {
            return Err(Error::Backend("queue unavailable".to_string()));
        }
        let failures = entries
            .iter()
            .filter(|e| self.reject_ids.contains(&e.id.as_str()))
            .map(|e| SendFailure {
                id: e.id.clone(),
                code: "Throttled".to_string(),
                message: "slow down".to_string(),
            })
            .collect();
        self.batches.lock().unwrap().push(entries);
        Ok(failures)
    }
}

fn producer(
    queue: Arc<BatchRecorder>,
) -> (EntityProducer, Arc<MemoryTable>, Arc<EntityTracker>) {
    let table = Arc::new(MemoryTable::new("counters"));
    let tracker = Arc::new(EntityTracker::new());
    let producer = EntityProducer::new(queue, table.clone(), tracker.clone());
    (producer, table, tracker)
}

#[tokio::test]
async fn messages_are_sent_in_batches_of_ten() {
    let queue = Arc::new(BatchRecorder::default());
    let (producer, table, tracker) = producer(queue.clone());
    let entity = Entity::with_message_count("e1", 25);

    let summary = producer.produce(std::slice::from_ref(&entity)).await.unwrap();
    assert_eq!(
        summary,
        ProduceSummary {
            entities: 1,
            messages_sent: 25,
            messages_failed: 0,
        }
    );

    let batches = queue.batches();
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![10, 10, 5]);

    let entries: Vec<&SendEntry> = batches.iter().flatten().collect();
    for (index, entry) in entries.iter().enumerate() {
        assert_eq!(entry.id, format!("msg{index}"));
        assert_eq!(entry.body, format!("Entity: e1 | Message # {index}"));
        assert_eq!(entry.attributes["entity_id"], "e1");
        assert_eq!(entry.attributes["message_id"], (index + 1).to_string());
    }

    assert_eq!(table.get("e1"), Some(25));
    assert!(tracker.contains("e1"));
}

#[tokio::test]
async fn entity_without_messages_is_still_recorded_and_tracked() {
    let queue = Arc::new(BatchRecorder::default());
    let (producer, table, tracker) = producer(queue.clone());

    let summary = producer
        .produce(&[Entity::with_message_count("empty", 0)])
        .await
        .unwrap();
    assert_eq!(summary.entities, 1);
    assert_eq!(summary.messages_sent, 0);
    assert!(queue.batches().is_empty());
    assert_eq!(table.get("empty"), Some(0));
    assert!(tracker.contains("empty"));
}

#[tokio::test]
async fn rejected_entries_are_counted_without_aborting() {
    let queue = Arc::new(BatchRecorder {
        reject_ids: vec!["msg1", "msg12"],
        ..BatchRecorder::default()
    });
    let (producer, _table, _tracker) = producer(queue.clone());

    let summary = producer
        .produce(&[
            Entity::with_message_count("e1", 15),
            Entity::with_message_count("e2", 3),
        ])
        .await
        .unwrap();
    // msg1 is rejected for both entities, msg12 only for the first.
    assert_eq!(summary.entities, 2);
    assert_eq!(summary.messages_failed, 3);
    assert_eq!(summary.messages_sent, 15);
}

#[tokio::test]
async fn batch_call_errors_abort_production() {
    let queue = Arc::new(BatchRecorder {
        fail_calls: true,
        ..BatchRecorder::default()
    });
    let (producer, table, tracker) = producer(queue);

    let result = producer
        .produce(&[
            Entity::with_message_count("e1", 3),
            Entity::with_message_count("e2", 3),
        ])
        .await;
    assert!(matches!(result, Err(Error::Backend(_))));

    // Everything is tracked up front; only the first entity got written.
    assert!(tracker.contains("e1"));
    assert!(tracker.contains("e2"));
    assert_eq!(table.get("e1"), Some(3));
    assert_eq!(table.get("e2"), None);
}

#[test]
fn generated_entities_respect_bounds() {
    let entities = EntityProducer::generate(20, 7);
    assert_eq!(entities.len(), 20);
    for entity in &entities {
        assert_eq!(entity.id().len(), 30);
        assert!(entity.id().chars().all(|c| c.is_ascii_alphabetic()));
        assert!(entity.message_count() < 7);
        assert_eq!(entity.to_item().message_count, entity.message_count() as i64);
    }
    assert!(EntityProducer::generate(3, 0).iter().all(|e| e.message_count() == 0));
}
