//! Completion and entity message handlers.

use chrono::Utc;
use async_trait::async_trait;
use queue_tasks::backend::TableBackend;
use queue_tasks::backend::memory::{MemoryStream, MemoryTable};
use queue_tasks::engine::{ShutdownReason, shutdown_channel};
use queue_tasks::error::{Error, Result};
use queue_tasks::handler::{
    CompletionHandler, EntityMessageHandler, MessageHandler, ParseFailurePolicy, RecordHandler,
};
use queue_tasks::model::{
    ChangeEvent, EntityMessages, Message, ReceiptToken, Record, SequenceNumber, ShardId,
};
use queue_tasks::tracker::EntityTracker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn record(data: Vec<u8>) -> Record {
    Record {
        data,
        sequence_number: SequenceNumber(1),
        partition_key: "key".to_string(),
        approximate_arrival: Utc::now(),
    }
}

fn counter_record(entity_id: &str, old: Option<i64>, new: i64) -> Record {
    let event = ChangeEvent::counter_change("counters", entity_id, old, new, Utc::now());
    record(event.to_bytes().unwrap())
}

fn shard() -> ShardId {
    ShardId::from_index(0)
}

fn message(attributes: &[(&str, &str)]) -> Message {
    Message {
        message_id: "1".to_string(),
        body: "Entity: e1 | Message # 0".to_string(),
        attributes: attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        receipt: ReceiptToken("receipt".to_string()),
        receive_count: 1,
    }
}

#[tokio::test]
async fn zero_count_completes_entity_and_drains_tracker() {
    let (handle, mut listener) = shutdown_channel();
    let tracker = Arc::new(EntityTracker::with_shutdown(handle));
    tracker.add("A");
    tracker.add("B");
    let handler = CompletionHandler::new(tracker.clone());

    handler.handle(&shard(), &counter_record("A", Some(1), 0)).await.unwrap();
    assert_eq!(tracker.count(), 1);
    assert_eq!(listener.try_recv(), None);

    handler.handle(&shard(), &counter_record("B", Some(1), 0)).await.unwrap();
    assert_eq!(tracker.count(), 0);
    assert_eq!(listener.try_recv(), Some(ShutdownReason::Drained));
    assert_eq!(listener.try_recv(), None);
}

#[tokio::test]
async fn positive_count_keeps_entity_tracked() {
    let tracker = Arc::new(EntityTracker::new());
    tracker.add("A");
    let handler = CompletionHandler::new(tracker.clone());

    handler.handle(&shard(), &counter_record("A", None, 3)).await.unwrap();
    handler.handle(&shard(), &counter_record("A", Some(3), 2)).await.unwrap();
    assert!(tracker.contains("A"));
}

#[tokio::test]
async fn negative_count_counts_as_complete() {
    let tracker = Arc::new(EntityTracker::new());
    tracker.add("A");
    let handler = CompletionHandler::new(tracker.clone());

    handler.handle(&shard(), &counter_record("A", Some(0), -1)).await.unwrap();
    assert!(!tracker.contains("A"));
}

#[tokio::test]
async fn completion_for_untracked_entity_is_ignored() {
    let (handle, mut listener) = shutdown_channel();
    let tracker = Arc::new(EntityTracker::with_shutdown(handle));
    tracker.add("A");
    let handler = CompletionHandler::new(tracker.clone());

    handler.handle(&shard(), &counter_record("other", Some(1), 0)).await.unwrap();
    assert_eq!(tracker.count(), 1);
    assert_eq!(listener.try_recv(), None);
}

#[tokio::test]
async fn malformed_records_are_skipped_by_default() {
    let tracker = Arc::new(EntityTracker::new());
    tracker.add("A");
    let handler = CompletionHandler::new(tracker.clone());

    let no_count = br#"{"eventName":"MODIFY","dynamodb":{"NewImage":{"entity_id":{"S":"A"}}}}"#;
    let not_a_number = br#"{"dynamodb":{"NewImage":{"entity_id":{"S":"A"},"message_count":{"N":"lots"}}}}"#;
    let no_entity = br#"{"dynamodb":{"NewImage":{"message_count":{"N":"0"}}}}"#;
    for data in [
        b"not json".to_vec(),
        no_count.to_vec(),
        not_a_number.to_vec(),
        no_entity.to_vec(),
    ] {
        handler.handle(&shard(), &record(data)).await.unwrap();
    }
    assert_eq!(tracker.count(), 1);
    assert!(tracker.contains("A"));
}

#[tokio::test]
async fn reject_policy_returns_parse_errors() {
    let tracker = Arc::new(EntityTracker::new());
    tracker.add("A");
    let handler = CompletionHandler::new(tracker.clone()).with_policy(ParseFailurePolicy::Reject);

    let result = handler.handle(&shard(), &record(b"{broken".to_vec())).await;
    assert!(matches!(result, Err(Error::Parse(_))));
    assert_eq!(tracker.count(), 1);
}

#[tokio::test]
async fn entity_id_falls_back_to_item_key() {
    let tracker = Arc::new(EntityTracker::new());
    tracker.add("A");
    let handler = CompletionHandler::new(tracker.clone());

    let data = br#"{"dynamodb":{"Keys":{"entity_id":{"S":"A"}},"NewImage":{"message_count":{"N":"0"}}}}"#;
    handler.handle(&shard(), &record(data.to_vec())).await.unwrap();
    assert!(!tracker.contains("A"));
}

async fn seeded_table(count: i64) -> Arc<MemoryTable> {
    let table = Arc::new(MemoryTable::new("counters"));
    table
        .put(&EntityMessages {
            entity_id: "e1".to_string(),
            message_count: count,
        })
        .await
        .unwrap();
    table
}

#[tokio::test]
async fn entity_message_decrements_counter() {
    let table = seeded_table(2).await;
    let handler = EntityMessageHandler::new(table.clone());

    handler
        .handle(&message(&[("entity_id", "e1"), ("message_id", "1")]))
        .await
        .unwrap();
    assert_eq!(table.get("e1"), Some(1));
}

#[tokio::test]
async fn duplicate_delivery_is_counted_once() {
    let table = seeded_table(2).await;
    let handler = EntityMessageHandler::new(table.clone());
    let msg = message(&[("entity_id", "e1"), ("message_id", "1")]);

    handler.handle(&msg).await.unwrap();
    handler.handle(&msg).await.unwrap();
    assert_eq!(table.get("e1"), Some(1));

    handler
        .handle(&message(&[("entity_id", "e1"), ("message_id", "2")]))
        .await
        .unwrap();
    assert_eq!(table.get("e1"), Some(0));
}

#[tokio::test]
async fn message_without_attributes_is_accepted_untouched() {
    let table = seeded_table(2).await;
    let handler = EntityMessageHandler::new(table.clone());

    handler.handle(&message(&[])).await.unwrap();
    handler.handle(&message(&[("entity_id", "e1")])).await.unwrap();
    handler.handle(&message(&[("message_id", "1")])).await.unwrap();
    assert_eq!(table.get("e1"), Some(2));
}

#[tokio::test]
async fn unknown_entity_is_a_handler_error() {
    let table = seeded_table(2).await;
    let handler = EntityMessageHandler::new(table.clone());
    let msg = message(&[("entity_id", "ghost"), ("message_id", "1")]);

    let result = handler.handle(&msg).await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    // Not marked as applied, so a later delivery is retried.
    table
        .put(&EntityMessages {
            entity_id: "ghost".to_string(),
            message_count: 1,
        })
        .await
        .unwrap();
    handler.handle(&msg).await.unwrap();
    assert_eq!(table.get("ghost"), Some(0));
}

#[tokio::test]
async fn completions_in_an_untracking_process_never_drain() {
    // The stream-only process keeps no entities, so completions only log.
    let tracker = Arc::new(EntityTracker::new());
    let handler = CompletionHandler::new(tracker.clone());

    handler.handle(&shard(), &counter_record("A", Some(1), 0)).await.unwrap();
    assert_eq!(tracker.count(), 0);
    assert!(!tracker.is_drained());
}

/// Delays every counter update so deliveries can overlap.
struct SlowTable {
    inner: Arc<MemoryTable>,
}

#[async_trait]
impl TableBackend for SlowTable {
    async fn put(&self, item: &EntityMessages) -> Result<()> {
        self.inner.put(item).await
    }

    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<i64> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.update_counter(entity_id, delta).await
    }
}

#[tokio::test]
async fn overlapping_deliveries_of_one_message_decrement_once() {
    let table = seeded_table(2).await;
    let handler = EntityMessageHandler::new(Arc::new(SlowTable {
        inner: table.clone(),
    }));
    let msg = message(&[("entity_id", "e1"), ("message_id", "1")]);

    let (first, second) = tokio::join!(handler.handle(&msg), handler.handle(&msg));
    first.unwrap();
    second.unwrap();
    assert_eq!(table.get("e1"), Some(1));
    assert_eq!(handler.pending_deliveries(), 1);
}

#[tokio::test]
async fn completed_entity_releases_its_message_keys() {
    let table = seeded_table(2).await;
    let handler = EntityMessageHandler::new(table.clone());

    handler
        .handle(&message(&[("entity_id", "e1"), ("message_id", "1")]))
        .await
        .unwrap();
    assert_eq!(handler.pending_deliveries(), 1);

    handler
        .handle(&message(&[("entity_id", "e1"), ("message_id", "2")]))
        .await
        .unwrap();
    assert_eq!(table.get("e1"), Some(0));
    assert_eq!(handler.pending_deliveries(), 0);
    assert_eq!(handler.completed_entities(), 1);

    // A late redelivery of a completed entity is still ignored.
    handler
        .handle(&message(&[("entity_id", "e1"), ("message_id", "1")]))
        .await
        .unwrap();
    assert_eq!(table.get("e1"), Some(0));
}

#[tokio::test]
async fn completed_entities_are_capped() {
    let table = Arc::new(MemoryTable::new("counters"));
    for id in ["a", "b", "c"] {
        table
            .put(&EntityMessages {
                entity_id: id.to_string(),
                message_count: 1,
            })
            .await
            .unwrap();
    }
    let handler = EntityMessageHandler::new(table.clone()).with_completed_capacity(2);

    for id in ["a", "b", "c"] {
        handler
            .handle(&message(&[("entity_id", id), ("message_id", "1")]))
            .await
            .unwrap();
    }
    assert_eq!(handler.completed_entities(), 2);
    assert_eq!(handler.pending_deliveries(), 0);
}

#[tokio::test]
async fn failed_change_publish_leaves_counter_untouched() {
    let stream = Arc::new(MemoryStream::new("changes", 1));
    let table = Arc::new(MemoryTable::new("counters").with_change_stream(stream.clone()));
    table
        .put(&EntityMessages {
            entity_id: "e1".to_string(),
            message_count: 2,
        })
        .await
        .unwrap();
    stream.close_shard(&ShardId::from_index(0)).unwrap();
    let handler = EntityMessageHandler::new(table.clone());
    let msg = message(&[("entity_id", "e1"), ("message_id", "1")]);

    assert!(matches!(handler.handle(&msg).await, Err(Error::Backend(_))));
    assert!(matches!(handler.handle(&msg).await, Err(Error::Backend(_))));
    assert_eq!(table.get("e1"), Some(2));
    assert_eq!(handler.pending_deliveries(), 0);

    let reseed = table
        .put(&EntityMessages {
            entity_id: "e1".to_string(),
            message_count: 5,
        })
        .await;
    assert!(matches!(reseed, Err(Error::Backend(_))));
    assert_eq!(table.get("e1"), Some(2));
}
