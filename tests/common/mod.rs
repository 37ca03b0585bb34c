//! Shared helpers and instrumented backends for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use queue_tasks::backend::memory::{MemoryQueue, MemoryStream};
use queue_tasks::backend::{QueueBackend, StreamBackend};
use queue_tasks::engine::WorkerPoolConfig;
use queue_tasks::error::{Error, Result};
use queue_tasks::handler::{MessageHandler, RecordHandler};
use queue_tasks::model::{
    Cursor, FetchOutput, Message, ReceiptToken, Record, SendEntry, SendFailure, SequenceNumber,
    ShardId, ShardPage,
};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Wait until `check` holds, failing the test after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

/// Await a spawned task, failing the test if it does not finish promptly.
pub async fn finishes<T>(task: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("task did not finish within 5s")
}

pub fn pool_config(worker_count: usize, batch_size: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        queue_name: "test-queue".to_string(),
        worker_count,
        batch_size,
        wait_time: Duration::from_millis(20),
    }
}

pub async fn send_bodies(queue: &dyn QueueBackend, bodies: &[&str]) {
    for chunk in bodies.chunks(10) {
        let entries = chunk
            .iter()
            .enumerate()
            .map(|(i, body)| SendEntry::new(format!("msg{i}"), *body))
            .collect();
        let failures = queue.send_batch(entries).await.unwrap();
        assert!(failures.is_empty());
    }
}

/// Memory queue that counts deletes and can inject poll and delete failures.
pub struct InstrumentedQueue {
    pub inner: MemoryQueue,
    pub deletes: AtomicUsize,
    pub polls: AtomicUsize,
    failing_polls: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl InstrumentedQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: MemoryQueue::new(visibility_timeout),
            deletes: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            failing_polls: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_polls(self, count: usize) -> Self {
        self.failing_polls.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_next_deletes(self, count: usize) -> Self {
        self.failing_deletes.store(count, Ordering::SeqCst);
        self
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl QueueBackend for InstrumentedQueue {
    async fn poll(&self, max_messages: usize, wait: Duration) -> Result<Vec<Message>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_polls) {
            tokio::task::yield_now().await;
            return Err(Error::Backend("injected poll failure".to_string()));
        }
        self.inner.poll(max_messages, wait).await
    }

    async fn delete(&self, receipt: &ReceiptToken) -> Result<()> {
        if take_failure(&self.failing_deletes) {
            return Err(Error::Backend("injected delete failure".to_string()));
        }
        self.inner.delete(receipt).await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<Vec<SendFailure>> {
        self.inner.send_batch(entries).await
    }
}

/// Message handler that records every body it sees.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self {
            seen: Mutex::default(),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<()> {
        self.seen.lock().unwrap().push(message.body.clone());
        if self.fail {
            Err(Error::Handler("rejected".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Record handler that remembers the order records arrive in per shard.
#[derive(Default)]
pub struct RecordingRecords {
    pub seen: Mutex<Vec<(ShardId, SequenceNumber, Vec<u8>)>>,
}

impl RecordingRecords {
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn sequences(&self, shard: &ShardId) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| s == shard)
            .map(|(_, seq, _)| seq.0)
            .collect()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingRecords {
    async fn handle(&self, shard: &ShardId, record: &Record) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((shard.clone(), record.sequence_number, record.data.clone()));
        Ok(())
    }
}

/// Memory stream whose first fetches fail.
pub struct FlakyStream {
    pub inner: MemoryStream,
    pub fetches: AtomicUsize,
    failing_fetches: AtomicUsize,
}

impl FlakyStream {
    pub fn new(inner: MemoryStream, failing_fetches: usize) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(failing_fetches),
        }
    }
}

#[async_trait]
impl StreamBackend for FlakyStream {
    async fn list_shards(
        &self,
        stream: &str,
        exclusive_start: Option<&ShardId>,
    ) -> Result<ShardPage> {
        self.inner.list_shards(stream, exclusive_start).await
    }

    async fn trim_horizon_cursor(&self, stream: &str, shard: &ShardId) -> Result<Cursor> {
        self.inner.trim_horizon_cursor(stream, shard).await
    }

    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<FetchOutput> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_fetches) {
            return Err(Error::Backend("injected fetch failure".to_string()));
        }
        self.inner.fetch(cursor, limit).await
    }
}
