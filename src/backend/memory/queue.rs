use super::lock;
use crate::backend::{MAX_SEND_BATCH, QueueBackend, validate_batch};
use crate::error::{Error, Result};
use crate::model::{Message, ReceiptToken, SendEntry, SendFailure};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Upper bound on how long an idle long-poll sleeps before rechecking
/// for messages whose visibility timeout has expired.
const IDLE_TICK: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct StoredMessage {
    id: u64,
    body: String,
    attributes: HashMap<String, String>,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptToken>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    messages: Vec<StoredMessage>,
}

/// Pull queue with visibility-timeout redelivery.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    arrivals: Notify,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            visibility_timeout,
        }
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by a visibility timeout.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        lock(&self.state)
            .messages
            .iter()
            .filter(|m| m.visible_at > now)
            .count()
    }

    fn receive_visible(&self, max_messages: usize) -> Vec<Message> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages)
            .map(|m| {
                let receipt = ReceiptToken(Uuid::new_v4().to_string());
                m.visible_at = now + self.visibility_timeout;
                m.receive_count += 1;
                m.receipt = Some(receipt.clone());
                Message {
                    message_id: m.id.to_string(),
                    body: m.body.clone(),
                    attributes: m.attributes.clone(),
                    receipt,
                    receive_count: m.receive_count,
                }
            })
            .collect()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn poll(&self, max_messages: usize, wait: Duration) -> Result<Vec<Message>> {
        if max_messages == 0 || max_messages > MAX_SEND_BATCH {
            return Err(Error::Backend(format!(
                "max_messages must be between 1 and {MAX_SEND_BATCH}, got {max_messages}"
            )));
        }

        let deadline = Instant::now() + wait;
        loop {
            let batch = self.receive_visible(max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                // Lets a zero-wait poller spinning on an empty queue give way.
                tokio::task::yield_now().await;
                return Ok(Vec::new());
            }
            let nap = (deadline - now).min(IDLE_TICK);
            let _ = tokio::time::timeout(nap, self.arrivals.notified()).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptToken) -> Result<()> {
        let mut state = lock(&self.state);
        let index = state
            .messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| Error::NotFound(format!("receipt {receipt}")))?;
        state.messages.remove(index);
        Ok(())
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<Vec<SendFailure>> {
        let (valid, failures) = validate_batch(entries)?;
        {
            let now = Instant::now();
            let mut state = lock(&self.state);
            for entry in valid {
                let id = state.next_id;
                state.next_id += 1;
                state.messages.push(StoredMessage {
                    id,
                    body: entry.body,
                    attributes: entry.attributes,
                    visible_at: now,
                    receive_count: 0,
                    receipt: None,
                });
            }
        }
        self.arrivals.notify_waiters();
        Ok(failures)
    }
}
