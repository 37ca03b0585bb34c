//! pgmq queue backend via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.read, pgmq.read_with_poll,
//! pgmq.send_batch, pgmq.delete. Message bodies and attributes travel
//! together as one jsonb document.

use super::Db;
use crate::backend::{MAX_SEND_BATCH, QueueBackend, validate_batch};
use crate::error::{Error, Result};
use crate::model::{Message, ReceiptToken, SendEntry, SendFailure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Stored shape of a queued message.
#[derive(Debug, Serialize, Deserialize)]
struct QueuedPayload {
    body: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

/// A pgmq queue.
///
/// The receipt token is the pgmq message id, so a stale token still
/// deletes the message after it has been redelivered.
pub struct PgmqQueue {
    db: Arc<Db>,
    queue_name: String,
    visibility_timeout: i32,
}

impl PgmqQueue {
    pub fn new(db: Arc<Db>, queue_name: &str, visibility_timeout_seconds: u64) -> Self {
        Self {
            db,
            queue_name: queue_name.to_string(),
            visibility_timeout: i32::try_from(visibility_timeout_seconds).unwrap_or(i32::MAX),
        }
    }
}

fn into_message(msg_id: i64, read_ct: i32, message: serde_json::Value) -> Message {
    let payload = match serde_json::from_value::<QueuedPayload>(message.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(msg_id, error = %e, "queued message has no body/attributes envelope");
            QueuedPayload {
                body: message.to_string(),
                attributes: HashMap::new(),
            }
        }
    };
    Message {
        message_id: msg_id.to_string(),
        body: payload.body,
        attributes: payload.attributes,
        receipt: ReceiptToken(msg_id.to_string()),
        receive_count: u32::try_from(read_ct).unwrap_or(0),
    }
}

#[async_trait]
impl QueueBackend for PgmqQueue {
    async fn poll(&self, max_messages: usize, wait: Duration) -> Result<Vec<Message>> {
        if max_messages == 0 || max_messages > MAX_SEND_BATCH {
            return Err(Error::Backend(format!(
                "max_messages must be between 1 and {MAX_SEND_BATCH}, got {max_messages}"
            )));
        }
        let qty = max_messages as i32;
        let wait_seconds = i32::try_from(wait.as_secs()).unwrap_or(i32::MAX);

        let rows: Vec<(i64, i32, serde_json::Value)> = if wait_seconds == 0 {
            sqlx::query_as("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, $3)")
                .bind(&self.queue_name)
                .bind(self.visibility_timeout)
                .bind(qty)
                .fetch_all(self.db.pool())
                .await?
        } else {
            sqlx::query_as(
                "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, $3, $4)",
            )
            .bind(&self.queue_name)
            .bind(self.visibility_timeout)
            .bind(qty)
            .bind(wait_seconds)
            .fetch_all(self.db.pool())
            .await?
        };

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, message)| into_message(msg_id, read_ct, message))
            .collect())
    }

    async fn delete(&self, receipt: &ReceiptToken) -> Result<()> {
        let msg_id: i64 = receipt
            .0
            .parse()
            .map_err(|_| Error::Backend(format!("receipt {receipt} is not a pgmq message id")))?;
        let (deleted,): (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(&self.queue_name)
            .bind(msg_id)
            .fetch_one(self.db.pool())
            .await?;
        if deleted {
            Ok(())
        } else {
            Err(Error::NotFound(format!("message {msg_id} in queue {}", self.queue_name)))
        }
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<Vec<SendFailure>> {
        let (valid, failures) = validate_batch(entries)?;
        if valid.is_empty() {
            return Ok(failures);
        }
        let payloads = valid
            .into_iter()
            .map(|entry| {
                serde_json::to_value(QueuedPayload {
                    body: entry.body,
                    attributes: entry.attributes,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        sqlx::query_as::<_, (i64,)>("SELECT pgmq.send_batch($1, $2::jsonb[])")
            .bind(&self.queue_name)
            .bind(payloads)
            .fetch_all(self.db.pool())
            .await?;
        Ok(failures)
    }
}
