//! Completion handler for the table's change log.
//!
//! Reads the outstanding message count from each change event's new image.
//! An entity whose count has reached zero is removed from the tracker, and
//! once nothing is left the tracker's one-shot shutdown fires.

use super::RecordHandler;
use crate::error::{Error, Result};
use crate::model::{ChangeEvent, Record, ShardId};
use crate::tracker::EntityTracker;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with a change event that cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseFailurePolicy {
    /// Log and treat the record as handled.
    #[default]
    Skip,
    /// Return the parse error to the shard loop, which logs it.
    Reject,
}

pub struct CompletionHandler {
    tracker: Arc<EntityTracker>,
    policy: ParseFailurePolicy,
}

impl CompletionHandler {
    pub fn new(tracker: Arc<EntityTracker>) -> Self {
        Self {
            tracker,
            policy: ParseFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ParseFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn parse_failed(&self, record: &Record, error: Error) -> Result<()> {
        match self.policy {
            ParseFailurePolicy::Skip => {
                warn!(
                    sequence = record.sequence_number.0,
                    error = %error,
                    "ignoring unreadable change event"
                );
                Ok(())
            }
            ParseFailurePolicy::Reject => Err(error),
        }
    }
}

#[async_trait]
impl RecordHandler for CompletionHandler {
    async fn handle(&self, shard: &ShardId, record: &Record) -> Result<()> {
        let event = match ChangeEvent::parse(&record.data) {
            Ok(event) => event,
            Err(e) => return self.parse_failed(record, e),
        };
        let remaining = match event.remaining_count() {
            Ok(remaining) => remaining,
            Err(e) => return self.parse_failed(record, e),
        };
        let Some(entity_id) = event.entity_id() else {
            let error = Error::Parse("event has no entity_id".to_string());
            return self.parse_failed(record, error);
        };

        debug!(%shard, entity_id, remaining, "change event");

        // Redelivered queue messages can decrement past zero.
        if remaining <= 0 {
            if remaining < 0 {
                warn!(entity_id, remaining, "message count went negative");
            }
            if self.tracker.remove(entity_id) {
                info!(
                    entity_id,
                    outstanding = self.tracker.count(),
                    "entity migration completed"
                );
            }
        }

        self.tracker.notify_if_drained();
        Ok(())
    }
}
