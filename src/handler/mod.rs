//! Callback contracts the two consumers invoke.
//!
//! A [`MessageHandler`] returning `Ok` lets the worker pool delete the
//! message; an error leaves it for redelivery, so implementations must
//! tolerate seeing the same message more than once. A [`RecordHandler`]
//! error is logged and the record is dropped; records are never retried.

pub mod completion;
pub mod entity;

pub use completion::{CompletionHandler, ParseFailurePolicy};
pub use entity::EntityMessageHandler;

use crate::error::Result;
use crate::model::{Message, Record, ShardId};
use async_trait::async_trait;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, shard: &ShardId, record: &Record) -> Result<()>;
}
