//! Core data model.
//!
//! Queue messages and log records are what the two consumers move around.
//! Entities and their change events are what the migration pipeline tracks.

pub mod change;
pub mod entity;
pub mod message;
pub mod record;

pub use change::{ChangeEvent, EventName};
pub use entity::{Entity, EntityMessages};
pub use message::{Message, ReceiptToken, SendEntry, SendFailure};
pub use record::{Cursor, FetchOutput, Record, SequenceNumber, ShardId, ShardPage};
