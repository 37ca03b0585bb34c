//! Queue message types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-delivery token used to delete a received message.
///
/// A message received twice gets two different tokens; only the most
/// recent one is guaranteed to be accepted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptToken(pub String);

impl std::fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Backend-assigned message identifier, stable across redeliveries.
    pub message_id: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub receipt: ReceiptToken,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
}

impl Message {
    /// Look up a named attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// One entry of a batch send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    /// Caller-chosen id, unique within the batch. Failures refer to it.
    pub id: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

impl SendEntry {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add a string attribute.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// A batch entry the backend refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}
