//! Table change events as they appear on the change log.
//!
//! The wire format mirrors DynamoDB Streams records delivered through a
//! Kinesis stream, so the completion handler can read either source.
//! Attribute values are typed wrappers: `{"S": "..."}` for strings and
//! `{"N": "..."}` for numbers (numbers travel as strings).

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_SOURCE: &str = "queue-tasks:table";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    Insert,
    Modify,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "awsRegion", default)]
    pub region: String,
    #[serde(rename = "eventID", default)]
    pub event_id: String,
    #[serde(rename = "eventName", default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<EventName>,
    #[serde(rename = "userIdentity", default, skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<serde_json::Value>,
    #[serde(rename = "recordFormat", default)]
    pub record_format: String,
    #[serde(rename = "tableName", default)]
    pub table_name: String,
    #[serde(rename = "dynamodb", default)]
    pub change: StreamRecord,
    #[serde(rename = "eventSource", default)]
    pub event_source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamRecord {
    #[serde(default)]
    pub approximate_creation_date_time: i64,
    #[serde(default)]
    pub keys: Keys,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<Image>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub approximate_creation_date_time_precision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<StringValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<StringValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<NumberValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringValue {
    #[serde(rename = "S")]
    pub s: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberValue {
    #[serde(rename = "N")]
    pub n: String,
}

impl Image {
    fn counter(entity_id: &str, count: i64) -> Self {
        Self {
            entity_id: Some(StringValue {
                s: entity_id.to_string(),
            }),
            message_count: Some(NumberValue {
                n: count.to_string(),
            }),
        }
    }
}

impl ChangeEvent {
    /// Decode a change-log payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Event for a counter write. `old == None` means the item was created.
    pub fn counter_change(
        table_name: &str,
        entity_id: &str,
        old: Option<i64>,
        new: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            region: "local".to_string(),
            event_id: Uuid::new_v4().simple().to_string(),
            event_name: Some(if old.is_some() {
                EventName::Modify
            } else {
                EventName::Insert
            }),
            user_identity: None,
            record_format: "application/json".to_string(),
            table_name: table_name.to_string(),
            change: StreamRecord {
                approximate_creation_date_time: at.timestamp_millis(),
                keys: Keys {
                    entity_id: Some(StringValue {
                        s: entity_id.to_string(),
                    }),
                },
                new_image: Some(Image::counter(entity_id, new)),
                old_image: old.map(|count| Image::counter(entity_id, count)),
                size_bytes: 0,
                approximate_creation_date_time_precision: "MILLISECOND".to_string(),
            },
            event_source: EVENT_SOURCE.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Entity id from the new image, falling back to the item key.
    pub fn entity_id(&self) -> Option<&str> {
        self.change
            .new_image
            .as_ref()
            .and_then(|image| image.entity_id.as_ref())
            .or(self.change.keys.entity_id.as_ref())
            .map(|v| v.s.as_str())
    }

    /// Outstanding message count from the new image.
    pub fn remaining_count(&self) -> Result<i64> {
        let raw = self
            .change
            .new_image
            .as_ref()
            .and_then(|image| image.message_count.as_ref())
            .map(|v| v.n.as_str())
            .ok_or_else(|| Error::Parse("new image has no message_count".to_string()))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Parse(format!("message_count {raw:?} is not an integer")))
    }
}
