//! Message model and wire format
//!
//! Outbound messages are JSON objects in one of two shapes; the consumer
//! accepts either by parsing payloads as generic JSON objects.

use crate::error::{CanaryError, Result};
use crate::utils::epoch_millis;
use bytes::Bytes;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Payload shape emitted by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadShape {
    /// `{"createAt": <epoch-ms>, "payload": <string>}`
    #[default]
    Templated,
    /// `{"message": "message-<i>", "date": <ISO-8601>}`
    Dated,
}

/// Wire-level canary event, one per produced message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanaryEvent {
    Templated {
        #[serde(rename = "createAt")]
        create_at: i64,
        payload: String,
    },
    Dated { message: String, date: String },
}

impl CanaryEvent {
    /// Builds the event for position `index` of a batch
    pub fn new(shape: PayloadShape, index: usize, produced_at_epoch_ms: i64) -> Self {
        match shape {
            PayloadShape::Templated => CanaryEvent::Templated {
                create_at: produced_at_epoch_ms,
                payload: message_template(index),
            },
            PayloadShape::Dated => CanaryEvent::Dated {
                message: format!("message-{}", index),
                date: iso_timestamp(produced_at_epoch_ms),
            },
        }
    }
}

/// A message ready to be sent. Exists only for the duration of one send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub produced_at_epoch_ms: i64,
}

impl OutboundMessage {
    pub fn from_event(event: &CanaryEvent, produced_at_epoch_ms: i64) -> Result<Self> {
        Ok(Self {
            payload: encode(event)?,
            produced_at_epoch_ms,
        })
    }
}

/// Serializes an outbound payload as JSON
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CanaryError::Encode(e.to_string()))
}

/// A delivered message envelope, owned by one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub raw_payload: Bytes,
}

const LONG_TEMPLATE_HEAD: &str = "Lorem ipsum";
const LONG_TEMPLATE_TAIL: &str = "dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor \
incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation \
ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute irure dolor in reprehenderit in \
voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur sint occaecat cupidatat non \
proident, sunt in culpa qui officia deserunt mollit anim id est laborum";

/// Payload text for batch position `index`
///
/// Even positions get a short string, odd positions a long one; both embed
/// the index so every message in a batch is distinguishable.
pub fn message_template(index: usize) -> String {
    if index % 2 == 0 {
        format!("short-message-{}", index)
    } else {
        format!("{} {} {}", LONG_TEMPLATE_HEAD, index, LONG_TEMPLATE_TAIL)
    }
}

/// Composes one batch of `count` messages sharing a produced-at timestamp
pub fn build_batch(count: usize, shape: PayloadShape) -> Result<Vec<OutboundMessage>> {
    let produced_at = epoch_millis();
    (0..count)
        .map(|i| OutboundMessage::from_event(&CanaryEvent::new(shape, i, produced_at), produced_at))
        .collect()
}

/// Parses a consumed payload as a generic JSON object
///
/// No schema is assumed beyond "valid JSON object", so both producer shapes
/// (and anything else object-shaped) are accepted.
pub fn parse_payload(raw: &[u8]) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_slice::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CanaryError::Parse(serde::de::Error::custom(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        )))),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn iso_timestamp(epoch_ms: i64) -> String {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
