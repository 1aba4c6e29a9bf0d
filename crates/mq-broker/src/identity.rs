//! Message identity resolution
//!
//! The `message_id` property wins; otherwise a `message_id` field of a JSON
//! object payload is used. Anything else is unidentified.

use mq_common::QueueMessage;
use serde_json::Value;

use crate::delivery::Delivery;

/// Field looked up inside JSON payloads
const PAYLOAD_ID_FIELD: &str = "message_id";

/// Resolve the application-level ID from a property value and raw payload
pub fn resolve(message_id_property: Option<&str>, payload: &[u8]) -> Option<String> {
    if let Some(id) = message_id_property.filter(|id| !id.is_empty()) {
        return Some(id.to_string());
    }

    let parsed: Value = serde_json::from_slice(payload).ok()?;
    match parsed.get(PAYLOAD_ID_FIELD)? {
        Value::Null => None,
        Value::String(id) => Some(id.clone()),
        // Numbers and bools keep their JSON text form
        other => Some(other.to_string()),
    }
}

/// Application-level ID of a consumed delivery
pub fn resolve_delivery(delivery: &Delivery) -> Option<String> {
    resolve(delivery.properties.message_id.as_deref(), &delivery.payload)
}

/// Application-level ID of a dashboard record
pub fn resolve_record(record: &QueueMessage) -> Option<String> {
    let payload = record.decoded_payload().ok()?;
    resolve(record.properties.message_id.as_deref(), &payload)
}
