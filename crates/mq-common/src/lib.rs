use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Message Record Types
// ============================================================================

/// Property bag of a message, in the shape the management UI exchanges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    /// Application-level message ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Seconds since the epoch; accepted as a number or a numeric string
    #[serde(default, deserialize_with = "deserialize_timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl MessageProperties {
    /// Copy of these properties carrying a new message ID
    pub fn with_message_id(&self, message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..self.clone()
        }
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", n))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid timestamp: {}", s))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid timestamp: {}", other))),
    }
}

/// How the `payload` field of a record is encoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    String,
    Base64,
}

/// A message as shown in (and posted back from) the dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub payload: String,
    #[serde(default)]
    pub payload_bytes: usize,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default)]
    pub properties: MessageProperties,
}

impl QueueMessage {
    /// Build a record from raw payload bytes. Non UTF-8 payloads are carried as base64.
    pub fn from_payload(payload: &[u8], properties: MessageProperties) -> Self {
        let (payload_text, payload_encoding) = match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), PayloadEncoding::String),
            Err(_) => (BASE64.encode(payload), PayloadEncoding::Base64),
        };

        Self {
            payload: payload_text,
            payload_bytes: payload.len(),
            payload_encoding,
            properties,
            ..Default::default()
        }
    }

    /// Raw payload bytes to publish
    pub fn decoded_payload(&self) -> Result<Vec<u8>> {
        match self.payload_encoding {
            PayloadEncoding::String => Ok(self.payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => BASE64
                .decode(self.payload.trim())
                .map_err(|e| OperationError::malformed_record(format!("payload is not valid base64: {}", e))),
        }
    }
}

// ============================================================================
// Operation Results
// ============================================================================

/// Outcome of a targeted delete
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<QueueMessage>,
}

impl DeleteResult {
    pub fn deleted(message: QueueMessage) -> Self {
        Self {
            deleted: true,
            message: Some(message),
        }
    }

    pub fn not_found() -> Self {
        Self {
            deleted: false,
            message: None,
        }
    }
}

/// Outcome of a publish: the channel accepted it, routing is not confirmed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
}

/// Outcome of copying a message to another queue and removing the original
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveResult {
    pub sent: bool,
    pub deleted: bool,
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure categories surfaced to the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Broker unreachable or connection rejected
    BrokerUnreachable,
    /// Missing or empty argument, rejected before any broker interaction
    InvalidArgument,
    /// Record posted by the caller cannot be turned into a message
    MalformedRecord,
    /// A consumed message has no resolvable ID
    UnidentifiableMessage,
    /// Broker refused a channel level operation
    BrokerProtocol,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message is not valid; all messages on the queue should have a message id (consumer {consumer_tag})")]
    UnidentifiableMessage { consumer_tag: String },

    #[error("Malformed message record: {0}")]
    MalformedRecord(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Consumer {consumer_tag} was cancelled by the broker")]
    ConsumerCancelled { consumer_tag: String },

    /// Copy reached the destination, removing the original failed
    #[error("Message was copied to '{destination}' but not removed from the source: {cause}")]
    MoveIncomplete {
        destination: String,
        #[source]
        cause: Box<OperationError>,
    },
}

impl OperationError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unidentifiable(consumer_tag: impl Into<String>) -> Self {
        Self::UnidentifiableMessage {
            consumer_tag: consumer_tag.into(),
        }
    }

    pub fn malformed_record(message: impl Into<String>) -> Self {
        Self::MalformedRecord(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn move_incomplete(destination: impl Into<String>, cause: OperationError) -> Self {
        Self::MoveIncomplete {
            destination: destination.into(),
            cause: Box::new(cause),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::BrokerUnreachable,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::UnidentifiableMessage { .. } => ErrorKind::UnidentifiableMessage,
            Self::MalformedRecord(_) => ErrorKind::MalformedRecord,
            Self::Protocol(_) | Self::ConsumerCancelled { .. } => ErrorKind::BrokerProtocol,
            Self::MoveIncomplete { cause, .. } => cause.kind(),
        }
    }

    /// Consumer tag to cancel during teardown, if the failure carries one
    pub fn consumer_tag(&self) -> Option<&str> {
        match self {
            Self::UnidentifiableMessage { consumer_tag } | Self::ConsumerCancelled { consumer_tag } => {
                Some(consumer_tag)
            }
            Self::MoveIncomplete { cause, .. } => cause.consumer_tag(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accepts_string_timestamp() {
        let record: QueueMessage = serde_json::from_value(serde_json::json!({
            "payload": "{}",
            "properties": { "timestamp": "1700000000", "message_id": "abc" }
        }))
        .unwrap();

        assert_eq!(record.properties.timestamp, Some(1_700_000_000));
        assert_eq!(record.properties.message_id.as_deref(), Some("abc"));
        assert!(record.properties.headers.is_empty());
    }

    #[test]
    fn test_record_accepts_numeric_timestamp_and_type() {
        let record: QueueMessage = serde_json::from_value(serde_json::json!({
            "payload": "hello",
            "properties": { "timestamp": 42, "type": "order.created", "delivery_mode": 2 }
        }))
        .unwrap();

        assert_eq!(record.properties.timestamp, Some(42));
        assert_eq!(record.properties.kind.as_deref(), Some("order.created"));
        assert_eq!(record.properties.delivery_mode, Some(2));
    }

    #[test]
    fn test_record_rejects_garbage_timestamp() {
        let result: std::result::Result<QueueMessage, _> = serde_json::from_value(serde_json::json!({
            "payload": "x",
            "properties": { "timestamp": "yesterday" }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_base64_payload_decoding() {
        let record = QueueMessage {
            payload: "aGVsbG8=".to_string(),
            payload_encoding: PayloadEncoding::Base64,
            ..Default::default()
        };
        assert_eq!(record.decoded_payload().unwrap(), b"hello".to_vec());

        let broken = QueueMessage {
            payload: "not base64!".to_string(),
            payload_encoding: PayloadEncoding::Base64,
            ..Default::default()
        };
        assert_eq!(broken.decoded_payload().unwrap_err().kind(), ErrorKind::MalformedRecord);
    }

    #[test]
    fn test_binary_payload_is_carried_as_base64() {
        let record = QueueMessage::from_payload(&[0xff, 0x00, 0x10], MessageProperties::default());
        assert_eq!(record.payload_encoding, PayloadEncoding::Base64);
        assert_eq!(record.payload_bytes, 3);
        assert_eq!(record.decoded_payload().unwrap(), vec![0xff, 0x00, 0x10]);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(OperationError::connection("refused").kind(), ErrorKind::BrokerUnreachable);
        assert_eq!(OperationError::invalid_argument("empty").kind(), ErrorKind::InvalidArgument);

        let err = OperationError::unidentifiable("ctag-1");
        assert_eq!(err.kind(), ErrorKind::UnidentifiableMessage);
        assert_eq!(err.consumer_tag(), Some("ctag-1"));
    }

    #[test]
    fn test_move_incomplete_reports_cause() {
        let err = OperationError::move_incomplete("parking", OperationError::unidentifiable("ctag-2"));

        assert_eq!(err.kind(), ErrorKind::UnidentifiableMessage);
        assert_eq!(err.consumer_tag(), Some("ctag-2"));
        assert!(err.to_string().contains("copied to 'parking'"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_delete_result_serialization() {
        let json = serde_json::to_value(DeleteResult::not_found()).unwrap();
        assert_eq!(json, serde_json::json!({ "deleted": false }));
    }
}
