use mq_common::{MessageProperties, QueueMessage};

/// One in-flight delivery handed to a consumer.
///
/// Ownership of the underlying message stays with this consumer until the
/// delivery is acked, nacked, or its channel closes.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl Delivery {
    /// Record shape returned to the dashboard
    pub fn to_record(&self) -> QueueMessage {
        QueueMessage {
            redelivered: self.redelivered,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            ..QueueMessage::from_payload(&self.payload, self.properties.clone())
        }
    }
}
