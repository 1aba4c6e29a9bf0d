//! RabbitMQ connector built on lapin

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use mq_common::{MessageProperties, OperationError, Result};
use mq_config::BrokerConfig;
use serde_json::{Map, Number, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::delivery::Delivery;
use crate::session::{BrokerChannel, BrokerConnection, Connector};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ using the dashboard's broker settings
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, vhost: &str) -> Result<Box<dyn BrokerConnection>> {
        let uri = self.config.amqp_uri_for_vhost(vhost);
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                OperationError::connection(format!(
                    "Failed to connect to {}:{} (vhost {}): {}",
                    self.config.host, self.config.port, vhost, e
                ))
            })?;

        info!(host = %self.config.host, port = self.config.port, vhost = %vhost, "Connected to RabbitMQ");
        Ok(Box::new(AmqpConnection { connection }))
    }

    fn default_vhost(&self) -> &str {
        &self.config.vhost
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| OperationError::connection(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to enable publisher confirms: {}", e)))?;

        Ok(Box::new(AmqpChannel {
            channel,
            consumer: None,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
    consumer: Option<Consumer>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn consume(&mut self, queue: &str) -> Result<String> {
        let consumer_tag = format!("mq-dashboard-{}", Uuid::new_v4());

        // No basic.qos, so the broker dispatches as much of the queue as it can
        // before a requeued delivery reappears at its original position.
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to consume from '{}': {}", queue, e)))?;

        let tag = consumer.tag().as_str().to_string();
        debug!(queue = %queue, consumer_tag = %tag, "Consumer started");
        self.consumer = Some(consumer);
        Ok(tag)
    }

    async fn next_delivery(&mut self, idle: Duration) -> Result<Option<Delivery>> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| OperationError::protocol("no consumer on this channel"))?;
        let consumer_tag = consumer.tag().as_str().to_string();

        match tokio::time::timeout(idle, consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(OperationError::ConsumerCancelled { consumer_tag }),
            Ok(Some(Err(e))) => Err(OperationError::protocol(format!("Delivery failed: {}", e))),
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                consumer_tag,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                properties: properties_from_amqp(&delivery.properties),
                payload: delivery.data,
            })),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to ack delivery {}: {}", delivery_tag, e)))
    }

    async fn nack_requeue(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to nack delivery {}: {}", delivery_tag, e)))
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to cancel consumer {}: {}", consumer_tag, e)))
    }

    async fn publish(&mut self, queue: &str, payload: &[u8], properties: &MessageProperties) -> Result<bool> {
        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties_to_amqp(properties))
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to publish to '{}': {}", queue, e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| OperationError::protocol(format!("Publish to '{}' was not confirmed: {}", queue, e)))?;

        Ok(!confirmation.is_nack())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer = None;
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| OperationError::protocol(format!("Failed to close channel: {}", e)))
    }
}

// ============================================================================
// Property Mapping
// ============================================================================

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

pub(crate) fn properties_from_amqp(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short(properties.content_type()),
        content_encoding: short(properties.content_encoding()),
        correlation_id: short(properties.correlation_id()),
        expiration: short(properties.expiration()),
        message_id: short(properties.message_id()),
        timestamp: *properties.timestamp(),
        headers: properties
            .headers()
            .as_ref()
            .map(table_to_json)
            .unwrap_or_default(),
        kind: short(properties.kind()),
        delivery_mode: *properties.delivery_mode(),
        priority: *properties.priority(),
        reply_to: short(properties.reply_to()),
        user_id: short(properties.user_id()),
        app_id: short(properties.app_id()),
        cluster_id: short(properties.cluster_id()),
    }
}

pub(crate) fn properties_to_amqp(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();

    if let Some(v) = &properties.message_id {
        amqp = amqp.with_message_id(v.as_str().into());
    }
    if let Some(v) = &properties.user_id {
        amqp = amqp.with_user_id(v.as_str().into());
    }
    if let Some(v) = &properties.expiration {
        amqp = amqp.with_expiration(v.as_str().into());
    }
    if !properties.headers.is_empty() {
        amqp = amqp.with_headers(json_to_table(&properties.headers));
    }
    if let Some(v) = properties.timestamp {
        amqp = amqp.with_timestamp(v);
    }
    if let Some(v) = &properties.content_type {
        amqp = amqp.with_content_type(v.as_str().into());
    }
    if let Some(v) = &properties.content_encoding {
        amqp = amqp.with_content_encoding(v.as_str().into());
    }
    if let Some(v) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(v.as_str().into());
    }
    if let Some(v) = &properties.kind {
        amqp = amqp.with_kind(v.as_str().into());
    }
    if let Some(v) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(v);
    }
    if let Some(v) = properties.priority {
        amqp = amqp.with_priority(v);
    }
    if let Some(v) = &properties.reply_to {
        amqp = amqp.with_reply_to(v.as_str().into());
    }
    if let Some(v) = &properties.app_id {
        amqp = amqp.with_app_id(v.as_str().into());
    }

    amqp
}

fn table_to_json(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Number::from_f64(f64::from(*v)).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::Double(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::ShortString(v) => Value::String(v.as_str().to_string()),
        AMQPValue::LongString(v) => Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::FieldArray(v) => Value::Array(v.as_slice().iter().map(amqp_to_json).collect()),
        AMQPValue::FieldTable(v) => Value::Object(table_to_json(v)),
        _ => Value::Null,
    }
}

fn json_to_table(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.clone()), json_to_amqp(value));
    }
    table
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(json_to_amqp).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(json_to_table(map)),
    }
}
