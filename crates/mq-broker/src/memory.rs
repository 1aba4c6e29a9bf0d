//! In-process broker
//!
//! Mimics the parts of AMQP the operations rely on:
//! - consumers pull from the head of a queue
//! - `nack` with requeue appends the message to the back of the queue
//! - closing a channel returns its unacknowledged deliveries to the head, in delivery order
//! - settling an unknown delivery tag is a protocol error
//!
//! Counters in [`BrokerStats`] expose resource usage so callers can check
//! that every connection, channel and consumer was released.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mq_common::{MessageProperties, OperationError, Result};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::delivery::Delivery;
use crate::session::{BrokerChannel, BrokerConnection, Connector};

/// A message at rest in an in-memory queue
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn new(payload: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            payload: payload.into(),
            properties,
            redelivered: false,
        }
    }

    /// Message carrying `message_id` as a property
    pub fn with_id(message_id: &str) -> Self {
        Self::new(
            format!("payload of {}", message_id),
            MessageProperties {
                message_id: Some(message_id.to_string()),
                ..Default::default()
            },
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: usize,
    pub open_connections: usize,
    pub open_channels: usize,
    pub active_consumers: usize,
    pub acked: usize,
    pub requeued: usize,
    pub published: usize,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    refuse_channels: bool,
    connected_vhosts: Vec<String>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    consumers: HashSet<String>,
    stats: BrokerStats,
}

/// Shared handle to an in-memory broker; clones see the same queues
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    default_vhost: String,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                ..Default::default()
            })),
            default_vhost: "/".to_string(),
        }
    }

    pub fn declare_queue(&self, queue: &str) {
        self.state.lock().queues.entry(queue.to_string()).or_default();
    }

    /// Append messages to a queue, declaring it if needed
    pub fn enqueue(&self, queue: &str, messages: impl IntoIterator<Item = StoredMessage>) {
        let mut state = self.state.lock();
        state.queues.entry(queue.to_string()).or_default().extend(messages);
    }

    /// Snapshot of the ready messages in queue order
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Property message IDs of the ready messages in queue order
    pub fn message_ids(&self, queue: &str) -> Vec<Option<String>> {
        self.messages(queue)
            .into_iter()
            .map(|m| m.properties.message_id)
            .collect()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Accept connections but fail every channel they try to open
    pub fn set_refuse_channels(&self, refuse: bool) {
        self.state.lock().refuse_channels = refuse;
    }

    /// Virtual hosts of every successful connect, in order
    pub fn connected_vhosts(&self) -> Vec<String> {
        self.state.lock().connected_vhosts.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats.clone()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, vhost: &str) -> Result<Box<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(OperationError::connection(format!(
                "connect ECONNREFUSED (vhost {})",
                vhost
            )));
        }
        state.stats.connections_opened += 1;
        state.stats.open_connections += 1;
        state.connected_vhosts.push(vhost.to_string());

        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            closed: Mutex::new(false),
        }))
    }

    fn default_vhost(&self) -> &str {
        &self.default_vhost
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    closed: Mutex<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if *self.closed.lock() {
            return Err(OperationError::connection("connection is closed"));
        }
        let mut state = self.state.lock();
        if state.refuse_channels {
            return Err(OperationError::protocol("PRECONDITION_FAILED - confirm.select refused"));
        }
        state.stats.open_channels += 1;
        drop(state);

        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            queue: None,
            consumer_tag: None,
            unacked: BTreeMap::new(),
            next_tag: 0,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Err(OperationError::protocol("connection already closed"));
        }
        *closed = true;
        self.state.lock().stats.open_connections -= 1;
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    queue: Option<String>,
    consumer_tag: Option<String>,
    unacked: BTreeMap<u64, StoredMessage>,
    next_tag: u64,
    closed: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(OperationError::protocol("channel is closed"));
        }
        Ok(())
    }

    fn queue_name(&self) -> Result<&str> {
        self.queue
            .as_deref()
            .ok_or_else(|| OperationError::protocol("no consumer on this channel"))
    }

    fn settle(&mut self, delivery_tag: u64) -> Result<StoredMessage> {
        self.ensure_open()?;
        self.unacked.remove(&delivery_tag).ok_or_else(|| {
            OperationError::protocol(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
        })
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn consume(&mut self, queue: &str) -> Result<String> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(OperationError::protocol(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let consumer_tag = format!("amq.ctag-{}", Uuid::new_v4());
        state.consumers.insert(consumer_tag.clone());
        state.stats.active_consumers += 1;

        self.queue = Some(queue.to_string());
        self.consumer_tag = Some(consumer_tag.clone());
        Ok(consumer_tag)
    }

    async fn next_delivery(&mut self, _idle: Duration) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        let queue = self.queue_name()?.to_string();
        let consumer_tag = self
            .consumer_tag
            .clone()
            .ok_or_else(|| OperationError::protocol("consumer was cancelled"))?;

        let message = {
            let mut state = self.state.lock();
            state.queues.get_mut(&queue).and_then(|q| q.pop_front())
        };

        // An empty queue never dispatches; report it as an idle window
        let Some(message) = message else {
            return Ok(None);
        };

        self.next_tag += 1;
        let delivery_tag = self.next_tag;
        self.unacked.insert(delivery_tag, message.clone());

        Ok(Some(Delivery {
            delivery_tag,
            consumer_tag,
            exchange: String::new(),
            routing_key: queue,
            redelivered: message.redelivered,
            payload: message.payload,
            properties: message.properties,
        }))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag)?;
        self.state.lock().stats.acked += 1;
        Ok(())
    }

    async fn nack_requeue(&mut self, delivery_tag: u64) -> Result<()> {
        let mut message = self.settle(delivery_tag)?;
        message.redelivered = true;

        let queue = self.queue_name()?.to_string();
        let mut state = self.state.lock();
        state.queues.entry(queue).or_default().push_back(message);
        state.stats.requeued += 1;
        Ok(())
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.consumers.remove(consumer_tag) {
            return Err(OperationError::protocol(format!("unknown consumer tag {}", consumer_tag)));
        }
        state.stats.active_consumers -= 1;
        if self.consumer_tag.as_deref() == Some(consumer_tag) {
            self.consumer_tag = None;
        }
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8], properties: &MessageProperties) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        // The default exchange drops messages for unknown queues without failing the publish
        if let Some(q) = state.queues.get_mut(queue) {
            q.push_back(StoredMessage::new(payload.to_vec(), properties.clone()));
        }
        state.stats.published += 1;
        Ok(true)
    }

    async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;

        let mut state = self.state.lock();
        if let Some(consumer_tag) = self.consumer_tag.take() {
            if state.consumers.remove(&consumer_tag) {
                state.stats.active_consumers -= 1;
            }
        }

        let unacked = std::mem::take(&mut self.unacked);
        if let Some(queue) = self.queue.as_ref() {
            let q = state.queues.entry(queue.clone()).or_default();
            for (_, mut message) in unacked.into_iter().rev() {
                message.redelivered = true;
                q.push_front(message);
            }
        }

        state.stats.open_channels -= 1;
        Ok(())
    }
}
