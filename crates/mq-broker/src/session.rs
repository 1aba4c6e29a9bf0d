//! Broker session - one lazily opened connection and the channels made from it
//!
//! The traits here are the seam between the operations and a concrete broker:
//! `amqp` talks to RabbitMQ through lapin, `memory` keeps queues in process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mq_common::{MessageProperties, Result};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::delivery::Delivery;

/// Opens connections to a virtual host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, vhost: &str) -> Result<Box<dyn BrokerConnection>>;

    /// Virtual host used when the caller does not name one
    fn default_vhost(&self) -> &str;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// New channel with publisher confirms enabled
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send {
    /// Start a manually acknowledged consumer on `queue`, returning its tag
    async fn consume(&mut self, queue: &str) -> Result<String>;

    /// Next delivery for the active consumer, `None` if nothing arrives within `idle`
    async fn next_delivery(&mut self, idle: Duration) -> Result<Option<Delivery>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    async fn nack_requeue(&mut self, delivery_tag: u64) -> Result<()>;

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()>;

    /// Publish through the default exchange; `true` if the broker accepted it
    async fn publish(&mut self, queue: &str, payload: &[u8], properties: &MessageProperties) -> Result<bool>;

    async fn close(&mut self) -> Result<()>;
}

/// Connection scope of a single operation
pub struct BrokerSession {
    connector: Arc<dyn Connector>,
    vhost: String,
    connection: OnceCell<Box<dyn BrokerConnection>>,
    grace_period: Duration,
}

impl BrokerSession {
    pub fn new(connector: Arc<dyn Connector>, vhost: impl Into<String>, grace_period: Duration) -> Self {
        Self {
            connector,
            vhost: vhost.into(),
            connection: OnceCell::new(),
            grace_period,
        }
    }

    /// Fresh channel on the memoized connection, connecting on first use
    pub async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!(vhost = %self.vhost, "Opening broker connection");
                self.connector.connect(&self.vhost).await
            })
            .await?;
        connection.create_channel().await
    }

    /// Release everything this session opened.
    ///
    /// With a consumer tag the consumer is cancelled first and the grace period
    /// lets deliveries already on the wire arrive before the channel goes away.
    /// Failures are logged and never returned. Taking `self` makes this run once.
    pub async fn teardown(self, mut channel: Box<dyn BrokerChannel>, consumer_tag: Option<&str>) {
        if let Some(consumer_tag) = consumer_tag {
            if let Err(e) = channel.cancel(consumer_tag).await {
                warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel consumer");
            }
            tokio::time::sleep(self.grace_period).await;
        }

        if let Err(e) = channel.close().await {
            warn!(vhost = %self.vhost, error = %e, "Failed to close channel");
        }

        self.close_connection().await;
    }

    /// Close the memoized connection, if one was opened. Used directly when no
    /// channel could be created.
    pub async fn close_connection(self) {
        if let Some(connection) = self.connection.into_inner() {
            if let Err(e) = connection.close().await {
                warn!(vhost = %self.vhost, error = %e, "Failed to close connection");
            }
        }

        debug!(vhost = %self.vhost, "Broker session torn down");
    }
}
