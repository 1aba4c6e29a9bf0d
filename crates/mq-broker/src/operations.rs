//! Targeted single-message operations
//!
//! - `delete_message`: scan a queue for one message ID and consume it
//! - `send_message`: publish a dashboard record to a queue via the default exchange
//! - `move_message`: copy a record to another queue, then delete the original
//!
//! Every call opens its own [`BrokerSession`] and [`ScanSession`], so concurrent
//! calls never share consumers or processed-ID sets. Two deletes on the same
//! queue are not coordinated and race for the same deliveries; a message one
//! scan requeues may reach the other scan later than its own pass.
//!
//! Loop detection assumes a requeued delivery returns after every message
//! the scan has not seen yet. RabbitMQ puts a requeued message back at its
//! original position, which only holds while the broker has dispatched the
//! whole queue to the consumer. On a queue too large for that (consumer
//! credit, memory alarms, flow control) a requeued message can come back
//! early and the scan ends with `deleted: false` before reaching the target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mq_common::{DeleteResult, MoveResult, OperationError, QueueMessage, Result, SendResult};
use tracing::{debug, info, warn};

use crate::scan::{ScanSession, ScanStep};
use crate::session::{BrokerChannel, BrokerSession, Connector};

/// Timing knobs for a single operation
#[derive(Debug, Clone)]
pub struct OperationSettings {
    /// Wait between consumer cancellation and channel close
    pub grace_period: Duration,
    /// Scan ends as drained if no delivery arrives within this window
    pub scan_idle_timeout: Duration,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(1000),
            scan_idle_timeout: Duration::from_millis(5000),
        }
    }
}

impl From<&mq_config::OperationsConfig> for OperationSettings {
    fn from(config: &mq_config::OperationsConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            scan_idle_timeout: config.scan_idle_timeout(),
        }
    }
}

/// Entry point for deleting, sending and moving single messages
#[derive(Clone)]
pub struct MessageOperations {
    connector: Arc<dyn Connector>,
    vhost: String,
    settings: OperationSettings,
}

impl MessageOperations {
    pub fn new(connector: Arc<dyn Connector>, settings: OperationSettings) -> Self {
        let vhost = connector.default_vhost().to_string();
        Self {
            connector,
            vhost,
            settings,
        }
    }

    /// Same operations against another virtual host
    pub fn for_vhost(&self, vhost: impl Into<String>) -> Self {
        Self {
            connector: self.connector.clone(),
            vhost: vhost.into(),
            settings: self.settings.clone(),
        }
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Fresh session and channel; the connection is closed again if no channel can be opened
    async fn open_channel(&self) -> Result<(BrokerSession, Box<dyn BrokerChannel>)> {
        let session = BrokerSession::new(self.connector.clone(), self.vhost.clone(), self.settings.grace_period);
        let created = session.create_channel().await;
        match created {
            Ok(channel) => Ok((session, channel)),
            Err(e) => {
                warn!(vhost = %self.vhost, error = %e, "Could not open channel");
                session.close_connection().await;
                Err(e)
            }
        }
    }

    /// Remove the message with `message_id` from `queue`.
    ///
    /// An absent target is `deleted: false`, not an error.
    pub async fn delete_message(&self, queue: &str, message_id: &str) -> Result<DeleteResult> {
        let mut scan = ScanSession::new(message_id)?;
        let started = Instant::now();

        info!(queue = %queue, vhost = %self.vhost, target_message_id = %message_id, "Attempting to delete message");

        let (session, mut channel) = self.open_channel().await?;

        let consumer_tag = match channel.consume(queue).await {
            Ok(tag) => tag,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Could not start consumer");
                session.teardown(channel, None).await;
                return Err(e);
            }
        };
        scan.attach(consumer_tag);

        let outcome = self.run_scan(&mut scan, channel.as_mut(), queue).await;

        scan.stop();
        session.teardown(channel, scan.consumer_tag()).await;

        record_scan(&scan, &outcome, started.elapsed());
        scan.clear();
        outcome
    }

    async fn run_scan(
        &self,
        scan: &mut ScanSession,
        channel: &mut dyn BrokerChannel,
        queue: &str,
    ) -> Result<DeleteResult> {
        let target = scan.target_id().to_string();

        loop {
            let Some(delivery) = channel.next_delivery(self.settings.scan_idle_timeout).await? else {
                scan.drained();
                info!(queue = %queue, target_message_id = %target, "No more deliveries, message not found");
                return Ok(DeleteResult::not_found());
            };

            match scan.observe(&delivery) {
                ScanStep::Ignore => {
                    debug!(target_message_id = %target, "Consumer stopped already, skipping delivery");
                }
                ScanStep::Requeue { message_id } => {
                    debug!(
                        target_message_id = %target,
                        message_id = %message_id,
                        "Message does not match target, requeueing"
                    );
                    metrics::counter!("mq_scan_requeued_total").increment(1);
                    channel.nack_requeue(delivery.delivery_tag).await?;
                }
                ScanStep::Consume { message_id } => {
                    info!(
                        queue = %queue,
                        target_message_id = %target,
                        message_id = %message_id,
                        examined = scan.processed_count(),
                        "Target message found, acknowledging"
                    );
                    channel.ack(delivery.delivery_tag).await?;
                    return Ok(DeleteResult::deleted(delivery.to_record()));
                }
                ScanStep::LoopDetected { message_id } => {
                    info!(
                        queue = %queue,
                        target_message_id = %target,
                        message_id = %message_id,
                        examined = scan.processed_count(),
                        "Detected loop, message already processed; stopping consumer"
                    );
                    return Ok(DeleteResult::not_found());
                }
                ScanStep::Unidentified => {
                    warn!(
                        queue = %queue,
                        target_message_id = %target,
                        delivery_tag = delivery.delivery_tag,
                        "Message has no message id; aborting scan"
                    );
                    return Err(scan.unidentified_error(&delivery));
                }
            }
        }
    }

    /// Publish `message` to `queue` through the default exchange, stamped with `message_id`
    pub async fn send_message(&self, queue: &str, message_id: &str, message: &QueueMessage) -> Result<SendResult> {
        if message_id.is_empty() {
            return Err(OperationError::invalid_argument(
                "Can't send message. Message id is required",
            ));
        }

        let payload = message.decoded_payload()?;
        let properties = message.properties.with_message_id(message_id);

        let (session, mut channel) = self.open_channel().await?;
        let published = channel.publish(queue, &payload, &properties).await;
        session.teardown(channel, None).await;

        let success = published?;
        metrics::counter!("mq_messages_sent_total", "accepted" => success.to_string()).increment(1);
        info!(queue = %queue, vhost = %self.vhost, message_id = %message_id, success = success, "Message sent");

        Ok(SendResult { success })
    }

    /// Copy `message` into `destination`, then remove `message_id` from `source`.
    ///
    /// The delete only runs once the copy was accepted, so a failed copy never loses the original.
    /// A failed delete after a successful copy is [`OperationError::MoveIncomplete`], so the
    /// caller knows the destination already holds the copy.
    /// With `source == destination` the message ends up at the back of the queue.
    pub async fn move_message(
        &self,
        source: &str,
        destination: &str,
        message_id: &str,
        message: &QueueMessage,
    ) -> Result<MoveResult> {
        let sent = self.send_message(destination, message_id, message).await?;
        if !sent.success {
            warn!(destination = %destination, message_id = %message_id, "Copy was not accepted, keeping original");
            return Ok(MoveResult {
                sent: false,
                deleted: false,
            });
        }

        match self.delete_message(source, message_id).await {
            Ok(deleted) => Ok(MoveResult {
                sent: true,
                deleted: deleted.deleted,
            }),
            Err(e) => {
                warn!(
                    source = %source,
                    destination = %destination,
                    message_id = %message_id,
                    error = %e,
                    "Message copied but not removed from source"
                );
                Err(OperationError::move_incomplete(destination, e))
            }
        }
    }
}

fn record_scan(scan: &ScanSession, outcome: &Result<DeleteResult>, elapsed: Duration) {
    let state = match outcome {
        Err(_) if !scan.state().is_terminal() => "error",
        _ => scan.state().as_str(),
    };
    metrics::counter!("mq_scan_completed_total", "state" => state).increment(1);
    metrics::histogram!("mq_scan_duration_seconds").record(elapsed.as_secs_f64());
    debug!(state = state, examined = scan.processed_count(), elapsed_ms = elapsed.as_millis() as u64, "Scan finished");
}
