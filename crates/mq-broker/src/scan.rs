//! Scan session - per-call state machine for locating one message by ID
//!
//! A queue only offers sequential consumption, so locating a message means
//! pulling deliveries one at a time:
//! - non-matching deliveries are requeued to the back of the queue
//! - the target is acknowledged exactly once
//! - seeing an ID twice means the whole queue has cycled without a match
//! - a delivery without a resolvable ID aborts the scan
//!
//! The transition function is pure with respect to the broker: it only
//! decides, the caller performs the ack/nack.

use std::collections::HashSet;

use mq_common::{OperationError, Result};

use crate::delivery::Delivery;
use crate::identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Scanning,
    /// Target located and consumed
    Found,
    /// A previously examined message came back: target is not in the queue
    LoopDetected,
    /// A delivery had no resolvable ID
    InvalidMessage,
    /// No delivery arrived within the idle window
    Drained,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanState::Scanning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Scanning => "scanning",
            ScanState::Found => "found",
            ScanState::LoopDetected => "loop_detected",
            ScanState::InvalidMessage => "invalid_message",
            ScanState::Drained => "drained",
        }
    }
}

/// What to do with the delivery just observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    /// Session already stopped; leave the delivery untouched
    Ignore,
    /// Not the target; nack with requeue and keep consuming
    Requeue { message_id: String },
    /// The target; ack it and stop
    Consume { message_id: String },
    /// Seen before; stop without touching the delivery
    LoopDetected { message_id: String },
    /// No ID; stop and fail, leaving the delivery unacknowledged
    Unidentified,
}

#[derive(Debug)]
pub struct ScanSession {
    target_id: String,
    consumer_tag: Option<String>,
    processed_ids: HashSet<String>,
    stopped: bool,
    state: ScanState,
}

impl ScanSession {
    pub fn new(target_id: impl Into<String>) -> Result<Self> {
        let target_id = target_id.into();
        if target_id.is_empty() {
            return Err(OperationError::invalid_argument("message id is required"));
        }

        Ok(Self {
            target_id,
            consumer_tag: None,
            processed_ids: HashSet::new(),
            stopped: false,
            state: ScanState::Scanning,
        })
    }

    /// Record the consumer feeding this session
    pub fn attach(&mut self, consumer_tag: impl Into<String>) {
        self.consumer_tag = Some(consumer_tag.into());
    }

    /// Apply one delivery to the state machine
    pub fn observe(&mut self, delivery: &Delivery) -> ScanStep {
        if self.stopped {
            return ScanStep::Ignore;
        }

        let Some(message_id) = identity::resolve_delivery(delivery) else {
            self.finish(ScanState::InvalidMessage);
            return ScanStep::Unidentified;
        };

        if self.processed_ids.contains(&message_id) {
            self.finish(ScanState::LoopDetected);
            return ScanStep::LoopDetected { message_id };
        }

        self.processed_ids.insert(message_id.clone());

        if message_id == self.target_id {
            self.finish(ScanState::Found);
            ScanStep::Consume { message_id }
        } else {
            ScanStep::Requeue { message_id }
        }
    }

    /// Idle window elapsed with no delivery
    pub fn drained(&mut self) {
        if !self.stopped {
            self.finish(ScanState::Drained);
        }
    }

    /// Stop processing further deliveries without changing the state
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Drop per-scan bookkeeping once the session is torn down
    pub fn clear(&mut self) {
        self.processed_ids.clear();
        self.consumer_tag = None;
    }

    /// Error for an unidentifiable delivery, carrying the consumer to cancel
    pub fn unidentified_error(&self, delivery: &Delivery) -> OperationError {
        let consumer_tag = self
            .consumer_tag
            .clone()
            .unwrap_or_else(|| delivery.consumer_tag.clone());
        OperationError::unidentifiable(consumer_tag)
    }

    fn finish(&mut self, state: ScanState) {
        self.state = state;
        self.stopped = true;
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn processed_count(&self) -> usize {
        self.processed_ids.len()
    }
}
