//! Targeted single-message operations for RabbitMQ queues
//!
//! Queues only offer sequential consumption, so deleting one message by its
//! application ID means scanning: consume, inspect, requeue or ack.
//!
//! - `BrokerSession`: lazily opened connection, confirm-mode channels, teardown
//! - `identity`: message ID from the `message_id` property or the JSON payload
//! - `ScanSession`: per-call state machine deciding the fate of each delivery
//! - `MessageOperations`: delete, send and move built on the pieces above
//! - `AmqpConnector`: lapin-backed broker access
//! - `InMemoryBroker`: in-process broker with the same requeue semantics

pub mod amqp;
pub mod delivery;
pub mod identity;
pub mod memory;
pub mod operations;
pub mod scan;
pub mod session;

pub use amqp::AmqpConnector;
pub use delivery::Delivery;
pub use memory::{BrokerStats, InMemoryBroker, StoredMessage};
pub use operations::{MessageOperations, OperationSettings};
pub use scan::{ScanSession, ScanState, ScanStep};
pub use session::{BrokerChannel, BrokerConnection, BrokerSession, Connector};
