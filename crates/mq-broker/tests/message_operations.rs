//! Message Operations Tests
//!
//! Tests for:
//! - Targeted delete (found, absent, unidentifiable, repeated)
//! - Send and send-then-delete
//! - Move between queues
//! - Resource release after every outcome

use std::sync::Arc;
use std::time::Duration;

use mq_broker::{InMemoryBroker, MessageOperations, OperationSettings, StoredMessage};
use mq_common::{ErrorKind, MessageProperties, OperationError, QueueMessage};

const QUEUE: &str = "orders";

fn operations(broker: &InMemoryBroker) -> MessageOperations {
    MessageOperations::new(
        Arc::new(broker.clone()),
        OperationSettings {
            grace_period: Duration::from_millis(1),
            scan_idle_timeout: Duration::from_millis(50),
        },
    )
}

fn seeded(ids: &[&str]) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.enqueue(QUEUE, ids.iter().map(|id| StoredMessage::with_id(id)));
    broker
}

fn ids(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some(v.to_string())).collect()
}

fn assert_released(broker: &InMemoryBroker) {
    let stats = broker.stats();
    assert_eq!(stats.open_connections, 0, "connection leaked");
    assert_eq!(stats.open_channels, 0, "channel leaked");
    assert_eq!(stats.active_consumers, 0, "consumer leaked");
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_target_at_position_k() {
    let broker = seeded(&["m1", "m2", "m3", "m4", "m5"]);
    let ops = operations(&broker);

    let result = ops.delete_message(QUEUE, "m3").await.unwrap();

    assert!(result.deleted);
    let record = result.message.unwrap();
    assert_eq!(record.properties.message_id.as_deref(), Some("m3"));
    assert_eq!(record.payload, "payload of m3");

    let stats = broker.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.acked, 1);

    // Skipped messages went to the back, in the order they were requeued
    assert_eq!(broker.message_ids(QUEUE), ids(&["m4", "m5", "m1", "m2"]));
    assert_released(&broker);
}

#[tokio::test]
async fn test_delete_first_message() {
    let broker = seeded(&["m1", "m2"]);
    let ops = operations(&broker);

    let result = ops.delete_message(QUEUE, "m1").await.unwrap();

    assert!(result.deleted);
    assert_eq!(broker.stats().requeued, 0);
    assert_eq!(broker.message_ids(QUEUE), ids(&["m2"]));
}

#[tokio::test]
async fn test_delete_absent_target_terminates_without_losing_messages() {
    let broker = seeded(&["m1", "m2", "m3", "m4"]);
    let ops = operations(&broker);

    let result = ops.delete_message(QUEUE, "missing").await.unwrap();

    assert!(!result.deleted);
    assert!(result.message.is_none());

    let stats = broker.stats();
    assert_eq!(stats.requeued, 4, "every message examined exactly once");
    assert_eq!(stats.acked, 0);

    let mut remaining = broker.message_ids(QUEUE);
    remaining.sort();
    assert_eq!(remaining, ids(&["m1", "m2", "m3", "m4"]));
    assert_released(&broker);
}

#[tokio::test]
async fn test_delete_on_empty_queue_is_not_found() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);
    let ops = operations(&broker);

    let result = ops.delete_message(QUEUE, "anything").await.unwrap();

    assert!(!result.deleted);
    assert_released(&broker);
}

#[tokio::test]
async fn test_delete_twice_is_idempotent() {
    let broker = seeded(&["a", "b", "c"]);
    let ops = operations(&broker);

    assert!(ops.delete_message(QUEUE, "b").await.unwrap().deleted);
    assert!(!ops.delete_message(QUEUE, "b").await.unwrap().deleted);

    let mut remaining = broker.message_ids(QUEUE);
    remaining.sort();
    assert_eq!(remaining, ids(&["a", "c"]));
}

#[tokio::test]
async fn test_unidentifiable_message_fails_and_releases_resources() {
    for position in 0..3 {
        let broker = InMemoryBroker::new();
        let mut messages: Vec<StoredMessage> = ["a", "b"].iter().map(|id| StoredMessage::with_id(id)).collect();
        messages.insert(position, StoredMessage::new("no id here", MessageProperties::default()));
        broker.enqueue(QUEUE, messages);
        let ops = operations(&broker);

        let err = ops.delete_message(QUEUE, "zzz").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnidentifiableMessage, "position {}", position);
        assert!(err.consumer_tag().is_some());
        assert_eq!(broker.messages(QUEUE).len(), 3, "nothing lost at position {}", position);
        assert_released(&broker);
    }
}

#[tokio::test]
async fn test_payload_message_id_is_used() {
    let broker = InMemoryBroker::new();
    broker.enqueue(
        QUEUE,
        [
            StoredMessage::new(r#"{"message_id":"p-1"}"#, MessageProperties::default()),
            StoredMessage::new(r#"{"message_id":"p-2","total":10}"#, MessageProperties::default()),
        ],
    );
    let ops = operations(&broker);

    let result = ops.delete_message(QUEUE, "p-2").await.unwrap();

    assert!(result.deleted);
    assert_eq!(broker.messages(QUEUE).len(), 1);
}

#[tokio::test]
async fn test_empty_message_id_never_contacts_broker() {
    let broker = seeded(&["a"]);
    let ops = operations(&broker);

    let delete_err = ops.delete_message(QUEUE, "").await.unwrap_err();
    let send_err = ops
        .send_message(QUEUE, "", &QueueMessage::default())
        .await
        .unwrap_err();

    assert_eq!(delete_err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(send_err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(broker.stats().connections_opened, 0);
}

#[tokio::test]
async fn test_unreachable_broker_is_a_connection_error() {
    let broker = seeded(&["a"]);
    broker.set_reachable(false);
    let ops = operations(&broker);

    let err = ops.delete_message(QUEUE, "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokerUnreachable);
}

#[tokio::test]
async fn test_refused_channel_closes_connection() {
    let broker = seeded(&["a"]);
    broker.set_refuse_channels(true);
    let ops = operations(&broker);

    let delete_err = ops.delete_message(QUEUE, "a").await.unwrap_err();
    let send_err = ops.send_message(QUEUE, "b", &record("body")).await.unwrap_err();

    assert_eq!(delete_err.kind(), ErrorKind::BrokerProtocol);
    assert_eq!(send_err.kind(), ErrorKind::BrokerProtocol);

    let stats = broker.stats();
    assert_eq!(stats.connections_opened, 2);
    assert_eq!(stats.open_connections, 0, "connection leaked");
    assert_eq!(broker.message_ids(QUEUE), ids(&["a"]));
}

#[tokio::test]
async fn test_missing_queue_releases_channel() {
    let broker = InMemoryBroker::new();
    let ops = operations(&broker);

    let err = ops.delete_message("nope", "a").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BrokerProtocol);
    assert_released(&broker);
}

// ============================================================================
// Send & Move
// ============================================================================

fn record(payload: &str) -> QueueMessage {
    QueueMessage {
        payload: payload.to_string(),
        properties: MessageProperties {
            content_type: Some("application/json".to_string()),
            correlation_id: Some("corr-7".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_send_then_delete_round_trip() {
    let broker = seeded(&["x", "y"]);
    let ops = operations(&broker);

    let sent = ops.send_message(QUEUE, "abc", &record(r#"{"n":1}"#)).await.unwrap();
    assert!(sent.success);

    let stored = broker.messages(QUEUE);
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[2].properties.message_id.as_deref(), Some("abc"));
    assert_eq!(stored[2].properties.correlation_id.as_deref(), Some("corr-7"));

    let result = ops.delete_message(QUEUE, "abc").await.unwrap();
    assert!(result.deleted);

    let mut remaining = broker.message_ids(QUEUE);
    remaining.sort();
    assert_eq!(remaining, ids(&["x", "y"]));
    assert_released(&broker);
}

#[tokio::test]
async fn test_send_overrides_record_message_id() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE);
    let ops = operations(&broker);

    let mut message = record("body");
    message.properties.message_id = Some("old".to_string());
    ops.send_message(QUEUE, "new", &message).await.unwrap();

    assert_eq!(broker.message_ids(QUEUE), ids(&["new"]));
}

#[tokio::test]
async fn test_send_rejects_bad_base64_before_connecting() {
    let broker = InMemoryBroker::new();
    let ops = operations(&broker);

    let message = QueueMessage {
        payload: "***".to_string(),
        payload_encoding: mq_common::PayloadEncoding::Base64,
        ..Default::default()
    };
    let err = ops.send_message(QUEUE, "abc", &message).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    assert_eq!(broker.stats().connections_opened, 0);
}

#[tokio::test]
async fn test_move_copies_then_deletes() {
    let broker = seeded(&["a", "b"]);
    broker.declare_queue("archive");
    let ops = operations(&broker);

    let message = QueueMessage {
        payload: "payload of b".to_string(),
        ..Default::default()
    };
    let result = ops.move_message(QUEUE, "archive", "b", &message).await.unwrap();

    assert!(result.sent);
    assert!(result.deleted);
    assert_eq!(broker.message_ids("archive"), ids(&["b"]));
    assert_eq!(broker.message_ids(QUEUE), ids(&["a"]));
    assert_released(&broker);
}

#[tokio::test]
async fn test_move_reports_copy_when_delete_fails() {
    let broker = InMemoryBroker::new();
    broker.enqueue(
        QUEUE,
        [
            StoredMessage::new("no id here", MessageProperties::default()),
            StoredMessage::with_id("a"),
        ],
    );
    broker.declare_queue("archive");
    let ops = operations(&broker);

    let message = QueueMessage {
        payload: "payload of a".to_string(),
        ..Default::default()
    };
    let err = ops.move_message(QUEUE, "archive", "a", &message).await.unwrap_err();

    match &err {
        OperationError::MoveIncomplete { destination, cause } => {
            assert_eq!(destination, "archive");
            assert_eq!(cause.kind(), ErrorKind::UnidentifiableMessage);
        }
        other => panic!("expected MoveIncomplete, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::UnidentifiableMessage);
    assert_eq!(broker.message_ids("archive"), ids(&["a"]));
    assert_eq!(broker.messages(QUEUE).len(), 2);
    assert_released(&broker);
}

#[tokio::test]
async fn test_move_not_attempted_when_copy_fails() {
    let broker = seeded(&["a"]);
    broker.set_refuse_channels(true);
    let ops = operations(&broker);

    let message = QueueMessage {
        payload: "payload of a".to_string(),
        ..Default::default()
    };
    let err = ops.move_message(QUEUE, "archive", "a", &message).await.unwrap_err();

    assert!(!matches!(err, OperationError::MoveIncomplete { .. }));
    assert_eq!(broker.stats().connections_opened, 1, "delete must not run after a failed copy");
    assert_eq!(broker.message_ids(QUEUE), ids(&["a"]));
}

#[tokio::test]
async fn test_move_within_queue_sends_message_to_back() {
    let broker = seeded(&["a", "b", "c"]);
    let ops = operations(&broker);

    let message = QueueMessage {
        payload: "payload of a".to_string(),
        ..Default::default()
    };
    let result = ops.move_message(QUEUE, QUEUE, "a", &message).await.unwrap();

    assert!(result.deleted);
    let remaining = broker.message_ids(QUEUE);
    assert_eq!(remaining.len(), 3);
    assert_eq!(remaining.last().cloned().flatten().as_deref(), Some("a"));
}

#[tokio::test]
async fn test_operations_follow_requested_vhost() {
    let broker = seeded(&["a"]);
    let ops = operations(&broker).for_vhost("tenant-a");

    assert_eq!(ops.vhost(), "tenant-a");
    assert!(ops.delete_message(QUEUE, "a").await.unwrap().deleted);
    ops.send_message(QUEUE, "b", &record("body")).await.unwrap();

    assert_eq!(broker.connected_vhosts(), vec!["tenant-a", "tenant-a"]);
}

#[tokio::test]
async fn test_operations_default_to_connector_vhost() {
    let broker = seeded(&["a"]);
    let ops = operations(&broker);

    ops.delete_message(QUEUE, "a").await.unwrap();

    assert_eq!(broker.connected_vhosts(), vec!["/"]);
}
