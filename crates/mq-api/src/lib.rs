//! Queue Dashboard API
//!
//! HTTP API endpoints for:
//! - Deleting a single message by ID (path or record based)
//! - Sending a message with a chosen ID
//! - Moving a message between queues
//! - Health

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use mq_broker::{identity, MessageOperations};
use mq_common::{ErrorKind, OperationError, QueueMessage};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub operations: MessageOperations,
}

/// Simple health response for basic health check
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteMessageResponse {
    pub deleted: bool,
    pub message: Option<QueueMessage>,
    pub vhost: String,
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub sent: bool,
    pub message: QueueMessage,
    pub vhost: String,
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoveMessageResponse {
    pub sent: bool,
    pub deleted: bool,
    pub message: QueueMessage,
    pub vhost: String,
    pub queue: String,
    pub destination: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MoveQuery {
    pub destination: Option<String>,
}

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        // Copy already sits in the destination
        let details = match &err {
            OperationError::MoveIncomplete { destination, .. } => Some(json!({
                "sent": true,
                "deleted": false,
                "destination": destination,
            })),
            _ => None,
        };

        Self {
            error: err.kind(),
            message: err.to_string(),
            details,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        OperationError::malformed_record(rejection.body_text()).into()
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.error {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::MalformedRecord => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::UnidentifiableMessage => StatusCode::CONFLICT,
            ErrorKind::BrokerUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BrokerProtocol => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            warn!(error = ?self.error, message = %self.message, "Broker operation failed");
        }
        (self.status(), Json(self)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// JSON record body; rejections become `MALFORMED_RECORD`
type RecordBody = std::result::Result<Json<QueueMessage>, JsonRejection>;

/// Create the router with all dashboard endpoints
pub fn create_router(operations: MessageOperations) -> Router {
    let state = AppState { operations };

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/queues/:vhost/:queue/:message_id/delete", delete(delete_message))
        .route("/api/queues/:vhost/:queue/:message_id/send", post(send_message))
        .route("/api/queues/:vhost/:queue/:message_id/move", post(move_message))
        .route("/api/messages/:vhost/:queue/delete", delete(delete_record))
        .with_state(state)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn delete_message(
    State(state): State<AppState>,
    Path((vhost, queue, message_id)): Path<(String, String, String)>,
) -> ApiResult<DeleteMessageResponse> {
    info!(vhost = %vhost, queue = %queue, message_id = %message_id, "Delete requested");

    let result = state
        .operations
        .for_vhost(vhost.as_str())
        .delete_message(&queue, &message_id)
        .await?;

    Ok(Json(DeleteMessageResponse {
        deleted: result.deleted,
        message: result.message,
        vhost,
        queue,
    }))
}

/// Delete using the ID carried by a record the dashboard listed earlier
async fn delete_record(
    State(state): State<AppState>,
    Path((vhost, queue)): Path<(String, String)>,
    body: RecordBody,
) -> ApiResult<DeleteMessageResponse> {
    let Json(record) = body?;
    let message_id = identity::resolve_record(&record)
        .ok_or_else(|| OperationError::malformed_record("record carries no message id"))?;

    delete_message(State(state), Path((vhost, queue, message_id))).await
}

async fn send_message(
    State(state): State<AppState>,
    Path((vhost, queue, message_id)): Path<(String, String, String)>,
    body: RecordBody,
) -> ApiResult<SendMessageResponse> {
    let Json(message) = body?;
    info!(vhost = %vhost, queue = %queue, message_id = %message_id, "Send requested");

    let result = state
        .operations
        .for_vhost(vhost.as_str())
        .send_message(&queue, &message_id, &message)
        .await?;

    Ok(Json(SendMessageResponse {
        sent: result.success,
        message: stamped(message, &message_id),
        vhost,
        queue,
    }))
}

async fn move_message(
    State(state): State<AppState>,
    Path((vhost, queue, message_id)): Path<(String, String, String)>,
    Query(query): Query<MoveQuery>,
    body: RecordBody,
) -> ApiResult<MoveMessageResponse> {
    let Json(message) = body?;
    let destination = query
        .destination
        .filter(|d| !d.is_empty())
        .ok_or_else(|| OperationError::invalid_argument("Can't move message. Destination queue is required"))?;

    info!(
        vhost = %vhost,
        queue = %queue,
        destination = %destination,
        message_id = %message_id,
        "Move requested"
    );

    let result = state
        .operations
        .for_vhost(vhost.as_str())
        .move_message(&queue, &destination, &message_id, &message)
        .await?;

    Ok(Json(MoveMessageResponse {
        sent: result.sent,
        deleted: result.deleted,
        message: stamped(message, &message_id),
        vhost,
        queue,
        destination,
    }))
}

/// Record as it was published, with the requested ID applied
fn stamped(mut message: QueueMessage, message_id: &str) -> QueueMessage {
    message.properties = message.properties.with_message_id(message_id);
    message
}
