//! Message API handlers.
//!
//! ```text
//! POST /v1/messages       Publish a notification (Bearer API key)
//! GET  /v1/messages/{id}  Fetch a message with its delivery summary
//! ```
//!
//! A `202 Accepted` certifies durable storage only; delivery happens
//! asynchronously. A duplicate submission (same tenant and dedupe key)
//! returns `200 OK` with the original message id.

use actix_web::http::header::{AUTHORIZATION, HeaderMap};
use actix_web::{HttpRequest, HttpResponse, get, post, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::delivery::DeliveryStatus;
use crate::domain::ingestion::{PublishOutcome, PublishRequest};
use crate::domain::message::{Message, MessageId};
use crate::domain::Error;
use crate::inbound::http::ApiResult;
use crate::inbound::http::state::HttpState;

const BEARER_PREFIX: &str = "Bearer ";

/// Publish request body.
#[derive(Debug, Clone, Deserialize, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishBody {
    /// Topic name within the publisher's tenant.
    pub topic: String,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Optional structured payload forwarded verbatim to clients.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Time-to-live in seconds; defaulted and clamped server-side.
    #[serde(default)]
    pub ttl_sec: Option<i64>,
    /// Optional per-tenant idempotency key.
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

/// Publish response body.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    /// Id of the stored (or pre-existing) message.
    pub message_id: Uuid,
    /// True when an earlier submission with the same dedupe key was reused.
    pub deduplicated: bool,
    /// False when the fan-out enqueue step failed; the message is stored
    /// either way.
    pub enqueued: bool,
}

impl From<PublishOutcome> for PublishResponse {
    fn from(outcome: PublishOutcome) -> Self {
        Self {
            message_id: *outcome.message_id.as_uuid(),
            deduplicated: outcome.deduplicated,
            enqueued: outcome.enqueued,
        }
    }
}

/// Per-status delivery tallies for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryCounts {
    /// Deliveries still awaiting an attempt.
    pub queued: u64,
    /// Deliveries accepted by their transport.
    pub sent: u64,
    /// Deliveries whose last attempt failed.
    pub failed: u64,
    /// Deliveries abandoned because the message TTL elapsed.
    pub expired: u64,
}

impl DeliveryCounts {
    fn from_rows(rows: &[(DeliveryStatus, u64)]) -> Self {
        let mut counts = Self::default();
        for (status, count) in rows {
            match status {
                DeliveryStatus::Queued => counts.queued += count,
                DeliveryStatus::Sent => counts.sent += count,
                DeliveryStatus::Failed => counts.failed += count,
                DeliveryStatus::Expired => counts.expired += count,
            }
        }
        counts
    }
}

/// Message detail response body.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    /// Message identifier.
    pub id: Uuid,
    /// Topic the message was published against.
    pub topic_id: Uuid,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Requested time-to-live in seconds.
    pub ttl_sec: i64,
    /// Hard delivery deadline.
    pub expires_at: DateTime<Utc>,
    /// Optional per-tenant idempotency key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Lifecycle status (`queued`, `done`, or `expired`).
    pub status: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Per-status delivery tallies.
    pub deliveries: DeliveryCounts,
}

impl MessageDetail {
    fn from_message(message: Message, counts: DeliveryCounts) -> Self {
        Self {
            id: *message.id.as_uuid(),
            topic_id: *message.topic_id.as_uuid(),
            title: message.title,
            body: message.body,
            payload: message.payload,
            ttl_sec: message.ttl_sec,
            expires_at: message.expires_at,
            dedupe_key: message.dedupe_key.map(|key| key.as_str().to_owned()),
            status: message.status.as_str().to_owned(),
            created_at: message.created_at,
            deliveries: counts,
        }
    }
}

/// Extract the API key from an `Authorization: Bearer` header.
fn extract_api_key(headers: &HeaderMap) -> ApiResult<&str> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::unauthorized("missing Authorization header"))?;
    let value = header
        .to_str()
        .map_err(|_| Error::unauthorized("malformed Authorization header"))?;
    let key = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or_else(|| Error::unauthorized("Authorization header must use the Bearer scheme"))?
        .trim();
    if key.is_empty() {
        return Err(Error::unauthorized("missing API key"));
    }
    Ok(key)
}

/// Publish a notification to a topic.
///
/// # Errors
///
/// - `400 Bad Request`: validation failure (blank topic, title, or body,
///   bad TTL, bad dedupe key).
/// - `401 Unauthorized`: missing or unknown API key.
/// - `503 Service Unavailable`: message store unreachable.
#[utoipa::path(
    post,
    path = "/v1/messages",
    request_body = PublishBody,
    responses(
        (status = 202, description = "Message stored; delivery is asynchronous", body = PublishResponse),
        (status = 200, description = "Duplicate submission resolved by dedupe key", body = PublishResponse),
        (status = 400, description = "Invalid request", body = crate::domain::Error),
        (status = 401, description = "Unauthorised", body = crate::domain::Error),
        (status = 503, description = "Service unavailable", body = crate::domain::Error)
    ),
    tags = ["messages"],
    operation_id = "publishMessage"
)]
#[post("/messages")]
pub async fn publish(
    state: web::Data<HttpState>,
    request: HttpRequest,
    payload: web::Json<PublishBody>,
) -> ApiResult<HttpResponse> {
    let api_key = extract_api_key(request.headers())?;
    let publisher = state.ingestion.authenticate(api_key).await?;

    let body = payload.into_inner();
    let outcome = state
        .ingestion
        .publish(
            publisher,
            PublishRequest {
                topic: body.topic,
                title: body.title,
                body: body.body,
                payload: body.payload,
                ttl_sec: body.ttl_sec,
                dedupe_key: body.dedupe_key,
            },
        )
        .await?;

    let response = if outcome.deduplicated {
        HttpResponse::Ok().json(PublishResponse::from(outcome))
    } else {
        HttpResponse::Accepted().json(PublishResponse::from(outcome))
    };
    Ok(response)
}

/// Fetch one message with its per-transport delivery summary.
///
/// # Errors
///
/// - `404 Not Found`: no message with this id.
/// - `503 Service Unavailable`: message store unreachable.
#[utoipa::path(
    get,
    path = "/v1/messages/{id}",
    responses(
        (status = 200, description = "Message detail", body = MessageDetail),
        (status = 404, description = "Unknown message id", body = crate::domain::Error),
        (status = 503, description = "Service unavailable", body = crate::domain::Error)
    ),
    params(("id" = Uuid, Path, description = "Message identifier")),
    tags = ["messages"],
    operation_id = "getMessage"
)]
#[get("/messages/{id}")]
pub async fn get_message(
    state: web::Data<HttpState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let id = MessageId::from_uuid(path.into_inner());

    let message = state
        .messages
        .find_message(id)
        .await
        .map_err(|error| Error::service_unavailable(error.to_string()))?
        .ok_or_else(|| Error::not_found("no such message"))?;

    let rows = state
        .deliveries
        .status_counts(id)
        .await
        .map_err(|error| Error::service_unavailable(error.to_string()))?;

    Ok(HttpResponse::Ok().json(MessageDetail::from_message(
        message,
        DeliveryCounts::from_rows(&rows),
    )))
}
