//! Operator endpoints.
//!
//! ```text
//! POST /v1/admin/dlq/replay  Move dead-lettered delivery jobs back onto the queue
//! ```

use actix_web::{HttpResponse, post, web};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::inbound::http::ApiResult;
use crate::inbound::http::state::HttpState;

/// Replay request body.
#[derive(Debug, Clone, Copy, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplayBody {
    /// Maximum number of dead-lettered jobs to move.
    pub limit: usize,
}

/// Replay response body.
#[derive(Debug, Clone, Copy, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    /// Number of jobs moved back onto the delivery queue.
    pub moved: usize,
}

/// Replay up to `limit` dead-lettered delivery jobs.
///
/// # Errors
///
/// - `400 Bad Request`: limit is zero or above the replay ceiling.
/// - `503 Service Unavailable`: queue unreachable.
#[utoipa::path(
    post,
    path = "/v1/admin/dlq/replay",
    request_body = ReplayBody,
    responses(
        (status = 200, description = "Jobs moved back onto the queue", body = ReplayResponse),
        (status = 400, description = "Invalid limit", body = crate::domain::Error),
        (status = 503, description = "Service unavailable", body = crate::domain::Error)
    ),
    tags = ["admin"],
    operation_id = "replayDeadLetters"
)]
#[post("/admin/dlq/replay")]
pub async fn replay_dead_letters(
    state: web::Data<HttpState>,
    payload: web::Json<ReplayBody>,
) -> ApiResult<HttpResponse> {
    let moved = state.replay.replay(payload.limit).await?;
    info!(moved, limit = payload.limit, "dead-letter replay requested");
    Ok(HttpResponse::Ok().json(ReplayResponse { moved }))
}
