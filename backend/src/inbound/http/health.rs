//! Liveness endpoint.

use actix_web::{HttpResponse, get};
use serde::Serialize;

/// Liveness response body.
#[derive(Debug, Clone, Copy, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// Always `"ok"` while the process is serving requests.
    pub status: &'static str,
}

/// Report process liveness. Does not probe downstream dependencies.
#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process is alive", body = HealthResponse)),
    tags = ["health"],
    operation_id = "health"
)]
#[get("/healthz")]
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}
