//! WebSocket inbound adapter feeding the live-connection registry.
//!
//! Responsibilities:
//! - validate upgrade requests (subscriber identity)
//! - register the connection with the registry for the socket's lifetime
//! - keep WebSocket-specific concerns at the edge of the system

use std::sync::Arc;

use actix_web::web::{self, Payload};
use actix_web::{HttpRequest, HttpResponse, get, rt};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::domain::message::UserId;
use crate::registry::SocketRegistry;

mod session;

/// Dependency bundle for the WebSocket entry point.
#[derive(Clone)]
pub struct WsState {
    /// Registry tracking live connections per subscriber.
    pub registry: Arc<SocketRegistry>,
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    user_id: Uuid,
}

/// Handle WebSocket upgrade for the `/v1/socket` endpoint.
///
/// The subscriber identifies itself with a `user_id` query parameter;
/// malformed or missing ids fail the upgrade with `400 Bad Request` before
/// any registry state is touched.
#[get("/v1/socket")]
pub async fn socket_entry(
    state: web::Data<WsState>,
    query: web::Query<SocketQuery>,
    req: HttpRequest,
    stream: Payload,
) -> actix_web::Result<HttpResponse> {
    let user_id = UserId::from_uuid(query.user_id);

    let (response, session, message_stream) =
        actix_ws::handle(&req, stream).map_err(|err| {
            error!(error = %err, "WebSocket upgrade failed");
            err
        })?;

    rt::spawn(session::handle_socket(
        Arc::clone(&state.registry),
        user_id,
        session,
        message_stream,
    ));

    Ok(response)
}
