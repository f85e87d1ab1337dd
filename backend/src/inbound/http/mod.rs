//! HTTP inbound adapter exposing REST endpoints.

pub mod admin;
pub mod error;
pub mod health;
pub mod messages;
pub mod state;

use actix_web::web;

pub use error::ApiResult;

/// Register every REST endpoint on an Actix service config.
///
/// Versioned endpoints live under `/v1`; the liveness probe stays at the
/// root so load balancers need no path rewrite.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::healthz).service(
        web::scope("/v1")
            .service(messages::publish)
            .service(messages::get_message)
            .service(admin::replay_dead_letters),
    );
}
