//! OpenAPI documentation configuration.
//!
//! Defines the [`ApiDoc`] struct generating the OpenAPI specification for
//! the REST API: every HTTP endpoint from the inbound layer, the request
//! and response schemas, and the Bearer API-key security scheme used by the
//! publish endpoint.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::domain::{Error, ErrorCode};
use crate::inbound::http::admin::{ReplayBody, ReplayResponse};
use crate::inbound::http::health::HealthResponse;
use crate::inbound::http::messages::{DeliveryCounts, MessageDetail, PublishBody, PublishResponse};

/// Enrich the generated document with the Bearer API-key security scheme.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi
            .components
            .get_or_insert_with(utoipa::openapi::Components::default);

        components.add_security_scheme(
            "PublisherApiKey",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .description(Some("Per-publisher API key issued out of band."))
                    .build(),
            ),
        );
    }
}

/// OpenAPI document for the REST API.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "Notification broker API",
        description = "Publisher ingestion, message inspection, and operator endpoints."
    ),
    servers(
        (url = "/", description = "Relative to the deployment base URL")
    ),
    paths(
        crate::inbound::http::messages::publish,
        crate::inbound::http::messages::get_message,
        crate::inbound::http::admin::replay_dead_letters,
        crate::inbound::http::health::healthz,
    ),
    components(schemas(
        PublishBody,
        PublishResponse,
        MessageDetail,
        DeliveryCounts,
        ReplayBody,
        ReplayResponse,
        HealthResponse,
        Error,
        ErrorCode,
    )),
    tags(
        (name = "messages", description = "Publisher ingestion and message inspection"),
        (name = "admin", description = "Operator endpoints"),
        (name = "health", description = "Liveness probes")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn document_registers_every_endpoint() {
        let doc = ApiDoc::openapi();
        let paths = &doc.paths.paths;
        assert!(paths.contains_key("/v1/messages"));
        assert!(paths.contains_key("/v1/messages/{id}"));
        assert!(paths.contains_key("/v1/admin/dlq/replay"));
        assert!(paths.contains_key("/healthz"));
    }

    #[rstest]
    fn document_registers_error_schema() {
        let doc = ApiDoc::openapi();
        let components = doc.components.as_ref().expect("components");
        assert!(components.schemas.keys().any(|name| name.contains("Error")));
    }
}
