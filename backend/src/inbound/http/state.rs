//! Shared HTTP adapter state.
//!
//! HTTP handlers accept this state via `actix_web::web::Data` so they only
//! depend on domain services and ports and remain testable without I/O.

use std::sync::Arc;

use crate::domain::ingestion::IngestionService;
use crate::domain::ports::{DeliveryRepository, MessageRepository};
use crate::domain::replay::ReplayService;

/// Dependency bundle for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Publisher-facing ingestion orchestration.
    pub ingestion: Arc<IngestionService>,
    /// Operator-facing dead-letter replay.
    pub replay: Arc<ReplayService>,
    /// Read access to stored messages.
    pub messages: Arc<dyn MessageRepository>,
    /// Read access to per-transport delivery rows.
    pub deliveries: Arc<dyn DeliveryRepository>,
}

impl HttpState {
    /// Bundle the handler dependencies.
    pub fn new(
        ingestion: Arc<IngestionService>,
        replay: Arc<ReplayService>,
        messages: Arc<dyn MessageRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
    ) -> Self {
        Self {
            ingestion,
            replay,
            messages,
            deliveries,
        }
    }
}
