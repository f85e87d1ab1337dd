//! Inbound (driving) adapters: REST endpoints and the WebSocket session.

pub mod http;
pub mod ws;
