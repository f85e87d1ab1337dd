//! Multi-tenant notification broker.
//!
//! Publishers submit notifications against tenant-scoped topics over REST;
//! subscribers receive them over live WebSocket connections and registered
//! push devices. Ingestion certifies durable storage only; fan-out,
//! per-transport delivery with bounded retries, TTL sweeping, and
//! dead-letter replay all run asynchronously against a PostgreSQL-backed
//! job queue.
//!
//! Layout follows ports-and-adapters:
//!
//! - [`domain`] — services, ports, and data model, free of I/O.
//! - [`inbound`] — Actix Web REST endpoints and the WebSocket session.
//! - [`outbound`] — Diesel repositories, the job queue, push gateways.
//! - [`registry`] — the process-local live-connection registry.

pub mod config;
pub mod doc;
pub mod domain;
pub mod inbound;
pub mod outbound;
pub mod registry;
