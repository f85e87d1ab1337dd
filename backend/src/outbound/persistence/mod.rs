//! PostgreSQL persistence adapters.
//!
//! Diesel-backed implementations of the domain's storage ports, plus the
//! shared async connection pool, schema definitions, and internal row
//! structs.

pub mod diesel_delivery_repository;
pub mod diesel_message_repository;
pub mod diesel_subscriber_directory;
pub(crate) mod models;
pub mod pool;
pub mod schema;

pub use diesel_delivery_repository::DieselDeliveryRepository;
pub use diesel_message_repository::DieselMessageRepository;
pub use diesel_subscriber_directory::DieselSubscriberDirectory;
pub use pool::{DbPool, PoolConfig, PoolError};
