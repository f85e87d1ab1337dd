//! Broker domain: entities, ports, and orchestration services.
//!
//! Purpose: hold the transport-agnostic core of the notification pipeline.
//! Entities are strongly typed and immutable apart from forward-only status
//! transitions; orchestration services depend on adapters exclusively
//! through the traits in [`ports`].
//!
//! Public surface:
//! - Data model: `Message`, `Delivery`, `Channel`, job payloads, retry policy.
//! - Ports: repositories, directory, queue, push transport, registry.
//! - Services: `IngestionService`, `FanoutWorker`, `DeliveryWorker`,
//!   `TtlSweeper`, `ReplayService`.

pub mod delivery;
pub mod delivery_worker;
pub mod error;
pub mod fanout;
pub mod ingestion;
pub mod jobs;
pub mod message;
pub mod ports;
pub mod replay;
pub mod sweeper;

pub use self::delivery::{Delivery, DeliveryId, DeliveryStatus, failure_reason};
pub use self::delivery_worker::{
    DeliveryAttemptError, DeliveryOutcome, DeliveryWorker, PushTransports,
};
pub use self::error::{Error, ErrorCode};
pub use self::fanout::{FanoutOutcome, FanoutWorker};
pub use self::ingestion::{IngestionConfig, IngestionService, PublishOutcome, PublishRequest};
pub use self::jobs::{DELIVER_QUEUE, DeliveryJob, FANOUT_QUEUE, FanoutJob, RetryAction, RetryPolicy};
pub use self::message::{
    Channel, DedupeKey, DeviceId, Message, MessageId, MessageStatus, NotificationEnvelope,
    PublisherId, TenantId, TopicId, UserId,
};
pub use self::replay::ReplayService;
pub use self::sweeper::{SweepReport, TtlSweeper};

/// Convenient API result alias.
pub type ApiResult<T> = Result<T, Error>;
