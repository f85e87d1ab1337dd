//! Domain ports defining the edges of the hexagon.
//!
//! Ports describe how the broker core interacts with driven adapters
//! (message store, subscriber directory, job queue, push transports, live
//! connection registry). Each trait exposes strongly typed errors so
//! adapters map their failures into predictable variants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::delivery::{Delivery, DeliveryId, DeliveryStatus};
use super::jobs::{DeliveryJob, FanoutJob};
use super::message::{
    Channel, DedupeKey, DeviceId, Message, MessageId, NotificationEnvelope, PublisherId, TenantId,
    TopicId, UserId,
};

macro_rules! adapter_error {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Error)]
        pub enum $name {
            /// Backend connectivity failure (pool checkout, broken link).
            #[error("connection failed: {message}")]
            Connection {
                /// Adapter-provided failure description.
                message: String,
            },
            /// Query or mutation failed during execution.
            #[error("query failed: {message}")]
            Query {
                /// Adapter-provided failure description.
                message: String,
            },
        }

        impl $name {
            /// Helper for connection oriented failures.
            pub fn connection(message: impl Into<String>) -> Self {
                Self::Connection {
                    message: message.into(),
                }
            }

            /// Helper for query failures.
            pub fn query(message: impl Into<String>) -> Self {
                Self::Query {
                    message: message.into(),
                }
            }
        }
    };
}

adapter_error! {
    /// Errors surfaced by [`MessageRepository`] adapters.
    MessageRepositoryError
}
adapter_error! {
    /// Errors surfaced by [`DeliveryRepository`] adapters.
    DeliveryRepositoryError
}
adapter_error! {
    /// Errors surfaced by [`SubscriberDirectory`] adapters.
    DirectoryError
}

/// Errors surfaced by the durable job queue adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobQueueError {
    /// Queue infrastructure is unavailable.
    #[error("job queue is unavailable: {message}")]
    Unavailable {
        /// Adapter-provided failure description.
        message: String,
    },
    /// The job could not be persisted or acknowledged.
    #[error("job was rejected: {message}")]
    Rejected {
        /// Adapter-provided failure description.
        message: String,
    },
}

impl JobQueueError {
    /// Helper for queue outages.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Helper for rejected jobs.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Errors surfaced by push transport senders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("push send failed: {message}")]
pub struct PushSendError {
    /// Transport-provided failure description.
    pub message: String,
}

impl PushSendError {
    /// Construct a send failure with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// New-message draft handed to [`MessageRepository::insert_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Topic the message is published against.
    pub topic_id: TopicId,
    /// Submitting credential.
    pub publisher_id: PublisherId,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Optional structured payload.
    pub payload: Option<serde_json::Value>,
    /// Requested time-to-live in seconds.
    pub ttl_sec: i64,
    /// Optional per-tenant idempotency key.
    pub dedupe_key: Option<DedupeKey>,
}

/// Outcome of a message insert.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageInsertOutcome {
    /// A new row was created.
    Created(Message),
    /// The `(tenant, dedupe_key)` pair already exists; no row was created.
    Deduplicated(MessageId),
}

/// Persistence port for messages and topics (the system of record).
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Resolve a topic id, creating the topic lazily on first reference.
    async fn ensure_topic(
        &self,
        tenant_id: TenantId,
        name: &str,
    ) -> Result<TopicId, MessageRepositoryError>;

    /// Insert a message; duplicate dedupe keys resolve to the existing id.
    async fn insert_message(
        &self,
        draft: &NewMessage,
    ) -> Result<MessageInsertOutcome, MessageRepositoryError>;

    /// Fetch a message by id.
    async fn find_message(
        &self,
        id: MessageId,
    ) -> Result<Option<Message>, MessageRepositoryError>;

    /// Mark a message `done` once fan-out has enqueued its delivery jobs.
    /// Terminal statuses are left untouched.
    async fn mark_message_done(&self, id: MessageId) -> Result<(), MessageRepositoryError>;

    /// Expire every non-terminal message whose `expires_at` is before `now`.
    /// Returns the number of rows updated.
    async fn expire_overdue_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, MessageRepositoryError>;

    /// Hard-delete messages whose `expires_at` is before `cutoff`; delivery
    /// rows cascade with their message. Returns the number of rows deleted.
    async fn delete_messages_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, MessageRepositoryError>;
}

/// One planned delivery obligation handed to the repository by fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPlanEntry {
    /// Target subscriber.
    pub user_id: UserId,
    /// Registered device, absent for the socket obligation.
    pub device_id: Option<DeviceId>,
    /// Transport for this obligation.
    pub channel: Channel,
}

/// Persistence port for delivery obligations.
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    /// Create the delivery rows for one message in a single transaction.
    ///
    /// Uses conflict-tolerant inserts keyed on
    /// `(message_id, user_id, channel, device_id)` so re-running fan-out is
    /// a no-op. Returns every still-`queued` row for the message so the
    /// caller can enqueue exactly one job per open obligation.
    async fn create_for_fanout(
        &self,
        message_id: MessageId,
        plan: &[DeliveryPlanEntry],
    ) -> Result<Vec<Delivery>, DeliveryRepositoryError>;

    /// Fetch a delivery by id.
    async fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryRepositoryError>;

    /// Mark a delivery `sent` and clear `last_error`. Terminal rows are
    /// left untouched.
    async fn mark_sent(&self, id: DeliveryId) -> Result<(), DeliveryRepositoryError>;

    /// Mark a delivery `failed`, recording `last_error`. Terminal rows are
    /// left untouched.
    async fn mark_failed(
        &self,
        id: DeliveryId,
        reason: &str,
    ) -> Result<(), DeliveryRepositoryError>;

    /// Mark a delivery `expired`, recording `last_error`. Terminal rows are
    /// left untouched.
    async fn mark_expired(
        &self,
        id: DeliveryId,
        reason: &str,
    ) -> Result<(), DeliveryRepositoryError>;

    /// Expire every `queued`/`failed` delivery whose message expired before
    /// `now`. Returns the number of rows updated.
    async fn expire_for_overdue_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DeliveryRepositoryError>;

    /// Per-status delivery counts for one message (asynchronous delivery
    /// confirmation surface).
    async fn status_counts(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<(DeliveryStatus, u64)>, DeliveryRepositoryError>;
}

/// Publisher credential resolved from an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publisher {
    /// Credential identifier.
    pub id: PublisherId,
    /// Tenant the credential belongs to.
    pub tenant_id: TenantId,
}

/// Registered push device attached to a subscriber row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// Device identifier.
    pub id: DeviceId,
    /// Transport kind (`webpush`, `apns`, `fcm`, ...).
    pub kind: Channel,
    /// Opaque transport token (Web Push subscription JSON, APNs token, ...).
    pub token: serde_json::Value,
}

/// One row of the subscriber/device left join used by fan-out.
///
/// A subscriber with no registered device still yields one row with
/// `device: None`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberDevice {
    /// Subscribed user.
    pub user_id: UserId,
    /// Attached device, if any.
    pub device: Option<DeviceRecord>,
}

/// Read-only directory of publishers, subscriptions, and devices.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Resolve a publisher credential from its API key.
    async fn find_publisher(&self, api_key: &str) -> Result<Option<Publisher>, DirectoryError>;

    /// Left join of subscriptions and devices for one topic.
    async fn subscriber_devices(
        &self,
        tenant_id: TenantId,
        topic_id: TopicId,
    ) -> Result<Vec<SubscriberDevice>, DirectoryError>;

    /// Distinct subscriber user ids for one topic (fast-path push).
    async fn subscriber_ids(
        &self,
        tenant_id: TenantId,
        topic_id: TopicId,
    ) -> Result<Vec<UserId>, DirectoryError>;
}

/// Durable queue port for dispatching fan-out and delivery work.
///
/// The queue is a signalling mechanism only; the message store stays
/// authoritative, so queue contents may be purged or replayed without data
/// loss.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue one fan-out job.
    async fn enqueue_fanout(&self, job: &FanoutJob) -> Result<(), JobQueueError>;

    /// Enqueue one delivery job under the standard retry policy.
    async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), JobQueueError>;

    /// Move up to `limit` dead-lettered delivery jobs back onto the live
    /// queue with a fresh retry budget. Returns the count moved.
    async fn replay_dead_letters(&self, limit: usize) -> Result<usize, JobQueueError>;
}

/// Outbound push transport (Web Push, APNs, FCM) sender.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Send one envelope to the device behind `token`. A non-error return
    /// counts as delivery success.
    async fn send(
        &self,
        token: &serde_json::Value,
        envelope: &NotificationEnvelope,
    ) -> Result<(), PushSendError>;
}

/// One entry of a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshotEntry {
    /// Subscriber with at least one tracked connection.
    pub user_id: UserId,
    /// Number of open connections for the user.
    pub open_count: usize,
    /// Most recent traffic observed on any of the user's connections.
    pub last_seen_at: DateTime<Utc>,
}

/// Process-local registry of live duplex connections.
///
/// Deliberately single-process: multi-instance deployments need an external
/// presence layer, which is out of scope here.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Push an envelope to every open connection of one user. Returns true
    /// iff at least one connection accepted the frame; per-connection
    /// failures are isolated and evict the failing connection.
    async fn push(&self, user_id: UserId, envelope: &NotificationEnvelope) -> bool;

    /// Push an envelope to every open connection of every user. Returns the
    /// number of frames accepted.
    async fn broadcast_all(&self, envelope: &NotificationEnvelope) -> usize;

    /// Whether the user currently holds at least one open connection.
    fn is_online(&self, user_id: UserId) -> bool;

    /// Point-in-time view of tracked users and their connection counts.
    fn snapshot(&self) -> Vec<PresenceSnapshotEntry>;
}
