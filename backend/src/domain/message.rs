//! Message and topic data model.
//!
//! A message is the unit of ingestion: one publisher submission against a
//! tenant-scoped topic. Messages are immutable after creation except for
//! their status, which only ever moves forward (`queued` → `done` |
//! `expired`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Generate a new random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Access the underlying UUID.
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id! {
    /// Tenant isolation boundary identifier.
    TenantId
}
uuid_id! {
    /// Subscriber (end-user) identifier.
    UserId
}
uuid_id! {
    /// Topic identifier, unique per `(tenant, name)`.
    TopicId
}
uuid_id! {
    /// Publisher credential identifier.
    PublisherId
}
uuid_id! {
    /// Message identifier.
    MessageId
}
uuid_id! {
    /// Registered push device identifier.
    DeviceId
}

/// Delivery transport for one obligation.
///
/// `Socket` is ephemeral (live connections only, never stored as a device);
/// the push kinds correspond to `devices.kind` values. Unknown kinds read
/// back from storage surface as [`Channel::Other`] and are treated as
/// non-retryable `unsupported_channel` failures at delivery time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Channel {
    /// Live duplex socket via the connection registry.
    Socket,
    /// Web Push subscription endpoint.
    WebPush,
    /// Apple push token.
    Apns,
    /// Firebase push token.
    Fcm,
    /// Unrecognised transport kind (preserved verbatim).
    Other(String),
}

impl Channel {
    /// Stable string code used in job payloads and delivery rows.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Socket => "socket",
            Self::WebPush => "webpush",
            Self::Apns => "apns",
            Self::Fcm => "fcm",
            Self::Other(kind) => kind.as_str(),
        }
    }

    /// Parse a stored channel code.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "socket" => Self::Socket,
            "webpush" => Self::WebPush,
            "apns" => Self::Apns,
            "fcm" => Self::Fcm,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Channel {
    fn from(kind: String) -> Self {
        Self::parse(&kind)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.as_str().to_owned()
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Stored; fan-out has not completed yet.
    Queued,
    /// Fan-out finished; per-transport outcomes live on delivery rows.
    Done,
    /// TTL elapsed before fan-out completed.
    Expired,
}

impl MessageStatus {
    /// Stable string code stored in the `messages.status` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Done => "done",
            Self::Expired => "expired",
        }
    }

    /// Parse a stored status code.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(Self::Queued),
            "done" => Some(Self::Done),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal statuses never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Expired)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-tenant deduplication key.
///
/// Two submissions carrying the same `(tenant, dedupe_key)` resolve to the
/// same message id; the second insert is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DedupeKey(String);

/// Validation errors for [`DedupeKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupeKeyValidationError {
    /// Key is empty after trimming whitespace.
    #[error("dedupe key must not be empty")]
    Empty,
    /// Key exceeds the storage column width.
    #[error("dedupe key must be at most {max} characters")]
    TooLong {
        /// Maximum accepted length.
        max: usize,
    },
}

/// Maximum accepted dedupe key length (column width).
pub const DEDUPE_KEY_MAX: usize = 255;

impl DedupeKey {
    /// Validate and construct a dedupe key.
    pub fn new(value: impl Into<String>) -> Result<Self, DedupeKeyValidationError> {
        let raw = value.into();
        if raw.trim().is_empty() {
            return Err(DedupeKeyValidationError::Empty);
        }
        if raw.len() > DEDUPE_KEY_MAX {
            return Err(DedupeKeyValidationError::TooLong {
                max: DEDUPE_KEY_MAX,
            });
        }
        Ok(Self(raw))
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for DedupeKey {
    type Error = DedupeKeyValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DedupeKey> for String {
    fn from(key: DedupeKey) -> Self {
        key.0
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Topic the message was published against.
    pub topic_id: TopicId,
    /// Credential that submitted the message.
    pub publisher_id: PublisherId,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Optional structured payload forwarded verbatim to clients.
    pub payload: Option<serde_json::Value>,
    /// Requested time-to-live in seconds.
    pub ttl_sec: i64,
    /// `created_at + ttl_sec`; the hard delivery deadline.
    pub expires_at: DateTime<Utc>,
    /// Optional per-tenant idempotency key.
    pub dedupe_key: Option<DedupeKey>,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether the message TTL has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Client-facing notification envelope (`type` tag plus content).
    pub fn envelope(&self) -> NotificationEnvelope {
        NotificationEnvelope {
            kind: "notification",
            message_id: self.id,
            title: self.title.clone(),
            body: self.body.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Wire payload pushed to sockets and handed to push transports.
///
/// Clients deduplicate the fast-path/durable duplicate by `messageId`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    /// Frame discriminator, always `"notification"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Message the envelope was derived from.
    pub message_id: MessageId,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}
