//! Delivery obligation data model.
//!
//! One delivery row tracks the attempt-and-outcome lifecycle of sending one
//! message to one subscriber over one transport. Rows are created by fan-out
//! and mutated only by the delivery worker and the TTL sweeper.
//!
//! ## Invariants
//! - Every delivery references an existing message; message deletion
//!   cascades to its deliveries.
//! - `sent` and `expired` are terminal; a delivery never regresses out of
//!   them (`failed` may still become `sent` on a retry).
//! - Exactly one socket delivery exists per `(message, user)` regardless of
//!   how many live connections the user holds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Channel, DeviceId, MessageId, UserId};

/// Delivery row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(uuid::Uuid);

impl DeliveryId {
    /// Wrap an existing UUID.
    pub const fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }

    /// Generate a new random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Access the underlying UUID.
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle state of a delivery obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created by fan-out; not yet attempted (or awaiting retry).
    Queued,
    /// Transport accepted the send. Terminal.
    Sent,
    /// Last attempt failed; eligible for retry until the ceiling.
    Failed,
    /// Message TTL elapsed before a successful send. Terminal.
    Expired,
}

impl DeliveryStatus {
    /// Stable string code stored in the `deliveries.status` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Parse a stored status code.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal statuses never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Expired)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable `last_error` codes for non-retryable delivery outcomes.
pub mod failure_reason {
    /// The message row was deleted out-of-band.
    pub const MESSAGE_MISSING: &str = "message_missing";
    /// The message TTL elapsed before the attempt.
    pub const EXPIRED: &str = "expired";
    /// The channel kind has no registered transport.
    pub const UNSUPPORTED_CHANNEL: &str = "unsupported_channel";
    /// The push job carries no device token.
    pub const MISSING_TOKEN: &str = "missing_token";
}

/// A stored delivery obligation.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Delivery identifier.
    pub id: DeliveryId,
    /// Message this obligation belongs to.
    pub message_id: MessageId,
    /// Subscriber being delivered to.
    pub user_id: UserId,
    /// Registered device, absent for the socket obligation.
    pub device_id: Option<DeviceId>,
    /// Transport for this obligation.
    pub channel: Channel,
    /// Lifecycle status.
    pub status: DeliveryStatus,
    /// Most recent failure description, cleared on success.
    pub last_error: Option<String>,
    /// Last status change timestamp.
    pub updated_at: DateTime<Utc>,
}
