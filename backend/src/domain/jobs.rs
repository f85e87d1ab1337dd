//! Durable job payloads and the delivery retry policy.
//!
//! Job payload shapes are part of the wire contract with the queue: they
//! must stay stable across restarts so in-flight jobs survive deploys.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::delivery::DeliveryId;
use super::message::{Channel, DeviceId, MessageId, UserId};

/// Queue name carrying fan-out jobs.
pub const FANOUT_QUEUE: &str = "fanout";
/// Queue name carrying delivery jobs; its `dead` rows form the DLQ.
pub const DELIVER_QUEUE: &str = "deliver";

/// Payload of one fan-out job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutJob {
    /// Message to expand into delivery obligations.
    pub message_id: MessageId,
}

/// Payload of one delivery job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    /// Delivery row this job attempts.
    pub delivery_id: DeliveryId,
    /// Message being delivered.
    pub message_id: MessageId,
    /// Target subscriber.
    pub user_id: UserId,
    /// Registered device, absent for socket obligations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Transport to attempt.
    pub channel: Channel,
    /// Push token snapshot taken at fan-out time, absent for sockets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<serde_json::Value>,
}

/// Retry policy applied by the queue to failed delivery jobs.
///
/// Attempts are counted from 1; a job that fails on its final attempt is
/// dead-lettered instead of rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempt ceiling, including the first attempt.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Cap applied to the exponential backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// What the queue should do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Schedule another attempt after the given delay.
    Reschedule(Duration),
    /// Retry budget exhausted; move the job to the dead-letter queue.
    DeadLetter,
}

impl RetryPolicy {
    /// Base (un-jittered) delay before the attempt following `failed_attempt`.
    ///
    /// Doubles per failure and saturates at [`RetryPolicy::max_backoff`].
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = 2_u32.saturating_pow(failed_attempt.saturating_sub(1));
        let base_ms = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(u64::from(exponent)).min(max_ms))
    }

    /// Decide the fate of a job whose attempt number `failed_attempt` failed.
    pub fn on_failure(&self, failed_attempt: u32) -> RetryAction {
        if failed_attempt >= self.max_attempts.max(1) {
            RetryAction::DeadLetter
        } else {
            RetryAction::Reschedule(self.backoff_for(failed_attempt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Duration::from_secs(2))]
    #[case(2, Duration::from_secs(4))]
    #[case(3, Duration::from_secs(8))]
    #[case(4, Duration::from_secs(16))]
    fn backoff_doubles_per_failure(#[case] attempt: u32, #[case] expected: Duration) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(attempt), expected);
    }

    #[rstest]
    fn backoff_saturates_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(30), policy.max_backoff);
    }

    #[rstest]
    fn failures_below_ceiling_reschedule() {
        let policy = RetryPolicy::default();
        for attempt in 1..policy.max_attempts {
            assert!(matches!(
                policy.on_failure(attempt),
                RetryAction::Reschedule(_)
            ));
        }
    }

    #[rstest]
    fn final_attempt_dead_letters() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_failure(policy.max_attempts),
            RetryAction::DeadLetter
        );
    }

    #[rstest]
    fn delivery_job_payload_shape_is_stable() {
        let job = DeliveryJob {
            delivery_id: DeliveryId::random(),
            message_id: MessageId::random(),
            user_id: UserId::random(),
            device_id: None,
            channel: Channel::Socket,
            token: None,
        };

        let wire = serde_json::to_value(&job).expect("serialisable job");
        assert!(wire.get("deliveryId").is_some());
        assert!(wire.get("messageId").is_some());
        assert!(wire.get("userId").is_some());
        assert_eq!(wire["channel"], "socket");
        // Socket jobs omit device and token entirely.
        assert!(wire.get("deviceId").is_none());
        assert!(wire.get("token").is_none());

        let decoded: DeliveryJob = serde_json::from_value(wire).expect("decodable job");
        assert_eq!(decoded, job);
    }
}
