//! Delivery worker.
//!
//! Attempts one delivery obligation per job: expiry-gates against the
//! message, dispatches by channel (socket push via the registry, push
//! transports via their senders), and records the outcome on the delivery
//! row. Transient failures propagate as errors so the queue applies backoff
//! and, on the final attempt, dead-letters the job; non-retryable outcomes
//! settle the row directly and never error.

use std::sync::Arc;

use mockable::Clock;
use thiserror::Error;

use super::delivery::failure_reason;
use super::jobs::DeliveryJob;
use super::message::Channel;
use super::ports::{
    ConnectionRegistry, DeliveryRepository, DeliveryRepositoryError, MessageRepository,
    PushTransport,
};

/// Transport senders keyed by channel kind.
///
/// Missing entries make the corresponding channel an `unsupported_channel`
/// failure, mirroring an operator disabling a transport.
#[derive(Clone, Default)]
pub struct PushTransports {
    /// Web Push sender.
    pub webpush: Option<Arc<dyn PushTransport>>,
    /// APNs sender.
    pub apns: Option<Arc<dyn PushTransport>>,
    /// FCM sender.
    pub fcm: Option<Arc<dyn PushTransport>>,
}

impl PushTransports {
    fn for_channel(&self, channel: &Channel) -> Option<&Arc<dyn PushTransport>> {
        match channel {
            Channel::WebPush => self.webpush.as_ref(),
            Channel::Apns => self.apns.as_ref(),
            Channel::Fcm => self.fcm.as_ref(),
            Channel::Socket | Channel::Other(_) => None,
        }
    }
}

/// Terminal (non-retryable) results of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The transport accepted the send; row is `sent`.
    Delivered,
    /// The delivery row is already terminal; nothing was attempted.
    AlreadySettled,
    /// The delivery row no longer exists.
    DeliveryMissing,
    /// The message was deleted out-of-band; row is `failed`.
    MessageMissing,
    /// The message TTL elapsed; row is `expired`.
    Expired,
    /// No sender is registered for the channel; row is `failed`.
    UnsupportedChannel,
    /// A push job arrived without a device token; row is `failed`.
    MissingToken,
}

/// Retryable failure of one delivery attempt.
///
/// The queue reacts by rescheduling with backoff or, past the attempt
/// ceiling, by dead-lettering the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery attempt failed: {reason}")]
pub struct DeliveryAttemptError {
    /// Failure description, also recorded as the row's `last_error`.
    pub reason: String,
}

impl DeliveryAttemptError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<DeliveryRepositoryError> for DeliveryAttemptError {
    fn from(error: DeliveryRepositoryError) -> Self {
        Self::new(error.to_string())
    }
}

/// Worker consuming `deliver` jobs.
pub struct DeliveryWorker {
    messages: Arc<dyn MessageRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    registry: Arc<dyn ConnectionRegistry>,
    transports: PushTransports,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Build the worker from its ports.
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        registry: Arc<dyn ConnectionRegistry>,
        transports: PushTransports,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            messages,
            deliveries,
            registry,
            transports,
            clock,
        }
    }

    /// Attempt one delivery job.
    pub async fn process(&self, job: &DeliveryJob) -> Result<DeliveryOutcome, DeliveryAttemptError> {
        let Some(delivery) = self.deliveries.find_delivery(job.delivery_id).await? else {
            tracing::warn!(delivery_id = %job.delivery_id, "delivery row missing");
            return Ok(DeliveryOutcome::DeliveryMissing);
        };
        if delivery.status.is_terminal() {
            return Ok(DeliveryOutcome::AlreadySettled);
        }

        let message = self
            .messages
            .find_message(job.message_id)
            .await
            .map_err(|error| DeliveryAttemptError::new(error.to_string()))?;
        let Some(message) = message else {
            self.deliveries
                .mark_failed(job.delivery_id, failure_reason::MESSAGE_MISSING)
                .await?;
            tracing::warn!(
                delivery_id = %job.delivery_id,
                message_id = %job.message_id,
                "message deleted out-of-band"
            );
            return Ok(DeliveryOutcome::MessageMissing);
        };

        if message.is_expired_at(self.clock.utc()) {
            self.deliveries
                .mark_expired(job.delivery_id, failure_reason::EXPIRED)
                .await?;
            return Ok(DeliveryOutcome::Expired);
        }

        let envelope = message.envelope();
        match &job.channel {
            Channel::Socket => {
                if self.registry.push(job.user_id, &envelope).await {
                    self.deliveries.mark_sent(job.delivery_id).await?;
                    Ok(DeliveryOutcome::Delivered)
                } else {
                    self.fail_retryable(job, "no open socket connection accepted the frame")
                        .await
                }
            }
            channel => {
                let Some(transport) = self.transports.for_channel(channel) else {
                    self.deliveries
                        .mark_failed(job.delivery_id, failure_reason::UNSUPPORTED_CHANNEL)
                        .await?;
                    tracing::warn!(
                        delivery_id = %job.delivery_id,
                        channel = %channel,
                        "no transport registered for channel"
                    );
                    return Ok(DeliveryOutcome::UnsupportedChannel);
                };
                let Some(token) = &job.token else {
                    self.deliveries
                        .mark_failed(job.delivery_id, failure_reason::MISSING_TOKEN)
                        .await?;
                    tracing::warn!(
                        delivery_id = %job.delivery_id,
                        channel = %channel,
                        "push job carries no token"
                    );
                    return Ok(DeliveryOutcome::MissingToken);
                };

                match transport.send(token, &envelope).await {
                    Ok(()) => {
                        self.deliveries.mark_sent(job.delivery_id).await?;
                        Ok(DeliveryOutcome::Delivered)
                    }
                    Err(error) => self.fail_retryable(job, error.to_string()).await,
                }
            }
        }
    }

    async fn fail_retryable(
        &self,
        job: &DeliveryJob,
        reason: impl Into<String>,
    ) -> Result<DeliveryOutcome, DeliveryAttemptError> {
        let reason = reason.into();
        self.deliveries.mark_failed(job.delivery_id, &reason).await?;
        tracing::warn!(
            delivery_id = %job.delivery_id,
            channel = %job.channel,
            reason,
            "delivery attempt failed; queue will retry"
        );
        Err(DeliveryAttemptError::new(reason))
    }
}
