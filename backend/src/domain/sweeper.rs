//! TTL sweeper.
//!
//! Periodic three-step pass over the message store: expire overdue
//! deliveries, expire overdue messages, then hard-delete messages past the
//! retention window (delivery rows cascade). Steps run in that order so a
//! delivery is marked expired before its message can be deleted, and each
//! step tolerates failure independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use mockable::Clock;

use super::ports::{DeliveryRepository, MessageRepository};

/// Outcome of one sweeper tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Deliveries moved to `expired`.
    pub deliveries_expired: u64,
    /// Messages moved to `expired`.
    pub messages_expired: u64,
    /// Messages hard-deleted past retention.
    pub messages_purged: u64,
    /// Steps that failed this tick (logged, not fatal).
    pub failed_steps: u8,
}

/// Background expiry and retention task.
pub struct TtlSweeper {
    messages: Arc<dyn MessageRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    clock: Arc<dyn Clock>,
    retention: ChronoDuration,
}

impl TtlSweeper {
    /// Build the sweeper; `retention` bounds how long expired messages are
    /// kept before hard deletion.
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Self {
        let retention = ChronoDuration::from_std(retention)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        Self {
            messages,
            deliveries,
            clock,
            retention,
        }
    }

    /// Run one tick. Never errors: each step logs and continues.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.utc();
        let mut report = SweepReport::default();

        match self.deliveries.expire_for_overdue_messages(now).await {
            Ok(count) => report.deliveries_expired = count,
            Err(error) => {
                report.failed_steps += 1;
                tracing::warn!(%error, "sweeper failed to expire deliveries");
            }
        }

        match self.messages.expire_overdue_messages(now).await {
            Ok(count) => report.messages_expired = count,
            Err(error) => {
                report.failed_steps += 1;
                tracing::warn!(%error, "sweeper failed to expire messages");
            }
        }

        let cutoff = now - self.retention;
        match self.messages.delete_messages_expired_before(cutoff).await {
            Ok(count) => report.messages_purged = count,
            Err(error) => {
                report.failed_steps += 1;
                tracing::warn!(%error, "sweeper failed to purge retained messages");
            }
        }

        if report.deliveries_expired > 0 || report.messages_expired > 0 || report.messages_purged > 0
        {
            tracing::info!(
                deliveries_expired = report.deliveries_expired,
                messages_expired = report.messages_expired,
                messages_purged = report.messages_purged,
                "sweeper tick complete"
            );
        }
        report
    }

    /// Tick forever on a fixed interval. Intended for `tokio::spawn`; the
    /// task ends when the owning runtime shuts down.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mockable::DefaultClock;
    use rstest::rstest;

    use super::*;
    use crate::domain::delivery::{Delivery, DeliveryId, DeliveryStatus};
    use crate::domain::message::{Message, MessageId, TenantId, TopicId};
    use crate::domain::ports::{
        DeliveryPlanEntry, DeliveryRepositoryError, MessageRepositoryError,
    };

    #[derive(Default)]
    struct StubMessages {
        expire_result: Option<u64>,
        purge_cutoffs: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl MessageRepository for StubMessages {
        async fn ensure_topic(
            &self,
            _tenant_id: TenantId,
            _name: &str,
        ) -> Result<TopicId, MessageRepositoryError> {
            Ok(TopicId::random())
        }

        async fn insert_message(
            &self,
            _draft: &crate::domain::ports::NewMessage,
        ) -> Result<crate::domain::ports::MessageInsertOutcome, MessageRepositoryError> {
            Err(MessageRepositoryError::query("not used"))
        }

        async fn find_message(
            &self,
            _id: MessageId,
        ) -> Result<Option<Message>, MessageRepositoryError> {
            Ok(None)
        }

        async fn mark_message_done(&self, _id: MessageId) -> Result<(), MessageRepositoryError> {
            Ok(())
        }

        async fn expire_overdue_messages(
            &self,
            _now: DateTime<Utc>,
        ) -> Result<u64, MessageRepositoryError> {
            self.expire_result
                .ok_or_else(|| MessageRepositoryError::connection("store offline"))
        }

        async fn delete_messages_expired_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, MessageRepositoryError> {
            self.purge_cutoffs
                .lock()
                .expect("cutoffs mutex")
                .push(cutoff);
            Ok(2)
        }
    }

    struct StubDeliveries {
        expired: u64,
    }

    #[async_trait]
    impl DeliveryRepository for StubDeliveries {
        async fn create_for_fanout(
            &self,
            _message_id: MessageId,
            _plan: &[DeliveryPlanEntry],
        ) -> Result<Vec<Delivery>, DeliveryRepositoryError> {
            Ok(Vec::new())
        }

        async fn find_delivery(
            &self,
            _id: DeliveryId,
        ) -> Result<Option<Delivery>, DeliveryRepositoryError> {
            Ok(None)
        }

        async fn mark_sent(&self, _id: DeliveryId) -> Result<(), DeliveryRepositoryError> {
            Ok(())
        }

        async fn mark_failed(
            &self,
            _id: DeliveryId,
            _reason: &str,
        ) -> Result<(), DeliveryRepositoryError> {
            Ok(())
        }

        async fn mark_expired(
            &self,
            _id: DeliveryId,
            _reason: &str,
        ) -> Result<(), DeliveryRepositoryError> {
            Ok(())
        }

        async fn expire_for_overdue_messages(
            &self,
            _now: DateTime<Utc>,
        ) -> Result<u64, DeliveryRepositoryError> {
            Ok(self.expired)
        }

        async fn status_counts(
            &self,
            _message_id: MessageId,
        ) -> Result<Vec<(DeliveryStatus, u64)>, DeliveryRepositoryError> {
            Ok(Vec::new())
        }
    }

    #[rstest]
    #[tokio::test]
    async fn tick_runs_all_three_steps() {
        let messages = Arc::new(StubMessages {
            expire_result: Some(3),
            ..StubMessages::default()
        });
        let sweeper = TtlSweeper::new(
            Arc::clone(&messages) as Arc<dyn MessageRepository>,
            Arc::new(StubDeliveries { expired: 5 }),
            Arc::new(DefaultClock),
            Duration::from_secs(24 * 3_600),
        );

        let report = sweeper.sweep().await;

        assert_eq!(report.deliveries_expired, 5);
        assert_eq!(report.messages_expired, 3);
        assert_eq!(report.messages_purged, 2);
        assert_eq!(report.failed_steps, 0);
        let cutoffs = messages.purge_cutoffs.lock().expect("cutoffs");
        assert_eq!(cutoffs.len(), 1);
        // The purge cutoff trails now by the retention window.
        assert!(Utc::now() - cutoffs[0] >= ChronoDuration::hours(23));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_step_does_not_stop_later_steps() {
        let messages = Arc::new(StubMessages {
            expire_result: None,
            ..StubMessages::default()
        });
        let sweeper = TtlSweeper::new(
            Arc::clone(&messages) as Arc<dyn MessageRepository>,
            Arc::new(StubDeliveries { expired: 1 }),
            Arc::new(DefaultClock),
            Duration::from_secs(3_600),
        );

        let report = sweeper.sweep().await;

        assert_eq!(report.failed_steps, 1);
        assert_eq!(report.deliveries_expired, 1);
        // The purge step still ran after the failed expiry step.
        assert_eq!(report.messages_purged, 2);
    }
}
