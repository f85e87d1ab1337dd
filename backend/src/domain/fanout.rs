//! Fan-out worker.
//!
//! Expands one stored message into per-subscriber, per-transport delivery
//! obligations: exactly one socket obligation per distinct subscriber plus
//! one obligation per registered push device. Row creation is
//! conflict-tolerant, so re-running fan-out after a crash enqueues jobs only
//! for obligations that are still open.

use std::collections::HashMap;
use std::sync::Arc;

use mockable::Clock;

use super::error::Error;
use super::jobs::{DeliveryJob, FanoutJob};
use super::message::{Channel, DeviceId, UserId};
use super::ports::{
    DeliveryPlanEntry, DeliveryRepository, JobQueue, MessageRepository, SubscriberDirectory,
};

/// Summary of one fan-out execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// Obligations created and jobs enqueued.
    Expanded {
        /// Distinct subscribers of the topic.
        subscribers: usize,
        /// Delivery jobs enqueued this run.
        jobs_enqueued: usize,
    },
    /// The message row no longer exists; nothing to do.
    MessageMissing,
    /// The message expired before fan-out ran; zero work, not an error.
    SkippedExpired,
}

/// Worker consuming `fanout` jobs.
pub struct FanoutWorker {
    messages: Arc<dyn MessageRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    directory: Arc<dyn SubscriberDirectory>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
}

impl FanoutWorker {
    /// Build the worker from its ports.
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        directory: Arc<dyn SubscriberDirectory>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            messages,
            deliveries,
            directory,
            queue,
            clock,
        }
    }

    /// Execute one fan-out job.
    ///
    /// Errors are retryable infrastructure failures; every domain-level
    /// terminal condition maps to a [`FanoutOutcome`] variant instead.
    pub async fn process(&self, job: &FanoutJob) -> Result<FanoutOutcome, Error> {
        let Some(message) = self
            .messages
            .find_message(job.message_id)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?
        else {
            tracing::warn!(message_id = %job.message_id, "fan-out target message missing");
            return Ok(FanoutOutcome::MessageMissing);
        };

        if message.is_expired_at(self.clock.utc()) {
            tracing::info!(message_id = %message.id, "message expired before fan-out; skipping");
            return Ok(FanoutOutcome::SkippedExpired);
        }

        let rows = self
            .directory
            .subscriber_devices(message.tenant_id, message.topic_id)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;

        let (plan, tokens) = build_plan(&rows);
        let subscribers = plan
            .iter()
            .filter(|entry| entry.channel == Channel::Socket)
            .count();

        if plan.is_empty() {
            // No subscribers is a normal terminal state.
            self.messages
                .mark_message_done(message.id)
                .await
                .map_err(|error| Error::service_unavailable(error.to_string()))?;
            tracing::info!(message_id = %message.id, "no subscribers for topic");
            return Ok(FanoutOutcome::Expanded {
                subscribers: 0,
                jobs_enqueued: 0,
            });
        }

        let created = self
            .deliveries
            .create_for_fanout(message.id, &plan)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;

        let mut jobs_enqueued = 0_usize;
        for delivery in &created {
            let token = delivery
                .device_id
                .and_then(|device_id| tokens.get(&device_id).cloned());
            let job = DeliveryJob {
                delivery_id: delivery.id,
                message_id: message.id,
                user_id: delivery.user_id,
                device_id: delivery.device_id,
                channel: delivery.channel.clone(),
                token,
            };
            self.queue
                .enqueue_delivery(&job)
                .await
                .map_err(|error| Error::service_unavailable(error.to_string()))?;
            jobs_enqueued += 1;
        }

        self.messages
            .mark_message_done(message.id)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;

        tracing::info!(
            message_id = %message.id,
            subscribers,
            jobs_enqueued,
            "fan-out complete"
        );
        Ok(FanoutOutcome::Expanded {
            subscribers,
            jobs_enqueued,
        })
    }

}

/// Group the subscriber/device left join by user: one socket entry per
/// distinct user, one entry per non-socket device. Device rows whose kind is
/// the socket transport are skipped to avoid double-counting.
fn build_plan(
    rows: &[super::ports::SubscriberDevice],
) -> (Vec<DeliveryPlanEntry>, HashMap<DeviceId, serde_json::Value>) {
    let mut seen_users: Vec<UserId> = Vec::new();
    let mut plan = Vec::new();
    let mut tokens = HashMap::new();

    for row in rows {
        if !seen_users.contains(&row.user_id) {
            seen_users.push(row.user_id);
            plan.push(DeliveryPlanEntry {
                user_id: row.user_id,
                device_id: None,
                channel: Channel::Socket,
            });
        }

        if let Some(device) = &row.device {
            if device.kind == Channel::Socket {
                continue;
            }
            plan.push(DeliveryPlanEntry {
                user_id: row.user_id,
                device_id: Some(device.id),
                channel: device.kind.clone(),
            });
            tokens.insert(device.id, device.token.clone());
        }
    }

    (plan, tokens)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use mockable::DefaultClock;
    use rstest::rstest;

    use super::*;
    use crate::domain::delivery::{Delivery, DeliveryId, DeliveryStatus};
    use crate::domain::message::{
        Message, MessageId, MessageStatus, PublisherId, TenantId, TopicId,
    };
    use crate::domain::ports::{
        DeliveryRepositoryError, DeviceRecord, DirectoryError, JobQueueError,
        MessageRepositoryError, Publisher, SubscriberDevice,
    };

    struct StubMessages {
        message: Mutex<Option<Message>>,
        done: Mutex<Vec<MessageId>>,
    }

    impl StubMessages {
        fn holding(message: Option<Message>) -> Self {
            Self {
                message: Mutex::new(message),
                done: Mutex::new(Vec::new()),
            }
        }
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
            Ok(self.message.lock().expect("message mutex").clone())
        }

        async fn mark_message_done(&self, id: MessageId) -> Result<(), MessageRepositoryError> {
            self.done.lock().expect("done mutex").push(id);
            Ok(())
        }

        async fn expire_overdue_messages(
            &self,
            _now: chrono::DateTime<Utc>,
        ) -> Result<u64, MessageRepositoryError> {
            Ok(0)
        }

        async fn delete_messages_expired_before(
            &self,
            _cutoff: chrono::DateTime<Utc>,
        ) -> Result<u64, MessageRepositoryError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct StubDeliveries {
        plans: Mutex<Vec<DeliveryPlanEntry>>,
    }

    #[async_trait]
    impl DeliveryRepository for StubDeliveries {
        async fn create_for_fanout(
            &self,
            message_id: MessageId,
            plan: &[DeliveryPlanEntry],
        ) -> Result<Vec<Delivery>, DeliveryRepositoryError> {
            self.plans
                .lock()
                .expect("plans mutex")
                .extend(plan.iter().cloned());
            Ok(plan
                .iter()
                .map(|entry| Delivery {
                    id: DeliveryId::random(),
                    message_id,
                    user_id: entry.user_id,
                    device_id: entry.device_id,
                    channel: entry.channel.clone(),
                    status: DeliveryStatus::Queued,
                    last_error: None,
                    updated_at: Utc::now(),
                })
                .collect())
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
            _now: chrono::DateTime<Utc>,
        ) -> Result<u64, DeliveryRepositoryError> {
            Ok(0)
        }

        async fn status_counts(
            &self,
            _message_id: MessageId,
        ) -> Result<Vec<(DeliveryStatus, u64)>, DeliveryRepositoryError> {
            Ok(Vec::new())
        }
    }

    struct StubDirectory {
        rows: Vec<SubscriberDevice>,
    }

    #[async_trait]
    impl SubscriberDirectory for StubDirectory {
        async fn find_publisher(
            &self,
            _api_key: &str,
        ) -> Result<Option<Publisher>, DirectoryError> {
            Ok(None)
        }

        async fn subscriber_devices(
            &self,
            _tenant_id: TenantId,
            _topic_id: TopicId,
        ) -> Result<Vec<SubscriberDevice>, DirectoryError> {
            Ok(self.rows.clone())
        }

        async fn subscriber_ids(
            &self,
            _tenant_id: TenantId,
            _topic_id: TopicId,
        ) -> Result<Vec<UserId>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct StubQueue {
        delivery_jobs: Mutex<Vec<DeliveryJob>>,
    }

    #[async_trait]
    impl JobQueue for StubQueue {
        async fn enqueue_fanout(&self, _job: &FanoutJob) -> Result<(), JobQueueError> {
            Ok(())
        }

        async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), JobQueueError> {
            self.delivery_jobs
                .lock()
                .expect("jobs mutex")
                .push(job.clone());
            Ok(())
        }

        async fn replay_dead_letters(&self, _limit: usize) -> Result<usize, JobQueueError> {
            Ok(0)
        }
    }

    fn message(ttl_sec: i64) -> Message {
        let now = Utc::now();
        Message {
            id: MessageId::random(),
            tenant_id: TenantId::random(),
            topic_id: TopicId::random(),
            publisher_id: PublisherId::random(),
            title: "Build finished".to_owned(),
            body: "pipeline #42 is green".to_owned(),
            payload: None,
            ttl_sec,
            expires_at: now + ChronoDuration::seconds(ttl_sec),
            dedupe_key: None,
            status: MessageStatus::Queued,
            created_at: now,
        }
    }

    fn worker(
        messages: Arc<StubMessages>,
        directory: StubDirectory,
        queue: Arc<StubQueue>,
    ) -> FanoutWorker {
        FanoutWorker::new(
            messages,
            Arc::new(StubDeliveries::default()),
            Arc::new(directory),
            queue,
            Arc::new(DefaultClock),
        )
    }

    #[rstest]
    #[tokio::test]
    async fn fan_out_creates_socket_plus_device_obligations() {
        // Three subscribers: u1 no device, u2 no device, u3 one push device.
        let (u1, u2, u3) = (UserId::random(), UserId::random(), UserId::random());
        let rows = vec![
            SubscriberDevice {
                user_id: u1,
                device: None,
            },
            SubscriberDevice {
                user_id: u2,
                device: None,
            },
            SubscriberDevice {
                user_id: u3,
                device: Some(DeviceRecord {
                    id: crate::domain::message::DeviceId::random(),
                    kind: Channel::WebPush,
                    token: serde_json::json!({"endpoint": "https://push.example"}),
                }),
            },
        ];
        let msg = message(60);
        let messages = Arc::new(StubMessages::holding(Some(msg.clone())));
        let queue = Arc::new(StubQueue::default());
        let worker = worker(Arc::clone(&messages), StubDirectory { rows }, Arc::clone(&queue));

        let outcome = worker
            .process(&FanoutJob { message_id: msg.id })
            .await
            .expect("fan-out");

        assert_eq!(
            outcome,
            FanoutOutcome::Expanded {
                subscribers: 3,
                jobs_enqueued: 4,
            }
        );
        let jobs = queue.delivery_jobs.lock().expect("jobs");
        assert_eq!(jobs.len(), 4);
        let sockets = jobs
            .iter()
            .filter(|job| job.channel == Channel::Socket)
            .count();
        assert_eq!(sockets, 3);
        let push = jobs
            .iter()
            .find(|job| job.channel == Channel::WebPush)
            .expect("push job");
        assert_eq!(push.user_id, u3);
        assert!(push.token.is_some());
        assert_eq!(messages.done.lock().expect("done").as_slice(), &[msg.id]);
    }

    #[rstest]
    #[tokio::test]
    async fn expired_message_produces_zero_jobs() {
        let msg = message(0);
        let messages = Arc::new(StubMessages::holding(Some(msg.clone())));
        let queue = Arc::new(StubQueue::default());
        let worker = worker(
            Arc::clone(&messages),
            StubDirectory { rows: Vec::new() },
            Arc::clone(&queue),
        );

        let outcome = worker
            .process(&FanoutJob { message_id: msg.id })
            .await
            .expect("fan-out");

        assert_eq!(outcome, FanoutOutcome::SkippedExpired);
        assert!(queue.delivery_jobs.lock().expect("jobs").is_empty());
        assert!(messages.done.lock().expect("done").is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_message_is_terminal() {
        let worker = worker(
            Arc::new(StubMessages::holding(None)),
            StubDirectory { rows: Vec::new() },
            Arc::new(StubQueue::default()),
        );

        let outcome = worker
            .process(&FanoutJob {
                message_id: MessageId::random(),
            })
            .await
            .expect("fan-out");

        assert_eq!(outcome, FanoutOutcome::MessageMissing);
    }

    #[rstest]
    #[tokio::test]
    async fn socket_kind_device_rows_are_not_double_counted() {
        let user = UserId::random();
        let rows = vec![SubscriberDevice {
            user_id: user,
            device: Some(DeviceRecord {
                id: crate::domain::message::DeviceId::random(),
                kind: Channel::Socket,
                token: serde_json::Value::Null,
            }),
        }];
        let msg = message(60);
        let messages = Arc::new(StubMessages::holding(Some(msg.clone())));
        let queue = Arc::new(StubQueue::default());
        let worker = worker(Arc::clone(&messages), StubDirectory { rows }, Arc::clone(&queue));

        let outcome = worker
            .process(&FanoutJob { message_id: msg.id })
            .await
            .expect("fan-out");

        assert_eq!(
            outcome,
            FanoutOutcome::Expanded {
                subscribers: 1,
                jobs_enqueued: 1,
            }
        );
    }
}
