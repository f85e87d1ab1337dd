//! Message ingestion service.
//!
//! Owns the publisher-facing publish operation: credential lookup, request
//! validation, lazy topic creation, deduplicated insert, the best-effort
//! fast-path socket push, and the bounded enqueue of the durable fan-out
//! job. The response only ever certifies durable storage; delivery
//! confirmation is asynchronous.

use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;
use serde::Serialize;

use super::error::Error;
use super::jobs::FanoutJob;
use super::message::{DedupeKey, MessageId};
use super::ports::{
    ConnectionRegistry, JobQueue, MessageInsertOutcome, MessageRepository, NewMessage, Publisher,
    SubscriberDirectory,
};

/// Ingestion tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionConfig {
    /// TTL applied when the publisher omits one.
    pub default_ttl_sec: i64,
    /// Upper bound accepted for a requested TTL.
    pub max_ttl_sec: i64,
    /// Bound on the fan-out enqueue step; the publisher response must not
    /// block on a slow queue because the message is already stored.
    pub enqueue_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            default_ttl_sec: 3_600,
            max_ttl_sec: 7 * 24 * 3_600,
            enqueue_timeout: Duration::from_secs(8),
        }
    }
}

/// A validated-at-the-edge publish submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    /// Topic name within the publisher's tenant.
    pub topic: String,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Optional structured payload forwarded verbatim.
    pub payload: Option<serde_json::Value>,
    /// Requested TTL; defaulted and clamped by the service.
    pub ttl_sec: Option<i64>,
    /// Optional per-tenant idempotency key.
    pub dedupe_key: Option<String>,
}

/// Result of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    /// Id of the stored (or pre-existing) message.
    pub message_id: MessageId,
    /// True when an earlier submission with the same dedupe key was reused.
    pub deduplicated: bool,
    /// False when the fan-out enqueue step timed out or failed; the message
    /// is stored either way and recoverable out-of-band.
    pub enqueued: bool,
}

/// Publisher-facing ingestion orchestration.
pub struct IngestionService {
    messages: Arc<dyn MessageRepository>,
    directory: Arc<dyn SubscriberDirectory>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
}

impl IngestionService {
    /// Build the service from its ports.
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        directory: Arc<dyn SubscriberDirectory>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            messages,
            directory,
            queue,
            registry,
            clock,
            config,
        }
    }

    /// Resolve the publisher credential behind an API key.
    pub async fn authenticate(&self, api_key: &str) -> Result<Publisher, Error> {
        let trimmed = api_key.trim();
        if trimmed.is_empty() {
            return Err(Error::unauthorized("missing API key"));
        }
        self.directory
            .find_publisher(trimmed)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?
            .ok_or_else(|| Error::unauthorized("unknown API key"))
    }

    /// Store one message and kick off its delivery pipeline.
    ///
    /// Steps: validate, resolve the topic, insert (dedupe-aware), fire the
    /// best-effort fast-path push, then enqueue the durable fan-out job
    /// under [`IngestionConfig::enqueue_timeout`]. A duplicate submission
    /// returns the prior id without re-triggering the pipeline.
    pub async fn publish(
        &self,
        publisher: Publisher,
        request: PublishRequest,
    ) -> Result<PublishOutcome, Error> {
        let draft = self.validate(publisher, request).await?;

        let outcome = self
            .messages
            .insert_message(&draft)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;

        let message = match outcome {
            MessageInsertOutcome::Deduplicated(message_id) => {
                tracing::info!(%message_id, "duplicate submission resolved by dedupe key");
                return Ok(PublishOutcome {
                    message_id,
                    deduplicated: true,
                    enqueued: false,
                });
            }
            MessageInsertOutcome::Created(message) => message,
        };

        // Fast path: push to subscribers that are online right now. The
        // durable socket job fires regardless; clients dedupe by message id.
        self.fast_path_push(&message).await;

        let enqueued = self.enqueue_fanout(message.id).await;

        Ok(PublishOutcome {
            message_id: message.id,
            deduplicated: false,
            enqueued,
        })
    }

    async fn validate(
        &self,
        publisher: Publisher,
        request: PublishRequest,
    ) -> Result<NewMessage, Error> {
        let topic = request.topic.trim();
        if topic.is_empty() {
            return Err(Error::invalid_request("topic must not be empty"));
        }
        if request.title.trim().is_empty() {
            return Err(Error::invalid_request("title must not be empty"));
        }
        if request.body.trim().is_empty() {
            return Err(Error::invalid_request("body must not be empty"));
        }

        let ttl_sec = request.ttl_sec.unwrap_or(self.config.default_ttl_sec);
        if ttl_sec < 0 {
            return Err(Error::invalid_request("ttlSec must not be negative"));
        }
        if ttl_sec > self.config.max_ttl_sec {
            return Err(Error::invalid_request(format!(
                "ttlSec must be at most {}",
                self.config.max_ttl_sec
            )));
        }

        let dedupe_key = request
            .dedupe_key
            .map(DedupeKey::new)
            .transpose()
            .map_err(|error| Error::invalid_request(error.to_string()))?;

        let topic_id = self
            .messages
            .ensure_topic(publisher.tenant_id, topic)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;

        Ok(NewMessage {
            tenant_id: publisher.tenant_id,
            topic_id,
            publisher_id: publisher.id,
            title: request.title,
            body: request.body,
            payload: request.payload,
            ttl_sec,
            dedupe_key,
        })
    }

    async fn fast_path_push(&self, message: &super::message::Message) {
        if message.is_expired_at(self.clock.utc()) {
            return;
        }

        let subscribers = match self
            .directory
            .subscriber_ids(message.tenant_id, message.topic_id)
            .await
        {
            Ok(subscribers) => subscribers,
            Err(error) => {
                tracing::warn!(message_id = %message.id, %error, "fast-path subscriber lookup failed");
                return;
            }
        };

        let envelope = message.envelope();
        let mut pushed = 0_usize;
        for user_id in subscribers {
            if self.registry.push(user_id, &envelope).await {
                pushed += 1;
            }
        }
        if pushed > 0 {
            tracing::debug!(message_id = %message.id, pushed, "fast-path push delivered");
        }
    }

    async fn enqueue_fanout(&self, message_id: MessageId) -> bool {
        let job = FanoutJob { message_id };
        match tokio::time::timeout(self.config.enqueue_timeout, self.queue.enqueue_fanout(&job))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::error!(%message_id, %error, "fan-out enqueue failed; message stored");
                false
            }
            Err(_elapsed) => {
                tracing::error!(%message_id, "fan-out enqueue timed out; message stored");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use mockable::DefaultClock;
    use rstest::rstest;

    use super::*;
    use crate::domain::jobs::DeliveryJob;
    use crate::domain::message::{
        Message, MessageStatus, NotificationEnvelope, PublisherId, TenantId, TopicId, UserId,
    };
    use crate::domain::ports::{
        DirectoryError, JobQueueError, MessageRepositoryError, PresenceSnapshotEntry, Publisher,
        SubscriberDevice,
    };

    #[derive(Default)]
    struct StubMessages {
        inserted: Mutex<Vec<NewMessage>>,
        dedupe_hit: Option<MessageId>,
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
            draft: &NewMessage,
        ) -> Result<MessageInsertOutcome, MessageRepositoryError> {
            if let Some(existing) = self.dedupe_hit {
                return Ok(MessageInsertOutcome::Deduplicated(existing));
            }
            self.inserted
                .lock()
                .expect("inserted mutex")
                .push(draft.clone());
            let now = Utc::now();
            Ok(MessageInsertOutcome::Created(Message {
                id: MessageId::random(),
                tenant_id: draft.tenant_id,
                topic_id: draft.topic_id,
                publisher_id: draft.publisher_id,
                title: draft.title.clone(),
                body: draft.body.clone(),
                payload: draft.payload.clone(),
                ttl_sec: draft.ttl_sec,
                expires_at: now + chrono::Duration::seconds(draft.ttl_sec),
                dedupe_key: draft.dedupe_key.clone(),
                status: MessageStatus::Queued,
                created_at: now,
            }))
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
    struct StubDirectory {
        online: Vec<UserId>,
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
            Ok(Vec::new())
        }

        async fn subscriber_ids(
            &self,
            _tenant_id: TenantId,
            _topic_id: TopicId,
        ) -> Result<Vec<UserId>, DirectoryError> {
            Ok(self.online.clone())
        }
    }

    #[derive(Default)]
    struct StubQueue {
        fanout: Mutex<Vec<FanoutJob>>,
        fail: bool,
    }

    #[async_trait]
    impl JobQueue for StubQueue {
        async fn enqueue_fanout(&self, job: &FanoutJob) -> Result<(), JobQueueError> {
            if self.fail {
                return Err(JobQueueError::unavailable("broker offline"));
            }
            self.fanout.lock().expect("fanout mutex").push(job.clone());
            Ok(())
        }

        async fn enqueue_delivery(&self, _job: &DeliveryJob) -> Result<(), JobQueueError> {
            Ok(())
        }

        async fn replay_dead_letters(&self, _limit: usize) -> Result<usize, JobQueueError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct StubRegistry {
        pushed: Mutex<Vec<UserId>>,
    }

    #[async_trait]
    impl ConnectionRegistry for StubRegistry {
        async fn push(&self, user_id: UserId, _envelope: &NotificationEnvelope) -> bool {
            self.pushed.lock().expect("pushed mutex").push(user_id);
            true
        }

        async fn broadcast_all(&self, _envelope: &NotificationEnvelope) -> usize {
            0
        }

        fn is_online(&self, _user_id: UserId) -> bool {
            false
        }

        fn snapshot(&self) -> Vec<PresenceSnapshotEntry> {
            Vec::new()
        }
    }

    fn publisher() -> Publisher {
        Publisher {
            id: PublisherId::random(),
            tenant_id: TenantId::random(),
        }
    }

    fn request() -> PublishRequest {
        PublishRequest {
            topic: "builds".to_owned(),
            title: "Build finished".to_owned(),
            body: "pipeline #42 is green".to_owned(),
            payload: None,
            ttl_sec: Some(60),
            dedupe_key: None,
        }
    }

    fn service(
        messages: Arc<StubMessages>,
        directory: Arc<StubDirectory>,
        queue: Arc<StubQueue>,
        registry: Arc<StubRegistry>,
    ) -> IngestionService {
        IngestionService::new(
            messages,
            directory,
            queue,
            registry,
            Arc::new(DefaultClock),
            IngestionConfig::default(),
        )
    }

    #[rstest]
    #[tokio::test]
    async fn publish_stores_and_enqueues() {
        let messages = Arc::new(StubMessages::default());
        let queue = Arc::new(StubQueue::default());
        let svc = service(
            Arc::clone(&messages),
            Arc::new(StubDirectory::default()),
            Arc::clone(&queue),
            Arc::new(StubRegistry::default()),
        );

        let outcome = svc.publish(publisher(), request()).await.expect("publish");

        assert!(!outcome.deduplicated);
        assert!(outcome.enqueued);
        assert_eq!(messages.inserted.lock().expect("inserted").len(), 1);
        let jobs = queue.fanout.lock().expect("fanout");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message_id, outcome.message_id);
    }

    #[rstest]
    #[tokio::test]
    async fn duplicate_submission_returns_prior_id_without_pipeline() {
        let prior = MessageId::random();
        let messages = Arc::new(StubMessages {
            dedupe_hit: Some(prior),
            ..StubMessages::default()
        });
        let queue = Arc::new(StubQueue::default());
        let registry = Arc::new(StubRegistry::default());
        let svc = service(
            messages,
            Arc::new(StubDirectory::default()),
            Arc::clone(&queue),
            Arc::clone(&registry),
        );

        let outcome = svc.publish(publisher(), request()).await.expect("publish");

        assert_eq!(outcome.message_id, prior);
        assert!(outcome.deduplicated);
        assert!(!outcome.enqueued);
        assert!(queue.fanout.lock().expect("fanout").is_empty());
        assert!(registry.pushed.lock().expect("pushed").is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn fast_path_pushes_to_online_subscribers() {
        let online = vec![UserId::random(), UserId::random()];
        let registry = Arc::new(StubRegistry::default());
        let svc = service(
            Arc::new(StubMessages::default()),
            Arc::new(StubDirectory {
                online: online.clone(),
            }),
            Arc::new(StubQueue::default()),
            Arc::clone(&registry),
        );

        svc.publish(publisher(), request()).await.expect("publish");

        assert_eq!(*registry.pushed.lock().expect("pushed"), online);
    }

    #[rstest]
    #[tokio::test]
    async fn enqueue_failure_still_reports_stored_message() {
        let svc = service(
            Arc::new(StubMessages::default()),
            Arc::new(StubDirectory::default()),
            Arc::new(StubQueue {
                fail: true,
                ..StubQueue::default()
            }),
            Arc::new(StubRegistry::default()),
        );

        let outcome = svc.publish(publisher(), request()).await.expect("publish");

        assert!(!outcome.enqueued);
    }

    #[rstest]
    #[case(PublishRequest { topic: "  ".to_owned(), ..request() })]
    #[case(PublishRequest { title: String::new(), ..request() })]
    #[case(PublishRequest { body: String::new(), ..request() })]
    #[case(PublishRequest { body: "  \n ".to_owned(), ..request() })]
    #[case(PublishRequest { ttl_sec: Some(-1), ..request() })]
    #[case(PublishRequest { dedupe_key: Some("   ".to_owned()), ..request() })]
    #[tokio::test]
    async fn invalid_requests_are_rejected(#[case] bad: PublishRequest) {
        let svc = service(
            Arc::new(StubMessages::default()),
            Arc::new(StubDirectory::default()),
            Arc::new(StubQueue::default()),
            Arc::new(StubRegistry::default()),
        );

        let error = svc.publish(publisher(), bad).await.expect_err("rejected");
        assert_eq!(error.code(), crate::domain::ErrorCode::InvalidRequest);
    }
}
