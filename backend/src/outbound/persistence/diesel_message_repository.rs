//! PostgreSQL-backed `MessageRepository` implementation using Diesel.
//!
//! The messages table is the system of record for the pipeline. Dedupe is
//! enforced by a partial unique index on `(tenant_id, dedupe_key)`; a lost
//! insert race is resolved by re-reading the winning row, so concurrent
//! duplicate submissions both observe the same message id.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;
use uuid::Uuid;

use crate::domain::message::{
    DedupeKey, Message, MessageId, MessageStatus, PublisherId, TenantId, TopicId,
};
use crate::domain::ports::{
    MessageInsertOutcome, MessageRepository, MessageRepositoryError, NewMessage,
};

use super::models::{MessageRow, NewMessageRow, NewTopicRow};
use super::pool::{DbPool, PoolError};
use super::schema::{messages, topics};

/// Diesel-backed implementation of the `MessageRepository` port.
#[derive(Clone)]
pub struct DieselMessageRepository {
    pool: DbPool,
}

impl DieselMessageRepository {
    /// Create a repository over the shared pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> MessageRepositoryError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            MessageRepositoryError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> MessageRepositoryError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    if let DieselError::DatabaseError(kind, info) = &error {
        debug!(?kind, message = info.message(), "diesel operation failed");
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            MessageRepositoryError::connection("database connection error")
        }
        other => MessageRepositoryError::query(other.to_string()),
    }
}

fn is_unique_violation(error: &diesel::result::Error) -> bool {
    matches!(
        error,
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _
        )
    )
}

fn row_to_message(row: MessageRow) -> Result<Message, MessageRepositoryError> {
    let status = MessageStatus::parse(&row.status).ok_or_else(|| {
        MessageRepositoryError::query(format!("invalid message status in database: {}", row.status))
    })?;
    let dedupe_key = row
        .dedupe_key
        .map(DedupeKey::new)
        .transpose()
        .map_err(|err| {
            MessageRepositoryError::query(format!("invalid dedupe key in database: {err}"))
        })?;

    Ok(Message {
        id: MessageId::from_uuid(row.id),
        tenant_id: TenantId::from_uuid(row.tenant_id),
        topic_id: TopicId::from_uuid(row.topic_id),
        publisher_id: PublisherId::from_uuid(row.publisher_id),
        title: row.title,
        body: row.body,
        payload: row.payload,
        ttl_sec: row.ttl_sec,
        expires_at: row.expires_at,
        dedupe_key,
        status,
        created_at: row.created_at,
    })
}

impl DieselMessageRepository {
    async fn find_by_dedupe_key(
        &self,
        tenant_id: TenantId,
        key: &DedupeKey,
    ) -> Result<Option<MessageId>, MessageRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let existing: Option<Uuid> = messages::table
            .filter(
                messages::tenant_id
                    .eq(tenant_id.as_uuid())
                    .and(messages::dedupe_key.eq(key.as_str())),
            )
            .select(messages::id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        Ok(existing.map(MessageId::from_uuid))
    }
}

#[async_trait]
impl MessageRepository for DieselMessageRepository {
    async fn ensure_topic(
        &self,
        tenant_id: TenantId,
        name: &str,
    ) -> Result<TopicId, MessageRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let new_row = NewTopicRow {
            id: Uuid::new_v4(),
            tenant_id: *tenant_id.as_uuid(),
            name,
        };
        diesel::insert_into(topics::table)
            .values(&new_row)
            .on_conflict((topics::tenant_id, topics::name))
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        let id: Uuid = topics::table
            .filter(
                topics::tenant_id
                    .eq(tenant_id.as_uuid())
                    .and(topics::name.eq(name)),
            )
            .select(topics::id)
            .first(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(TopicId::from_uuid(id))
    }

    async fn insert_message(
        &self,
        draft: &NewMessage,
    ) -> Result<MessageInsertOutcome, MessageRepositoryError> {
        if let Some(key) = &draft.dedupe_key {
            if let Some(existing) = self.find_by_dedupe_key(draft.tenant_id, key).await? {
                return Ok(MessageInsertOutcome::Deduplicated(existing));
            }
        }

        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(draft.ttl_sec);
        let id = Uuid::new_v4();
        let new_row = NewMessageRow {
            id,
            tenant_id: *draft.tenant_id.as_uuid(),
            topic_id: *draft.topic_id.as_uuid(),
            publisher_id: *draft.publisher_id.as_uuid(),
            title: &draft.title,
            body: &draft.body,
            payload: draft.payload.as_ref(),
            ttl_sec: draft.ttl_sec,
            expires_at,
            dedupe_key: draft.dedupe_key.as_ref().map(DedupeKey::as_str),
            status: MessageStatus::Queued.as_str(),
            created_at: now,
        };

        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let inserted = diesel::insert_into(messages::table)
            .values(&new_row)
            .execute(&mut conn)
            .await;
        drop(conn);

        match inserted {
            Ok(_) => Ok(MessageInsertOutcome::Created(Message {
                id: MessageId::from_uuid(id),
                tenant_id: draft.tenant_id,
                topic_id: draft.topic_id,
                publisher_id: draft.publisher_id,
                title: draft.title.clone(),
                body: draft.body.clone(),
                payload: draft.payload.clone(),
                ttl_sec: draft.ttl_sec,
                expires_at,
                dedupe_key: draft.dedupe_key.clone(),
                status: MessageStatus::Queued,
                created_at: now,
            })),
            Err(error) if is_unique_violation(&error) => {
                // Lost a dedupe race; the winner's row carries the id.
                let Some(key) = &draft.dedupe_key else {
                    return Err(map_diesel_error(error));
                };
                self.find_by_dedupe_key(draft.tenant_id, key)
                    .await?
                    .map(MessageInsertOutcome::Deduplicated)
                    .ok_or_else(|| map_diesel_error(error))
            }
            Err(error) => Err(map_diesel_error(error)),
        }
    }

    async fn find_message(
        &self,
        id: MessageId,
    ) -> Result<Option<Message>, MessageRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<MessageRow> = messages::table
            .find(id.as_uuid())
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        row.map(row_to_message).transpose()
    }

    async fn mark_message_done(&self, id: MessageId) -> Result<(), MessageRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        // Status guard keeps terminal rows terminal.
        diesel::update(
            messages::table.filter(
                messages::id
                    .eq(id.as_uuid())
                    .and(messages::status.eq(MessageStatus::Queued.as_str())),
            ),
        )
        .set(messages::status.eq(MessageStatus::Done.as_str()))
        .execute(&mut conn)
        .await
        .map(|_| ())
        .map_err(map_diesel_error)
    }

    async fn expire_overdue_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, MessageRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let updated = diesel::update(
            messages::table.filter(
                messages::expires_at
                    .lt(now)
                    .and(messages::status.eq(MessageStatus::Queued.as_str())),
            ),
        )
        .set(messages::status.eq(MessageStatus::Expired.as_str()))
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        Ok(u64::try_from(updated).unwrap_or(u64::MAX))
    }

    async fn delete_messages_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, MessageRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let deleted = diesel::delete(messages::table.filter(messages::expires_at.lt(cutoff)))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        debug!(deleted, %cutoff, "purged retained messages");
        Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn pool_error_maps_to_connection_error() {
        let err = map_pool_error(PoolError::checkout("connection refused"));
        assert!(matches!(err, MessageRepositoryError::Connection { .. }));
        assert!(err.to_string().contains("connection refused"));
    }

    #[rstest]
    fn not_found_maps_to_query_error() {
        let err = map_diesel_error(diesel::result::Error::NotFound);
        assert!(matches!(err, MessageRepositoryError::Query { .. }));
    }

    #[rstest]
    fn unique_violation_is_detected() {
        let err = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key".to_string()),
        );
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&diesel::result::Error::NotFound));
    }

    #[rstest]
    fn corrupt_status_is_rejected() {
        let row = MessageRow {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            publisher_id: Uuid::new_v4(),
            title: "t".to_owned(),
            body: "b".to_owned(),
            payload: None,
            ttl_sec: 60,
            expires_at: Utc::now(),
            dedupe_key: None,
            status: "teleported".to_owned(),
            created_at: Utc::now(),
        };
        let err = row_to_message(row).expect_err("invalid status rejected");
        assert!(err.to_string().contains("invalid message status"));
    }
}
