//! PostgreSQL-backed `DeliveryRepository` implementation using Diesel.
//!
//! Delivery creation is conflict-tolerant: rows are keyed by a
//! `(message_id, user_id, channel, device_id)` unique constraint declared
//! `NULLS NOT DISTINCT`, so the null `device_id` of socket obligations still
//! participates in dedupe and re-running fan-out inserts nothing twice.
//! Status mutations carry a terminal-state guard in their `WHERE` clause; a
//! `sent` or `expired` row never regresses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use crate::domain::delivery::{Delivery, DeliveryId, DeliveryStatus};
use crate::domain::message::{Channel, DeviceId, MessageId, UserId};
use crate::domain::ports::{DeliveryPlanEntry, DeliveryRepository, DeliveryRepositoryError};

use super::models::{DeliveryRow, NewDeliveryRow};
use super::pool::{DbPool, PoolError};
use super::schema::{deliveries, messages};

/// Diesel-backed implementation of the `DeliveryRepository` port.
#[derive(Clone)]
pub struct DieselDeliveryRepository {
    pool: DbPool,
}

impl DieselDeliveryRepository {
    /// Create a repository over the shared pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> DeliveryRepositoryError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            DeliveryRepositoryError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> DeliveryRepositoryError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    if let DieselError::DatabaseError(kind, info) = &error {
        debug!(?kind, message = info.message(), "diesel operation failed");
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            DeliveryRepositoryError::connection("database connection error")
        }
        other => DeliveryRepositoryError::query(other.to_string()),
    }
}

fn row_to_delivery(row: DeliveryRow) -> Result<Delivery, DeliveryRepositoryError> {
    let status = DeliveryStatus::parse(&row.status).ok_or_else(|| {
        DeliveryRepositoryError::query(format!(
            "invalid delivery status in database: {}",
            row.status
        ))
    })?;
    Ok(Delivery {
        id: DeliveryId::from_uuid(row.id),
        message_id: MessageId::from_uuid(row.message_id),
        user_id: UserId::from_uuid(row.user_id),
        device_id: row.device_id.map(DeviceId::from_uuid),
        channel: Channel::parse(&row.channel),
        status,
        last_error: row.last_error,
        updated_at: row.updated_at,
    })
}

/// Non-terminal statuses eligible for further mutation.
const OPEN_STATUSES: [&str; 2] = ["queued", "failed"];

#[async_trait]
impl DeliveryRepository for DieselDeliveryRepository {
    async fn create_for_fanout(
        &self,
        message_id: MessageId,
        plan: &[DeliveryPlanEntry],
    ) -> Result<Vec<Delivery>, DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let message_uuid = *message_id.as_uuid();

        let rows: Vec<DeliveryRow> = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    for entry in plan {
                        let new_row = NewDeliveryRow {
                            id: Uuid::new_v4(),
                            message_id: message_uuid,
                            user_id: *entry.user_id.as_uuid(),
                            device_id: entry.device_id.map(|id| *id.as_uuid()),
                            channel: entry.channel.as_str(),
                            status: DeliveryStatus::Queued.as_str(),
                        };
                        diesel::insert_into(deliveries::table)
                            .values(&new_row)
                            .on_conflict((
                                deliveries::message_id,
                                deliveries::user_id,
                                deliveries::channel,
                                deliveries::device_id,
                            ))
                            .do_nothing()
                            .execute(conn)
                            .await?;
                    }

                    // Only still-open rows get a delivery job; obligations
                    // settled by an earlier fan-out run are left alone.
                    deliveries::table
                        .filter(
                            deliveries::message_id
                                .eq(message_uuid)
                                .and(deliveries::status.eq(DeliveryStatus::Queued.as_str())),
                        )
                        .select(DeliveryRow::as_select())
                        .load(conn)
                        .await
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)?;

        rows.into_iter().map(row_to_delivery).collect()
    }

    async fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<DeliveryRow> = deliveries::table
            .find(id.as_uuid())
            .select(DeliveryRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        row.map(row_to_delivery).transpose()
    }

    async fn mark_sent(&self, id: DeliveryId) -> Result<(), DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(
            deliveries::table.filter(
                deliveries::id
                    .eq(id.as_uuid())
                    .and(deliveries::status.eq_any(OPEN_STATUSES)),
            ),
        )
        .set((
            deliveries::status.eq(DeliveryStatus::Sent.as_str()),
            deliveries::last_error.eq(None::<String>),
            deliveries::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map(|_| ())
        .map_err(map_diesel_error)
    }

    async fn mark_failed(
        &self,
        id: DeliveryId,
        reason: &str,
    ) -> Result<(), DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(
            deliveries::table.filter(
                deliveries::id
                    .eq(id.as_uuid())
                    .and(deliveries::status.eq_any(OPEN_STATUSES)),
            ),
        )
        .set((
            deliveries::status.eq(DeliveryStatus::Failed.as_str()),
            deliveries::last_error.eq(reason),
            deliveries::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map(|_| ())
        .map_err(map_diesel_error)
    }

    async fn mark_expired(
        &self,
        id: DeliveryId,
        reason: &str,
    ) -> Result<(), DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(
            deliveries::table.filter(
                deliveries::id
                    .eq(id.as_uuid())
                    .and(deliveries::status.eq_any(OPEN_STATUSES)),
            ),
        )
        .set((
            deliveries::status.eq(DeliveryStatus::Expired.as_str()),
            deliveries::last_error.eq(reason),
            deliveries::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map(|_| ())
        .map_err(map_diesel_error)
    }

    async fn expire_for_overdue_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let overdue = messages::table
            .filter(messages::expires_at.lt(now))
            .select(messages::id);
        let updated = diesel::update(
            deliveries::table.filter(
                deliveries::status
                    .eq_any(OPEN_STATUSES)
                    .and(deliveries::message_id.eq_any(overdue)),
            ),
        )
        .set((
            deliveries::status.eq(DeliveryStatus::Expired.as_str()),
            deliveries::last_error.eq(crate::domain::failure_reason::EXPIRED),
            deliveries::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        Ok(u64::try_from(updated).unwrap_or(u64::MAX))
    }

    async fn status_counts(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<(DeliveryStatus, u64)>, DeliveryRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let counts: Vec<(String, i64)> = deliveries::table
            .filter(deliveries::message_id.eq(message_id.as_uuid()))
            .group_by(deliveries::status)
            .select((deliveries::status, diesel::dsl::count_star()))
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        counts
            .into_iter()
            .map(|(status, count)| {
                let status = DeliveryStatus::parse(&status).ok_or_else(|| {
                    DeliveryRepositoryError::query(format!(
                        "invalid delivery status in database: {status}"
                    ))
                })?;
                Ok((status, u64::try_from(count).unwrap_or(0)))
            })
            .collect()
    }
}
