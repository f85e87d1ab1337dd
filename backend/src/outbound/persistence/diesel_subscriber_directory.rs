//! PostgreSQL-backed `SubscriberDirectory` implementation using Diesel.
//!
//! Read-only lookups over provisioning-owned tables: publisher credential
//! resolution and the subscription/device left join consumed by fan-out. A
//! subscriber with no registered device still yields one row with a null
//! device side.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;
use uuid::Uuid;

use crate::domain::message::{Channel, DeviceId, PublisherId, TenantId, TopicId, UserId};
use crate::domain::ports::{
    DeviceRecord, DirectoryError, Publisher, SubscriberDevice, SubscriberDirectory,
};

use super::pool::{DbPool, PoolError};
use super::schema::{devices, publishers, subscriptions};

/// Diesel-backed implementation of the `SubscriberDirectory` port.
#[derive(Clone)]
pub struct DieselSubscriberDirectory {
    pool: DbPool,
}

impl DieselSubscriberDirectory {
    /// Create a directory over the shared pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> DirectoryError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            DirectoryError::connection(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> DirectoryError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    if let DieselError::DatabaseError(kind, info) = &error {
        debug!(?kind, message = info.message(), "diesel operation failed");
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            DirectoryError::connection("database connection error")
        }
        other => DirectoryError::query(other.to_string()),
    }
}

#[async_trait]
impl SubscriberDirectory for DieselSubscriberDirectory {
    async fn find_publisher(&self, api_key: &str) -> Result<Option<Publisher>, DirectoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<(Uuid, Uuid)> = publishers::table
            .filter(publishers::api_key.eq(api_key))
            .select((publishers::id, publishers::tenant_id))
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;
        Ok(row.map(|(id, tenant_id)| Publisher {
            id: PublisherId::from_uuid(id),
            tenant_id: TenantId::from_uuid(tenant_id),
        }))
    }

    async fn subscriber_devices(
        &self,
        tenant_id: TenantId,
        topic_id: TopicId,
    ) -> Result<Vec<SubscriberDevice>, DirectoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let rows: Vec<(Uuid, Option<(Uuid, String, serde_json::Value)>)> = subscriptions::table
            .left_join(
                devices::table.on(devices::user_id
                    .eq(subscriptions::user_id)
                    .and(devices::tenant_id.eq(subscriptions::tenant_id))),
            )
            .filter(
                subscriptions::tenant_id
                    .eq(tenant_id.as_uuid())
                    .and(subscriptions::topic_id.eq(topic_id.as_uuid())),
            )
            .select((
                subscriptions::user_id,
                (devices::id, devices::kind, devices::token).nullable(),
            ))
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        Ok(rows
            .into_iter()
            .map(|(user_id, device)| SubscriberDevice {
                user_id: UserId::from_uuid(user_id),
                device: device.map(|(id, kind, token)| DeviceRecord {
                    id: DeviceId::from_uuid(id),
                    kind: Channel::parse(&kind),
                    token,
                }),
            })
            .collect())
    }

    async fn subscriber_ids(
        &self,
        tenant_id: TenantId,
        topic_id: TopicId,
    ) -> Result<Vec<UserId>, DirectoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let rows: Vec<Uuid> = subscriptions::table
            .filter(
                subscriptions::tenant_id
                    .eq(tenant_id.as_uuid())
                    .and(subscriptions::topic_id.eq(topic_id.as_uuid())),
            )
            .select(subscriptions::user_id)
            .distinct()
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        Ok(rows.into_iter().map(UserId::from_uuid).collect())
    }
}
