//! Internal Diesel row structs for database operations.
//!
//! Implementation details of the persistence layer; never exposed to the
//! domain. Conversions into domain entities live next to the repositories
//! that perform them.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::schema::{deliveries, jobs, messages, topics};

/// Row struct for reading from the messages table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct MessageRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub topic_id: Uuid,
    pub publisher_id: Uuid,
    pub title: String,
    pub body: String,
    pub payload: Option<serde_json::Value>,
    pub ttl_sec: i64,
    pub expires_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Insertable struct for creating messages.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub(crate) struct NewMessageRow<'a> {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub topic_id: Uuid,
    pub publisher_id: Uuid,
    pub title: &'a str,
    pub body: &'a str,
    pub payload: Option<&'a serde_json::Value>,
    pub ttl_sec: i64,
    pub expires_at: DateTime<Utc>,
    pub dedupe_key: Option<&'a str>,
    pub status: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Insertable struct for lazily creating topics.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = topics)]
pub(crate) struct NewTopicRow<'a> {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: &'a str,
}

/// Row struct for reading from the deliveries table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = deliveries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct DeliveryRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Option<Uuid>,
    pub channel: String,
    pub status: String,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Insertable struct for creating delivery obligations.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = deliveries)]
pub(crate) struct NewDeliveryRow<'a> {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Option<Uuid>,
    pub channel: &'a str,
    pub status: &'a str,
}

/// Row struct for reading from the jobs table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    #[expect(dead_code, reason = "lease bookkeeping consumed only by SQL predicates")]
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[expect(dead_code, reason = "audit column not surfaced to workers")]
    pub created_at: DateTime<Utc>,
    #[expect(dead_code, reason = "audit column not surfaced to workers")]
    pub updated_at: DateTime<Utc>,
}

/// Insertable struct for enqueuing jobs.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = jobs)]
pub(crate) struct NewJobRow<'a> {
    pub id: Uuid,
    pub queue: &'a str,
    pub payload: &'a serde_json::Value,
    pub status: &'a str,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
}
