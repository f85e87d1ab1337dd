//! Diesel table definitions for the PostgreSQL schema.
//!
//! Must match the migrations exactly; regenerate with `diesel print-schema`
//! after schema changes.

diesel::table! {
    /// Tenant isolation boundaries.
    tenants (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Human-readable tenant name.
        name -> Varchar,
        /// Record creation timestamp.
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Publisher credentials (API keys) authorised to submit messages.
    publishers (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Owning tenant.
        tenant_id -> Uuid,
        /// Opaque API key, unique across tenants.
        api_key -> Varchar,
        /// Record creation timestamp.
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Topics, unique per `(tenant_id, name)`, created lazily.
    topics (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Owning tenant.
        tenant_id -> Uuid,
        /// Topic name within the tenant.
        name -> Varchar,
        /// Record creation timestamp.
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Subscriptions linking users to topics, unique per triple.
    subscriptions (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Owning tenant.
        tenant_id -> Uuid,
        /// Subscribed user.
        user_id -> Uuid,
        /// Subscribed topic.
        topic_id -> Uuid,
        /// Record creation timestamp.
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Registered push endpoints. Socket transports are never stored here.
    devices (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Owning tenant.
        tenant_id -> Uuid,
        /// Owning user.
        user_id -> Uuid,
        /// Transport kind (`webpush`, `apns`, `fcm`).
        kind -> Varchar,
        /// Opaque transport token.
        token -> Jsonb,
        /// Record creation timestamp.
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Stored messages, the system of record for the pipeline.
    messages (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Owning tenant.
        tenant_id -> Uuid,
        /// Topic published against.
        topic_id -> Uuid,
        /// Submitting credential.
        publisher_id -> Uuid,
        /// Notification title.
        title -> Varchar,
        /// Notification body.
        body -> Text,
        /// Optional structured payload.
        payload -> Nullable<Jsonb>,
        /// Requested TTL in seconds.
        ttl_sec -> Int8,
        /// `created_at + ttl_sec`; the hard delivery deadline.
        expires_at -> Timestamptz,
        /// Optional per-tenant idempotency key (max 255 characters).
        dedupe_key -> Nullable<Varchar>,
        /// Lifecycle status (`queued`, `done`, `expired`).
        status -> Varchar,
        /// Record creation timestamp.
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Per-(message, user, transport) delivery obligations.
    deliveries (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Message being delivered; cascades on message deletion.
        message_id -> Uuid,
        /// Target subscriber.
        user_id -> Uuid,
        /// Registered device; null for socket obligations.
        device_id -> Nullable<Uuid>,
        /// Transport kind (`socket`, `webpush`, `apns`, `fcm`).
        channel -> Varchar,
        /// Lifecycle status (`queued`, `sent`, `failed`, `expired`).
        status -> Varchar,
        /// Most recent failure description.
        last_error -> Nullable<Text>,
        /// Last status change timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Durable job queue rows leased with `FOR UPDATE SKIP LOCKED`.
    jobs (id) {
        /// Primary key: UUID v4 identifier.
        id -> Uuid,
        /// Queue name (`fanout` or `deliver`).
        queue -> Varchar,
        /// Serialised job payload.
        payload -> Jsonb,
        /// Lifecycle status (`queued`, `running`, `done`, `dead`).
        status -> Varchar,
        /// Attempts consumed so far.
        attempts -> Int4,
        /// Attempt ceiling for this job.
        max_attempts -> Int4,
        /// Earliest eligible execution time.
        run_at -> Timestamptz,
        /// Lease acquisition time; null when not leased.
        locked_at -> Nullable<Timestamptz>,
        /// Most recent failure description.
        last_error -> Nullable<Text>,
        /// Record creation timestamp.
        created_at -> Timestamptz,
        /// Last mutation timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    tenants,
    publishers,
    topics,
    subscriptions,
    devices,
    messages,
    deliveries,
    jobs,
);
