//! Broker configuration loaded via OrthoConfig.
//!
//! Every knob can come from CLI flags, `BROKER_*` environment variables, or
//! a configuration file. Tunables carry compile-time defaults so an empty
//! environment still loads; only the database URL and the push gateway
//! endpoints are genuinely optional.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::domain::ingestion::IngestionConfig;
use crate::domain::jobs::RetryPolicy;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_TTL_SEC: i64 = 3_600;
const DEFAULT_MAX_TTL_SEC: i64 = 7 * 24 * 3_600;
const DEFAULT_ENQUEUE_TIMEOUT_SECS: u64 = 8;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_RETENTION_HOURS: u64 = 24;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 2;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;
const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_FANOUT_WORKERS: usize = 2;
const DEFAULT_DELIVERY_WORKERS: usize = 4;
const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 10;

/// Runtime settings for the notification broker.
#[derive(Debug, Clone, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "BROKER")]
pub struct BrokerSettings {
    /// PostgreSQL connection string. Required; there is no default.
    pub database_url: Option<String>,
    /// Listen address for the HTTP server.
    #[ortho_config(default = DEFAULT_BIND_ADDR.to_owned())]
    pub bind_addr: String,
    /// TTL applied when a publisher omits one, in seconds.
    #[ortho_config(default = DEFAULT_TTL_SEC)]
    pub default_ttl_sec: i64,
    /// Upper bound accepted for a requested TTL, in seconds.
    #[ortho_config(default = DEFAULT_MAX_TTL_SEC)]
    pub max_ttl_sec: i64,
    /// Bound on the fan-out enqueue step during publish, in seconds.
    #[ortho_config(default = DEFAULT_ENQUEUE_TIMEOUT_SECS)]
    pub enqueue_timeout_secs: u64,
    /// Interval between TTL sweeper passes, in seconds.
    #[ortho_config(default = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,
    /// How long expired messages are retained before the purge step.
    #[ortho_config(default = DEFAULT_RETENTION_HOURS)]
    pub retention_hours: u64,
    /// Delivery attempt ceiling before a job is dead-lettered.
    #[ortho_config(default = DEFAULT_MAX_ATTEMPTS)]
    pub delivery_max_attempts: u32,
    /// First retry backoff, in seconds; doubles per attempt.
    #[ortho_config(default = DEFAULT_INITIAL_BACKOFF_SECS)]
    pub delivery_initial_backoff_secs: u64,
    /// Backoff ceiling, in seconds.
    #[ortho_config(default = DEFAULT_MAX_BACKOFF_SECS)]
    pub delivery_max_backoff_secs: u64,
    /// Visibility timeout for leased jobs, in seconds.
    #[ortho_config(default = DEFAULT_LEASE_TIMEOUT_SECS)]
    pub lease_timeout_secs: u64,
    /// Worker poll interval when the queue is idle, in milliseconds.
    #[ortho_config(default = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
    /// Number of fan-out worker tasks.
    #[ortho_config(default = DEFAULT_FANOUT_WORKERS)]
    pub fanout_workers: usize,
    /// Number of delivery worker tasks.
    #[ortho_config(default = DEFAULT_DELIVERY_WORKERS)]
    pub delivery_workers: usize,
    /// Web Push relay endpoint; unset leaves the transport in no-op mode.
    pub webpush_endpoint: Option<String>,
    /// APNs bridge endpoint; unset leaves the transport in no-op mode.
    pub apns_endpoint: Option<String>,
    /// FCM bridge endpoint; unset leaves the transport in no-op mode.
    pub fcm_endpoint: Option<String>,
    /// Request timeout for push gateway calls, in seconds.
    #[ortho_config(default = DEFAULT_PUSH_TIMEOUT_SECS)]
    pub push_timeout_secs: u64,
}

impl BrokerSettings {
    /// Listen address for the HTTP server.
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Ingestion tuning derived from the TTL and enqueue settings.
    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            default_ttl_sec: self.default_ttl_sec,
            max_ttl_sec: self.max_ttl_sec,
            enqueue_timeout: Duration::from_secs(self.enqueue_timeout_secs),
        }
    }

    /// Retry policy applied to delivery jobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.delivery_max_attempts,
            initial_backoff: Duration::from_secs(self.delivery_initial_backoff_secs),
            max_backoff: Duration::from_secs(self.delivery_max_backoff_secs),
        }
    }

    /// Visibility timeout for leased jobs.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Worker poll interval when the queue is idle.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Interval between TTL sweeper passes.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// How long expired messages are retained before purging.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3_600)
    }

    /// Number of fan-out worker tasks; a zero setting is clamped to one.
    pub fn fanout_workers(&self) -> usize {
        self.fanout_workers.max(1)
    }

    /// Number of delivery worker tasks; a zero setting is clamped to one.
    pub fn delivery_workers(&self) -> usize {
        self.delivery_workers.max(1)
    }

    /// Request timeout for push gateway calls.
    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for broker configuration parsing.

    use std::ffi::OsString;

    use env_lock::lock_env;
    use rstest::rstest;

    use super::*;

    fn load_from_empty_args() -> BrokerSettings {
        BrokerSettings::load_from_iter([OsString::from("backend")]).expect("config should load")
    }

    #[rstest]
    fn default_values_are_used_when_missing() {
        let _guard = lock_env([
            ("BROKER_DATABASE_URL", None::<String>),
            ("BROKER_BIND_ADDR", None::<String>),
            ("BROKER_DEFAULT_TTL_SEC", None::<String>),
            ("BROKER_DELIVERY_MAX_ATTEMPTS", None::<String>),
            ("BROKER_POLL_INTERVAL_MS", None::<String>),
            ("BROKER_FANOUT_WORKERS", None::<String>),
            ("BROKER_DELIVERY_WORKERS", None::<String>),
        ]);

        let settings = load_from_empty_args();
        assert!(settings.database_url.is_none());
        assert_eq!(settings.bind_addr(), DEFAULT_BIND_ADDR);
        assert_eq!(settings.ingestion_config().default_ttl_sec, 3_600);
        assert_eq!(settings.retry_policy().max_attempts, 5);
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.retention(), Duration::from_secs(24 * 3_600));
        assert!(settings.webpush_endpoint.is_none());
    }

    #[rstest]
    fn environment_overrides_are_respected() {
        let _guard = lock_env([
            (
                "BROKER_DATABASE_URL",
                Some("postgres://broker@localhost/broker".to_owned()),
            ),
            ("BROKER_BIND_ADDR", Some("127.0.0.1:9090".to_owned())),
            ("BROKER_DEFAULT_TTL_SEC", Some("120".to_owned())),
            ("BROKER_DELIVERY_MAX_ATTEMPTS", Some("3".to_owned())),
            ("BROKER_FANOUT_WORKERS", Some("8".to_owned())),
        ]);

        let settings = load_from_empty_args();
        assert_eq!(
            settings.database_url.as_deref(),
            Some("postgres://broker@localhost/broker")
        );
        assert_eq!(settings.bind_addr(), "127.0.0.1:9090");
        assert_eq!(settings.ingestion_config().default_ttl_sec, 120);
        assert_eq!(settings.retry_policy().max_attempts, 3);
        assert_eq!(settings.fanout_workers(), 8);
    }

    #[rstest]
    fn worker_counts_never_drop_to_zero() {
        let _guard = lock_env([
            ("BROKER_FANOUT_WORKERS", Some("0".to_owned())),
            ("BROKER_DELIVERY_WORKERS", Some("0".to_owned())),
        ]);

        let settings = load_from_empty_args();
        assert_eq!(settings.fanout_workers(), 1);
        assert_eq!(settings.delivery_workers(), 1);
    }
}
