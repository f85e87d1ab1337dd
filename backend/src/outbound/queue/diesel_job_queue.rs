//! PostgreSQL-backed durable job queue using Diesel.
//!
//! Jobs live in the `jobs` table. Leasing selects the next eligible row
//! with `FOR UPDATE SKIP LOCKED` inside a transaction, increments its
//! attempt counter, and stamps a lease; a job whose lease outlives the
//! visibility timeout becomes eligible again, so a crashed worker cannot
//! strand work. Dead-lettered delivery jobs stay in the table under the
//! `dead` status until an operator replays them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use mockable::Clock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::jobs::{
    DELIVER_QUEUE, DeliveryJob, FANOUT_QUEUE, FanoutJob, RetryAction, RetryPolicy,
};
use crate::domain::ports::{JobQueue, JobQueueError};
use crate::outbound::persistence::models::{JobRow, NewJobRow};
use crate::outbound::persistence::schema::jobs;
use crate::outbound::persistence::{DbPool, PoolError};

use super::{FailureDisposition, LeasableQueue, LeasedJob};

/// Stable status codes stored in the `jobs.status` column.
mod status {
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const DEAD: &str = "dead";
}

/// Queue tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobQueueConfig {
    /// Lease (visibility) timeout after which a running job is reclaimable.
    pub lease_timeout: Duration,
    /// Retry policy applied to failed jobs.
    pub retry: RetryPolicy,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Diesel-backed implementation of the `JobQueue` port and the
/// [`LeasableQueue`] consumption seam.
#[derive(Clone)]
pub struct DieselJobQueue {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    config: JobQueueConfig,
}

impl DieselJobQueue {
    /// Create a queue over the shared pool.
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, config: JobQueueConfig) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    async fn insert_job(
        &self,
        queue: &str,
        payload: &serde_json::Value,
    ) -> Result<(), JobQueueError> {
        let now = self.clock.utc();
        let new_row = NewJobRow {
            id: Uuid::new_v4(),
            queue,
            payload,
            status: status::QUEUED,
            attempts: 0,
            max_attempts: i32::try_from(self.config.retry.max_attempts).unwrap_or(i32::MAX),
            run_at: now,
        };

        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::insert_into(jobs::table)
            .values(&new_row)
            .execute(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_diesel_error)
    }

}

/// Backoff with a deterministic clock-seeded jitter of up to a quarter of
/// the base delay, spreading retries from correlated failures.
fn jittered_backoff(retry: &RetryPolicy, failed_attempt: u32, now: DateTime<Utc>) -> Duration {
    let base = retry.backoff_for(failed_attempt);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_extra = (base_ms / 4).max(1);
    let seed = u64::from(now.timestamp_subsec_nanos()) ^ u64::from(failed_attempt);
    Duration::from_millis(base_ms.saturating_add(seed % (max_extra + 1)))
}

fn map_pool_error(error: PoolError) -> JobQueueError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            JobQueueError::unavailable(message)
        }
    }
}

fn map_diesel_error(error: diesel::result::Error) -> JobQueueError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    if let DieselError::DatabaseError(kind, info) = &error {
        debug!(?kind, message = info.message(), "diesel queue operation failed");
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            JobQueueError::unavailable("database connection error")
        }
        other => JobQueueError::rejected(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(job: &T) -> Result<serde_json::Value, JobQueueError> {
    serde_json::to_value(job)
        .map_err(|err| JobQueueError::rejected(format!("unserialisable job payload: {err}")))
}

#[async_trait]
impl JobQueue for DieselJobQueue {
    async fn enqueue_fanout(&self, job: &FanoutJob) -> Result<(), JobQueueError> {
        self.insert_job(FANOUT_QUEUE, &to_json(job)?).await
    }

    async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), JobQueueError> {
        self.insert_job(DELIVER_QUEUE, &to_json(job)?).await
    }

    async fn replay_dead_letters(&self, limit: usize) -> Result<usize, JobQueueError> {
        let now = self.clock.utc();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let moved = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let ids: Vec<Uuid> = jobs::table
                        .filter(
                            jobs::queue
                                .eq(DELIVER_QUEUE)
                                .and(jobs::status.eq(status::DEAD)),
                        )
                        .order(jobs::updated_at.asc())
                        .limit(limit)
                        .for_update()
                        .skip_locked()
                        .select(jobs::id)
                        .load(conn)
                        .await?;

                    if ids.is_empty() {
                        return Ok(0);
                    }

                    // Fresh retry budget; the payload is re-submitted as-is.
                    diesel::update(jobs::table.filter(jobs::id.eq_any(&ids)))
                        .set((
                            jobs::status.eq(status::QUEUED),
                            jobs::attempts.eq(0),
                            jobs::run_at.eq(now),
                            jobs::locked_at.eq(None::<DateTime<Utc>>),
                            jobs::last_error.eq(None::<String>),
                            jobs::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)?;

        Ok(moved)
    }
}

#[async_trait]
impl LeasableQueue for DieselJobQueue {
    async fn lease(&self, queue: &str) -> Result<Option<LeasedJob>, JobQueueError> {
        let now = self.clock.utc();
        let lease_cutoff = now
            - chrono::Duration::from_std(self.config.lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let queue = queue.to_owned();
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let row: Option<JobRow> = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let eligible = jobs::status
                        .eq(status::QUEUED)
                        .and(jobs::run_at.le(now))
                        .or(jobs::status
                            .eq(status::RUNNING)
                            .and(jobs::locked_at.le(lease_cutoff)));

                    let row: Option<JobRow> = jobs::table
                        .filter(jobs::queue.eq(&queue).and(eligible))
                        .order(jobs::run_at.asc())
                        .limit(1)
                        .for_update()
                        .skip_locked()
                        .select(JobRow::as_select())
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(row) = row else {
                        return Ok(None);
                    };

                    let attempts = row.attempts + 1;
                    diesel::update(jobs::table.find(row.id))
                        .set((
                            jobs::status.eq(status::RUNNING),
                            jobs::attempts.eq(attempts),
                            jobs::locked_at.eq(Some(now)),
                            jobs::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(Some(JobRow { attempts, ..row }))
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)?;

        Ok(row.map(|row| LeasedJob {
            id: row.id,
            payload: row.payload,
            attempt: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(u32::MAX),
        }))
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), JobQueueError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        // Completed jobs are removed outright; retained history is bounded
        // by the dead-letter rows alone.
        diesel::delete(jobs::table.find(job_id))
            .execute(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_diesel_error)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
    ) -> Result<FailureDisposition, JobQueueError> {
        let now = self.clock.utc();
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let row: JobRow = jobs::table
            .find(job_id)
            .select(JobRow::as_select())
            .first(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        let attempt = u32::try_from(row.attempts).unwrap_or(u32::MAX);
        let policy = RetryPolicy {
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(u32::MAX),
            ..self.config.retry
        };

        match policy.on_failure(attempt) {
            RetryAction::Reschedule(_) => {
                let delay = jittered_backoff(&policy, attempt, now);
                let run_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(2));
                diesel::update(jobs::table.find(job_id))
                    .set((
                        jobs::status.eq(status::QUEUED),
                        jobs::run_at.eq(run_at),
                        jobs::locked_at.eq(None::<DateTime<Utc>>),
                        jobs::last_error.eq(error),
                        jobs::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await
                    .map_err(map_diesel_error)?;
                debug!(%job_id, attempt, %run_at, "job rescheduled with backoff");
                Ok(FailureDisposition::Rescheduled)
            }
            RetryAction::DeadLetter => {
                diesel::update(jobs::table.find(job_id))
                    .set((
                        jobs::status.eq(status::DEAD),
                        jobs::locked_at.eq(None::<DateTime<Utc>>),
                        jobs::last_error.eq(error),
                        jobs::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await
                    .map_err(map_diesel_error)?;
                tracing::warn!(%job_id, attempt, "job dead-lettered after final attempt");
                Ok(FailureDisposition::DeadLettered)
            }
        }
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<(), JobQueueError> {
        let now = self.clock.utc();
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        diesel::update(jobs::table.find(job_id))
            .set((
                jobs::status.eq(status::DEAD),
                jobs::locked_at.eq(None::<DateTime<Utc>>),
                jobs::last_error.eq(error),
                jobs::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_diesel_error)
    }
}
