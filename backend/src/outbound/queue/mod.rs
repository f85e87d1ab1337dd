//! Durable job queue adapter and worker plumbing.
//!
//! The queue is a `jobs` table in the same PostgreSQL instance as the
//! message store, leased with `FOR UPDATE SKIP LOCKED` so at most one
//! worker processes a job at a time; an expired lease makes the job
//! eligible again (visibility timeout). The queue is a signalling
//! mechanism only; the message store stays authoritative.

pub mod diesel_job_queue;
pub mod worker_runner;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::ports::JobQueueError;

pub use diesel_job_queue::{DieselJobQueue, JobQueueConfig};
pub use worker_runner::{HandlerOutcome, run_worker};

/// One job held under a lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    /// Queue row identifier.
    pub id: Uuid,
    /// Serialised job payload.
    pub payload: serde_json::Value,
    /// Attempts consumed including the current one.
    pub attempt: u32,
    /// Attempt ceiling for this job.
    pub max_attempts: u32,
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued with backoff; `attempt` retries remain countable.
    Rescheduled,
    /// Retry budget exhausted; the job moved to the dead-letter state.
    DeadLettered,
}

/// Lease-based queue consumption seam, separable from the Diesel adapter
/// so the worker runner is testable against in-memory doubles.
#[async_trait]
pub trait LeasableQueue: Send + Sync {
    /// Lease the next eligible job on `queue`, if any.
    async fn lease(&self, queue: &str) -> Result<Option<LeasedJob>, JobQueueError>;

    /// Acknowledge successful processing; the job row is removed.
    async fn complete(&self, job_id: Uuid) -> Result<(), JobQueueError>;

    /// Record a retryable failure: reschedule with backoff, or dead-letter
    /// once the attempt ceiling is reached.
    async fn fail(&self, job_id: Uuid, error: &str)
    -> Result<FailureDisposition, JobQueueError>;

    /// Record a non-retryable failure: dead-letter immediately.
    async fn discard(&self, job_id: Uuid, error: &str) -> Result<(), JobQueueError>;
}
