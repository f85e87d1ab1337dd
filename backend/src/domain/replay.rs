//! Operator-facing dead-letter replay.
//!
//! Manual recovery lever: drains up to N dead-lettered delivery jobs back
//! onto the live queue with a fresh retry budget. Jobs that keep failing
//! will dead-letter again.

use std::sync::Arc;

use super::error::Error;
use super::ports::JobQueue;

/// Upper bound accepted for one replay request.
pub const REPLAY_LIMIT_MAX: usize = 1_000;

/// Dead-letter replay service.
pub struct ReplayService {
    queue: Arc<dyn JobQueue>,
}

impl ReplayService {
    /// Build the service over the queue port.
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Move up to `limit` dead-lettered jobs back onto the delivery queue.
    /// Returns the count moved.
    pub async fn replay(&self, limit: usize) -> Result<usize, Error> {
        if limit == 0 {
            return Err(Error::invalid_request("limit must be at least 1"));
        }
        if limit > REPLAY_LIMIT_MAX {
            return Err(Error::invalid_request(format!(
                "limit must be at most {REPLAY_LIMIT_MAX}"
            )));
        }

        let moved = self
            .queue
            .replay_dead_letters(limit)
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;
        tracing::info!(moved, limit, "dead-letter replay complete");
        Ok(moved)
    }
}
