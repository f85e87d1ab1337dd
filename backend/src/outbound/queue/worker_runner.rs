//! Generic polling loop driving a queue consumer.
//!
//! Each worker task leases one job at a time, hands the payload to its
//! handler, and settles the lease from the handler's verdict. The loop
//! never exits on processing failures; only runtime shutdown ends it.

use std::sync::Arc;
use std::time::Duration;

use super::{FailureDisposition, LeasableQueue};

/// Handler verdict for one leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; the job is acknowledged and removed.
    Done,
    /// Transient failure; reschedule with backoff or dead-letter at the
    /// attempt ceiling.
    Retry(String),
    /// Permanent failure (e.g. unparseable payload); dead-letter now.
    Discard(String),
}

/// Poll `queue_name` forever, processing one job per iteration.
///
/// Intended for `tokio::spawn`; run several copies for concurrency. The
/// queue's lease guarantees at-most-one active processor per job.
pub async fn run_worker<Q, F, Fut>(
    queue: Arc<Q>,
    queue_name: &'static str,
    poll_interval: Duration,
    handler: F,
) where
    Q: LeasableQueue + ?Sized,
    F: Fn(serde_json::Value) -> Fut,
    Fut: Future<Output = HandlerOutcome>,
{
    loop {
        match queue.lease(queue_name).await {
            Ok(Some(job)) => {
                let verdict = handler(job.payload).await;
                let settled = match verdict {
                    HandlerOutcome::Done => queue.complete(job.id).await.map(|()| None),
                    HandlerOutcome::Retry(reason) => {
                        queue.fail(job.id, &reason).await.map(Some)
                    }
                    HandlerOutcome::Discard(reason) => {
                        tracing::warn!(
                            queue = queue_name,
                            job_id = %job.id,
                            reason,
                            "discarding unprocessable job"
                        );
                        queue.discard(job.id, &reason).await.map(|()| None)
                    }
                };
                match settled {
                    Ok(Some(FailureDisposition::DeadLettered)) => {
                        tracing::warn!(
                            queue = queue_name,
                            job_id = %job.id,
                            attempt = job.attempt,
                            "job exhausted its retry budget"
                        );
                    }
                    Ok(_) => {}
                    Err(error) => {
                        // The lease will expire and the job will be retried.
                        tracing::error!(
                            queue = queue_name,
                            job_id = %job.id,
                            %error,
                            "failed to settle job lease"
                        );
                    }
                }
            }
            Ok(None) => {
                tokio::time::sleep(poll_interval).await;
            }
            Err(error) => {
                tracing::error!(queue = queue_name, %error, "queue lease poll failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rstest::rstest;
    use uuid::Uuid;

    use super::super::LeasedJob;
    use super::*;
    use crate::domain::ports::JobQueueError;

    #[derive(Debug, Clone, PartialEq)]
    enum Settled {
        Completed(Uuid),
        Failed(Uuid, String),
        Discarded(Uuid, String),
    }

    struct ScriptedQueue {
        jobs: Mutex<Vec<LeasedJob>>,
        settled: Mutex<Vec<Settled>>,
    }

    impl ScriptedQueue {
        fn with_jobs(jobs: Vec<LeasedJob>) -> Self {
            Self {
                jobs: Mutex::new(jobs),
                settled: Mutex::new(Vec::new()),
            }
        }

        fn settled(&self) -> Vec<Settled> {
            self.settled.lock().expect("settled mutex").clone()
        }

        fn drained(&self) -> bool {
            self.jobs.lock().expect("jobs mutex").is_empty()
        }
    }

    #[async_trait]
    impl LeasableQueue for ScriptedQueue {
        async fn lease(&self, _queue: &str) -> Result<Option<LeasedJob>, JobQueueError> {
            let mut jobs = self.jobs.lock().expect("jobs mutex");
            if jobs.is_empty() {
                Ok(None)
            } else {
                Ok(Some(jobs.remove(0)))
            }
        }

        async fn complete(&self, job_id: Uuid) -> Result<(), JobQueueError> {
            self.settled
                .lock()
                .expect("settled mutex")
                .push(Settled::Completed(job_id));
            Ok(())
        }

        async fn fail(
            &self,
            job_id: Uuid,
            error: &str,
        ) -> Result<FailureDisposition, JobQueueError> {
            self.settled
                .lock()
                .expect("settled mutex")
                .push(Settled::Failed(job_id, error.to_owned()));
            Ok(FailureDisposition::Rescheduled)
        }

        async fn discard(&self, job_id: Uuid, error: &str) -> Result<(), JobQueueError> {
            self.settled
                .lock()
                .expect("settled mutex")
                .push(Settled::Discarded(job_id, error.to_owned()));
            Ok(())
        }
    }

    fn job(payload: serde_json::Value) -> LeasedJob {
        LeasedJob {
            id: Uuid::new_v4(),
            payload,
            attempt: 1,
            max_attempts: 5,
        }
    }

    async fn run_until_drained(queue: Arc<ScriptedQueue>, handler_kind: HandlerOutcome) {
        let runner = run_worker(
            Arc::clone(&queue),
            "test",
            Duration::from_millis(5),
            move |_payload| {
                let verdict = handler_kind.clone();
                async move { verdict }
            },
        );
        tokio::select! {
            () = runner => {}
            () = async {
                while !queue.drained() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                // One extra beat so the final settle call lands.
                tokio::time::sleep(Duration::from_millis(20)).await;
            } => {}
        }
    }

    #[rstest]
    #[tokio::test]
    async fn successful_jobs_are_completed() {
        let queue = Arc::new(ScriptedQueue::with_jobs(vec![
            job(serde_json::json!({"n": 1})),
            job(serde_json::json!({"n": 2})),
        ]));

        run_until_drained(Arc::clone(&queue), HandlerOutcome::Done).await;

        let settled = queue.settled();
        assert_eq!(settled.len(), 2);
        assert!(settled
            .iter()
            .all(|entry| matches!(entry, Settled::Completed(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn retry_verdicts_fail_the_lease() {
        let queue = Arc::new(ScriptedQueue::with_jobs(vec![job(serde_json::json!({}))]));

        run_until_drained(
            Arc::clone(&queue),
            HandlerOutcome::Retry("transport down".to_owned()),
        )
        .await;

        assert!(matches!(
            queue.settled().as_slice(),
            [Settled::Failed(_, reason)] if reason == "transport down"
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn discard_verdicts_dead_letter_immediately() {
        let queue = Arc::new(ScriptedQueue::with_jobs(vec![job(serde_json::json!({}))]));

        run_until_drained(
            Arc::clone(&queue),
            HandlerOutcome::Discard("bad payload".to_owned()),
        )
        .await;

        assert!(matches!(
            queue.settled().as_slice(),
            [Settled::Discarded(_, reason)] if reason == "bad payload"
        ));
    }
}
