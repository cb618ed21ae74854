//! Producer side: a named queue on a shared broker connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use pdfgen_core::{now_millis, JobId};

use super::types::{DefaultJobOptions, Job, JobCounts, JobOptions, JobState, MAX_JOB_DELAY};
use crate::broker::{BrokerConnection, BrokerError, FinishedOutcome, Submitted};
use crate::health::{self, HealthStatus};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `init` has not completed (or the queue's bookkeeping is missing).
    #[error("queue `{0}` is not ready")]
    QueueNotReady(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Connection(#[from] BrokerError),

    /// `wait_for_result` gave up; the job itself is unaffected.
    #[error("timed out after {0:?} waiting for job result")]
    Timeout(Duration),

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: JobId, reason: String },

    #[error("job {0} not found")]
    NotFound(JobId),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Outcome of [`Queue::enqueue`]; every variant carries the job snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Created(Job),
    /// A live job with the same `jobId` exists; this is that job.
    Duplicate(Job),
    /// Accepted while disconnected; persisted once the connection is back.
    Buffered(Job),
}

impl Enqueued {
    pub fn job(&self) -> &Job {
        match self {
            Enqueued::Created(job) | Enqueued::Duplicate(job) | Enqueued::Buffered(job) => job,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job().id
    }

    pub fn into_job(self) -> Job {
        match self {
            Enqueued::Created(job) | Enqueued::Duplicate(job) | Enqueued::Buffered(job) => job,
        }
    }
}

/// Named FIFO of jobs with queue-level default options.
#[derive(Debug)]
pub struct Queue {
    broker: Arc<BrokerConnection>,
    name: String,
    defaults: DefaultJobOptions,
    initialized: AtomicBool,
    poll_interval: Duration,
}

impl Queue {
    pub fn new(
        broker: Arc<BrokerConnection>,
        name: impl Into<String>,
        defaults: DefaultJobOptions,
    ) -> Self {
        Self {
            broker,
            name: name.into(),
            defaults,
            initialized: AtomicBool::new(false),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// How often `wait_for_result` re-reads the job.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &DefaultJobOptions {
        &self.defaults
    }

    pub fn broker(&self) -> &Arc<BrokerConnection> {
        &self.broker
    }

    /// Create the queue's bookkeeping in the broker (idempotent).
    #[instrument(skip(self), fields(queue = %self.name))]
    pub fn init(&self) -> QueueResult<()> {
        self.broker.call(|b| b.ensure_queue(&self.name))?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("queue initialized");
        Ok(())
    }

    /// The broker is reachable and holds this queue's bookkeeping.
    ///
    /// Asks the broker every time; a flushed or failed-over store reads as not
    /// ready until [`init`](Self::init) runs again.
    pub fn is_ready(&self) -> bool {
        self.broker
            .try_call(|b| b.queue_exists(&self.name))
            .unwrap_or(false)
    }

    /// Add a job.
    ///
    /// Validation happens before anything is written. With a caller-supplied
    /// `job_id`, a live job with that id is returned as `Duplicate` and nothing is
    /// written; a finished one is replaced.
    #[instrument(skip(self, payload, options), fields(queue = %self.name, job_name = %name))]
    pub fn enqueue<P>(&self, name: &str, payload: &P, options: JobOptions) -> QueueResult<Enqueued>
    where
        P: Serialize + ?Sized,
    {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(QueueError::QueueNotReady(self.name.clone()));
        }

        let payload: JsonValue =
            serde_json::to_value(payload).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let job = self.build_job(name, payload, &options)?;

        let outcome = match self.broker.submit(job)? {
            Submitted::Added(job) => Enqueued::Created(job),
            Submitted::Duplicate(job) => Enqueued::Duplicate(job),
            Submitted::Buffered(job) => Enqueued::Buffered(job),
        };
        debug!(job_id = %outcome.id(), "job enqueued");
        Ok(outcome)
    }

    fn build_job(&self, name: &str, payload: JsonValue, options: &JobOptions) -> QueueResult<Job> {
        if name.trim().is_empty() {
            return Err(QueueError::InvalidOptions("job name must not be empty".to_string()));
        }

        let settings = self.defaults.resolve(options);
        if settings.max_attempts == 0 {
            return Err(QueueError::InvalidOptions("attempts must be at least 1".to_string()));
        }

        let delay_ms = options.delay.unwrap_or(0);
        if delay_ms > MAX_JOB_DELAY.as_millis() as u64 {
            return Err(QueueError::InvalidOptions(format!(
                "delay {delay_ms}ms exceeds {}ms",
                MAX_JOB_DELAY.as_millis()
            )));
        }
        settings
            .backoff
            .validate()
            .map_err(|e| QueueError::InvalidOptions(e.to_string()))?;

        let id = match &options.job_id {
            Some(key) => {
                JobId::custom(key.clone()).map_err(|e| QueueError::InvalidOptions(e.to_string()))?
            }
            None => JobId::generate(),
        };

        Job::new(
            id,
            self.name.clone(),
            name,
            payload,
            settings,
            options.priority.unwrap_or(0),
            Duration::from_millis(delay_ms),
        )
        .map_err(|e| QueueError::InvalidOptions(e.to_string()))
    }

    /// Current snapshot; an active job with an expired lease reads as `stalled`.
    pub fn get_job(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let job = self.broker.call(|b| b.get_job(&self.name, job_id))?;
        Ok(job.map(|j| j.observed(Utc::now())))
    }

    pub fn counts(&self) -> QueueResult<JobCounts> {
        Ok(self.broker.call(|b| b.counts(&self.name))?)
    }

    /// Block until the job finishes, returning its result.
    ///
    /// Polls the broker; reconnects are waited out up to the deadline. Timing out
    /// does not affect the job. A job already deleted by retention still yields
    /// its outcome for [`FINISHED_OUTCOME_TTL`](crate::broker::FINISHED_OUTCOME_TTL).
    pub fn wait_for_result(&self, job_id: &JobId, timeout: Duration) -> QueueResult<JsonValue> {
        let deadline = Instant::now() + timeout;

        loop {
            let polled = self.broker.try_call(|b| match b.get_job(&self.name, job_id)? {
                Some(job) => Ok(Some(Polled::Job(job))),
                None => Ok(b
                    .finished_outcome(&self.name, job_id, now_millis())?
                    .map(Polled::Retained)),
            });

            match polled {
                Ok(Some(Polled::Job(job))) => match job.state {
                    JobState::Completed => return Ok(job.result.unwrap_or(JsonValue::Null)),
                    JobState::Failed => {
                        return Err(QueueError::JobFailed {
                            job_id: job.id,
                            reason: job.error.unwrap_or_default(),
                        });
                    }
                    _ => {}
                },
                Ok(Some(Polled::Retained(FinishedOutcome::Completed(result)))) => return Ok(result),
                Ok(Some(Polled::Retained(FinishedOutcome::Failed(reason)))) => {
                    return Err(QueueError::JobFailed {
                        job_id: job_id.clone(),
                        reason,
                    });
                }
                Ok(None) if self.broker.offline_len() == 0 => {
                    return Err(QueueError::NotFound(job_id.clone()));
                }
                Ok(None) => {}
                Err(BrokerError::ConnectionClosed) => {
                    return Err(BrokerError::ConnectionClosed.into());
                }
                Err(e) => debug!(job_id = %job_id, error = %e, "result poll failed"),
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(QueueError::Timeout(timeout));
            }
            thread::sleep(self.poll_interval.min(left));
        }
    }

    pub fn health_check(&self) -> HealthStatus {
        health::health_check(&self.broker, self)
    }
}

enum Polled {
    Job(Job),
    Retained(FinishedOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdfgen_core::LockToken;

    use crate::broker::{Completion, Failure, InMemoryBackend};
    use crate::config::BrokerConfig;
    use crate::jobs::Backoff;

    fn queue() -> (Arc<InMemoryBackend>, Queue) {
        let backend = InMemoryBackend::arc();
        let broker = BrokerConnection::connect(backend.clone(), BrokerConfig::default()).unwrap();
        let queue = Queue::new(broker, "pdf", DefaultJobOptions::single_attempt())
            .with_poll_interval(Duration::from_millis(5));
        (backend, queue)
    }

    #[test]
    fn enqueue_requires_init() {
        let (_, queue) = queue();
        let err = queue
            .enqueue("generate-pdf", &serde_json::json!({}), JobOptions::new())
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueNotReady(_)));
        assert!(!queue.is_ready());
    }

    #[test]
    fn enqueue_applies_defaults_and_overrides() {
        let (_, queue) = queue();
        queue.init().unwrap();

        let enqueued = queue
            .enqueue(
                "generate-pdf",
                &serde_json::json!({"templateId": "t1"}),
                JobOptions::new()
                    .attempts(3)
                    .backoff(Backoff::exponential(Duration::from_secs(1))),
            )
            .unwrap();

        let job = enqueued.job();
        assert!(matches!(enqueued, Enqueued::Created(_)));
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.settings.max_attempts, 3);
        assert_eq!(job.attempts, 0);
        assert_eq!(queue.counts().unwrap().waiting, 1);
    }

    #[test]
    fn invalid_options_write_nothing() {
        let (_, queue) = queue();
        queue.init().unwrap();

        let err = queue
            .enqueue("generate-pdf", &serde_json::json!({}), JobOptions::new().attempts(0))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));

        let err = queue
            .enqueue("", &serde_json::json!({}), JobOptions::new())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));

        let err = queue
            .enqueue("generate-pdf", &serde_json::json!({}), JobOptions::new().job_id("a:b"))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));

        assert_eq!(queue.counts().unwrap().pending(), 0);
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        let (_, queue) = queue();
        queue.init().unwrap();

        for delay in [
            Duration::from_millis(10_000_000_000_000_000),
            Duration::from_millis(u64::MAX),
            MAX_JOB_DELAY + Duration::from_millis(1),
        ] {
            let err = queue
                .enqueue("generate-pdf", &serde_json::json!({}), JobOptions::new().delay(delay))
                .unwrap_err();
            assert!(matches!(err, QueueError::InvalidOptions(_)), "{delay:?}");
        }
        assert_eq!(queue.counts().unwrap().pending(), 0);
    }

    #[test]
    fn oversized_backoff_is_rejected() {
        let (_, queue) = queue();
        queue.init().unwrap();

        let backoff = Backoff::fixed(Duration::from_millis(i64::MAX as u64))
            .with_max_delay(Duration::from_millis(u64::MAX));
        let err = queue
            .enqueue("generate-pdf", &serde_json::json!({}), JobOptions::new().backoff(backoff))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));

        let options: JobOptions = serde_json::from_value(serde_json::json!({
            "backoff": {"type": "exponential", "delay": 1000, "maxDelay": u64::MAX}
        }))
        .unwrap();
        let err = queue
            .enqueue("generate-pdf", &serde_json::json!({}), options)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));
    }

    #[test]
    fn readiness_follows_the_broker_store() {
        let (backend, queue) = queue();
        assert!(!queue.is_ready());
        queue.init().unwrap();
        assert!(queue.is_ready());

        backend.flush_all();
        assert!(!queue.is_ready());
        assert!(!queue.health_check().queue_ready);

        queue.init().unwrap();
        assert!(queue.is_ready());
    }

    #[test]
    fn unserializable_payload_is_rejected() {
        use std::collections::HashMap;

        let (_, queue) = queue();
        queue.init().unwrap();

        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys are not JSON");
        let err = queue
            .enqueue("generate-pdf", &payload, JobOptions::new())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
    }

    #[test]
    fn delayed_job_is_counted_as_delayed() {
        let (_, queue) = queue();
        queue.init().unwrap();

        queue
            .enqueue(
                "generate-pdf",
                &serde_json::json!({}),
                JobOptions::new().delay(Duration::from_secs(60)),
            )
            .unwrap();
        let counts = queue.counts().unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[test]
    fn wait_for_result_times_out_without_touching_job() {
        let (_, queue) = queue();
        queue.init().unwrap();
        let id = queue
            .enqueue("generate-pdf", &serde_json::json!({}), JobOptions::new())
            .unwrap()
            .id()
            .clone();

        let err = queue
            .wait_for_result(&id, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout(_)));
        assert_eq!(queue.get_job(&id).unwrap().unwrap().state, JobState::Waiting);
    }

    #[test]
    fn wait_for_result_outlives_retention() {
        let (_, queue) = queue();
        queue.init().unwrap();
        let options = JobOptions::new().remove_on_complete(0).remove_on_fail(0);
        let done = queue
            .enqueue("generate-pdf", &serde_json::json!({}), options.clone())
            .unwrap()
            .id()
            .clone();
        let broken = queue
            .enqueue("generate-pdf", &serde_json::json!({}), options)
            .unwrap()
            .id()
            .clone();

        let broker = queue.broker();
        for (id, ok) in [(&done, true), (&broken, false)] {
            let token = LockToken::new();
            let claimed = broker
                .call(|b| b.claim_next("pdf", token, now_millis(), 1_000))
                .unwrap()
                .unwrap();
            assert_eq!(&claimed.id, id);
            let recorded = if ok {
                let completion = Completion {
                    result: serde_json::json!({"fileId": "f"}),
                    finished_at_ms: now_millis(),
                    history: Vec::new(),
                    keep: Some(0),
                };
                broker.call(|b| b.complete("pdf", id, token, &completion))
            } else {
                let failure = Failure {
                    error: "renderer down".to_string(),
                    finished_at_ms: now_millis(),
                    history: Vec::new(),
                    retry_at_ms: None,
                    keep: Some(0),
                };
                broker.call(|b| b.fail("pdf", id, token, &failure))
            };
            assert!(recorded.unwrap());
            assert!(queue.get_job(id).unwrap().is_none());
        }

        assert_eq!(
            queue.wait_for_result(&done, Duration::from_secs(1)).unwrap(),
            serde_json::json!({"fileId": "f"})
        );
        let err = queue
            .wait_for_result(&broken, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, QueueError::JobFailed { reason, .. } if reason == "renderer down"));
    }

    #[test]
    fn wait_for_unknown_job_is_not_found() {
        let (_, queue) = queue();
        queue.init().unwrap();
        let err = queue
            .wait_for_result(&JobId::generate(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }
}
