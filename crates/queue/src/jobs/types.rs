//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pdfgen_core::{CoreError, JobId, LockToken};

/// Ceiling applied to every backoff delay that doesn't set its own `maxDelay`.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(60 * 60);

/// Longest `delay`, `backoff.delay` or `backoff.maxDelay` a job may carry.
pub const MAX_JOB_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for claiming.
    Waiting,
    /// Claimed by a worker holding a live lease.
    Active,
    /// Handler succeeded; `result` is set.
    Completed,
    /// Attempts (or stalled recoveries) exhausted; `error` is set.
    Failed,
    /// Active, but the lease expired and the watchdog has not requeued it yet.
    Stalled,
    /// Not eligible before `ready_at` (initial delay or retry backoff).
    Delayed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
            JobState::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "stalled" => Ok(JobState::Stalled),
            "delayed" => Ok(JobState::Delayed),
            other => Err(CoreError::validation(format!("unknown job state `{other}`"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `delay * 2^(attempts - 1)`.
    Exponential,
}

/// Delay applied between a failed attempt and its retry.
///
/// Wire form: `{"type": "fixed" | "exponential", "delay": <ms>, "maxDelay": <ms>?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    pub delay: u64,
    /// Cap in milliseconds; [`MAX_BACKOFF_DELAY`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay: saturating_millis(delay),
            max_delay: None,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay: saturating_millis(base),
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(saturating_millis(max));
        self
    }

    /// Reject base delays or caps above [`MAX_JOB_DELAY`].
    pub fn validate(&self) -> Result<(), CoreError> {
        let limit = MAX_JOB_DELAY.as_millis() as u64;
        if self.delay > limit {
            return Err(CoreError::validation(format!(
                "backoff delay {}ms exceeds {limit}ms",
                self.delay
            )));
        }
        if let Some(max) = self.max_delay.filter(|&max| max > limit) {
            return Err(CoreError::validation(format!(
                "backoff maxDelay {max}ms exceeds {limit}ms"
            )));
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt number `attempts` (1-indexed).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let cap = self
            .max_delay
            .unwrap_or(MAX_BACKOFF_DELAY.as_millis() as u64);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        };

        Duration::from_millis(delay_ms.min(cap))
    }
}

/// Per-enqueue options. Every field left `None` falls back to the queue's
/// [`DefaultJobOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Keep at most this many completed jobs (0 = delete on completion).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<u32>,
    /// Keep at most this many failed jobs (0 = delete on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<u32>,
    /// Milliseconds before the job becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Caller-supplied idempotency key, used as the job id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Higher dequeues first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, keep: u32) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn remove_on_fail(mut self, keep: u32) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(saturating_millis(delay));
        self
    }

    pub fn job_id(mut self, key: impl Into<String>) -> Self {
        self.job_id = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Queue-level defaults.
///
/// There is deliberately no `Default` impl: every queue states its retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultJobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Option<u32>,
    pub remove_on_fail: Option<u32>,
}

impl DefaultJobOptions {
    /// One attempt, no backoff, keep every finished job.
    pub fn single_attempt() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::fixed(Duration::ZERO),
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }

    /// Merge per-job overrides over these defaults.
    pub fn resolve(&self, options: &JobOptions) -> JobSettings {
        JobSettings {
            max_attempts: options.attempts.unwrap_or(self.attempts),
            backoff: options.backoff.unwrap_or(self.backoff),
            remove_on_complete: options.remove_on_complete.or(self.remove_on_complete),
            remove_on_fail: options.remove_on_fail.or(self.remove_on_fail),
        }
    }
}

/// Resolved retry/retention policy stored with each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Option<u32>,
    pub remove_on_fail: Option<u32>,
}

impl JobSettings {
    /// Check whether another attempt is allowed after `attempts` executions.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A worker's claim on an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

/// Record of a finished execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn new(
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        Self {
            attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// Snapshot of a job as stored by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Logical job type; selects the handler.
    pub name: String,
    pub payload: JsonValue,
    pub state: JobState,
    /// Execution attempts so far (incremented on claim).
    pub attempts: u32,
    /// Times the watchdog recovered this job from an expired lease.
    pub stalled_count: u32,
    pub settings: JobSettings,
    pub priority: u8,
    /// Broker-assigned sequence number (FIFO tiebreak).
    pub seq: u64,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Not eligible before this instant (delay or retry backoff).
    pub ready_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub history: Vec<AttemptRecord>,
}

impl Job {
    /// Create a job that has not been persisted yet (`seq` is assigned by the broker).
    ///
    /// Fails when `delay` does not fit a timestamp.
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: JsonValue,
        settings: JobSettings,
        priority: u8,
        delay: Duration,
    ) -> Result<Self, CoreError> {
        let now = Utc::now();
        let (state, ready_at) = if delay.is_zero() {
            (JobState::Waiting, None)
        } else {
            let at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or_else(|| {
                    let ms = delay.as_millis();
                    CoreError::validation(format!("delay of {ms}ms is out of range"))
                })?;
            (JobState::Delayed, Some(at))
        };

        Ok(Self {
            id,
            queue: queue.into(),
            name: name.into(),
            payload,
            state,
            attempts: 0,
            stalled_count: 0,
            settings,
            priority,
            seq: 0,
            result: None,
            error: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            ready_at,
            lease: None,
            history: Vec::new(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// State as an observer should see it at `now`: an active job whose lease
    /// already expired reports `Stalled`.
    pub fn observed_state(&self, now: DateTime<Utc>) -> JobState {
        match (self.state, self.lease) {
            (JobState::Active, Some(lease)) if lease.expires_at < now => JobState::Stalled,
            (state, _) => state,
        }
    }

    /// Copy of this snapshot with [`Job::observed_state`] applied.
    pub fn observed(mut self, now: DateTime<Utc>) -> Self {
        self.state = self.observed_state(now);
        self
    }

    /// History extended with the attempt that just finished.
    pub fn history_with(&self, record: AttemptRecord) -> Vec<AttemptRecord> {
        let mut history = self.history.clone();
        history.push(record);
        history
    }

    /// What happens after the current attempt failed.
    pub fn next_step_after_failure(&self, retryable: bool) -> FailureStep {
        if retryable && self.settings.should_retry(self.attempts) {
            FailureStep::Retry {
                delay: self.settings.backoff.delay_for_attempt(self.attempts),
            }
        } else {
            FailureStep::Fail
        }
    }
}

/// Outcome of the retry policy for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStep {
    /// Return to `waiting` (via `delayed` when `delay` is non-zero).
    Retry { delay: Duration },
    /// Transition to the terminal `failed` state.
    Fail,
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    /// Jobs that have not reached a terminal state.
    pub fn pending(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn settings(max_attempts: u32, backoff: Backoff) -> JobSettings {
        JobSettings {
            max_attempts,
            backoff,
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn exponential_backoff_respects_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250));

        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(64), Duration::from_millis(250));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(Duration::from_millis(500));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(500));
    }

    #[test]
    fn backoff_wire_format() {
        let json = serde_json::json!({"type": "exponential", "delay": 1000});
        let backoff: Backoff = serde_json::from_value(json).unwrap();
        assert_eq!(backoff, Backoff::exponential(Duration::from_secs(1)));
    }

    #[test]
    fn options_wire_format_is_camel_case() {
        let json = serde_json::json!({
            "attempts": 3,
            "backoff": {"type": "fixed", "delay": 10},
            "removeOnComplete": 0,
            "removeOnFail": 5,
            "delay": 250,
            "jobId": "doc-1"
        });
        let options: JobOptions = serde_json::from_value(json).unwrap();
        assert_eq!(options.attempts, Some(3));
        assert_eq!(options.remove_on_complete, Some(0));
        assert_eq!(options.remove_on_fail, Some(5));
        assert_eq!(options.delay, Some(250));
        assert_eq!(options.job_id.as_deref(), Some("doc-1"));
    }

    #[test]
    fn defaults_fill_missing_options() {
        let defaults = DefaultJobOptions {
            attempts: 4,
            backoff: Backoff::fixed(Duration::from_millis(10)),
            remove_on_complete: Some(100),
            remove_on_fail: None,
        };
        let resolved = defaults.resolve(&JobOptions::new().attempts(2));

        assert_eq!(resolved.max_attempts, 2);
        assert_eq!(resolved.backoff, defaults.backoff);
        assert_eq!(resolved.remove_on_complete, Some(100));
        assert_eq!(resolved.remove_on_fail, None);
    }

    #[test]
    fn delayed_job_starts_in_delayed_state() {
        let job = Job::new(
            JobId::generate(),
            "pdf",
            "generate-pdf",
            serde_json::json!({}),
            settings(1, Backoff::fixed(Duration::ZERO)),
            0,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.ready_at.is_some());
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        for delay in [
            Duration::from_millis(u64::MAX),
            Duration::from_millis(10_000_000_000_000_000),
        ] {
            let job = Job::new(
                JobId::generate(),
                "pdf",
                "generate-pdf",
                serde_json::json!({}),
                settings(1, Backoff::fixed(Duration::ZERO)),
                0,
                delay,
            );
            assert!(job.is_err(), "{delay:?} accepted");
        }
    }

    #[test]
    fn backoff_beyond_max_job_delay_is_invalid() {
        assert!(Backoff::exponential(MAX_JOB_DELAY).validate().is_ok());
        assert!(
            Backoff::fixed(MAX_JOB_DELAY + Duration::from_millis(1))
                .validate()
                .is_err()
        );
        assert!(
            Backoff::fixed(Duration::from_secs(1))
                .with_max_delay(Duration::from_millis(u64::MAX))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn expired_lease_is_observed_as_stalled() {
        let mut job = Job::new(
            JobId::generate(),
            "pdf",
            "generate-pdf",
            serde_json::json!({}),
            settings(1, Backoff::fixed(Duration::ZERO)),
            0,
            Duration::ZERO,
        )
        .unwrap();
        let now = Utc::now();
        job.state = JobState::Active;
        job.lease = Some(Lease {
            token: LockToken::new(),
            expires_at: now - chrono::Duration::seconds(1),
        });

        assert_eq!(job.observed_state(now), JobState::Stalled);
        job.lease = Some(Lease {
            token: LockToken::new(),
            expires_at: now + chrono::Duration::seconds(1),
        });
        assert_eq!(job.observed_state(now), JobState::Active);
    }

    #[test]
    fn failure_step_follows_attempts() {
        let mut job = Job::new(
            JobId::generate(),
            "pdf",
            "generate-pdf",
            serde_json::json!({}),
            settings(3, Backoff::exponential(Duration::from_millis(1000))),
            0,
            Duration::ZERO,
        )
        .unwrap();

        job.attempts = 1;
        assert_eq!(
            job.next_step_after_failure(true),
            FailureStep::Retry {
                delay: Duration::from_millis(1000)
            }
        );
        job.attempts = 2;
        assert_eq!(
            job.next_step_after_failure(true),
            FailureStep::Retry {
                delay: Duration::from_millis(2000)
            }
        );
        job.attempts = 3;
        assert_eq!(job.next_step_after_failure(true), FailureStep::Fail);

        job.attempts = 1;
        assert_eq!(job.next_step_after_failure(false), FailureStep::Fail);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Stalled,
            JobState::Delayed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(
            base in 0u64..10_000,
            cap in 0u64..100_000,
            attempts in 0u32..200,
        ) {
            let backoff = Backoff {
                strategy: BackoffStrategy::Exponential,
                delay: base,
                max_delay: Some(cap),
            };
            prop_assert!(backoff.delay_for_attempt(attempts) <= Duration::from_millis(cap));
        }

        #[test]
        fn exponential_backoff_is_monotonic(base in 1u64..10_000, attempts in 1u32..60) {
            let backoff = Backoff::exponential(Duration::from_millis(base));
            let next = backoff.delay_for_attempt(attempts + 1);
            prop_assert!(backoff.delay_for_attempt(attempts) <= next);
        }
    }
}
