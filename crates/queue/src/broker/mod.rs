//! Broker: the durable store behind every queue.
//!
//! ## Layers
//!
//! - [`Backend`]: atomic job-state transitions against one store (in-memory or Redis).
//!   Backends know nothing about retries, reconnection or buffering.
//! - [`BrokerConnection`]: owns a backend, tracks the connection state machine
//!   (`connecting → ready → reconnecting → ready … → closed`), runs the reconnect
//!   loop and buffers enqueues while disconnected.
//!
//! Queues, worker pools and the watchdog only ever talk to a `BrokerConnection`.

pub mod connection;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
#[cfg(feature = "redis")]
mod scripts;

use std::time::Duration;

use serde_json::Value as JsonValue;

use pdfgen_core::{JobId, LockToken};

use crate::jobs::{AttemptRecord, Job, JobCounts};

pub use connection::{BrokerConnection, BrokerError, BrokerResult, ConnectionState, Submitted};
pub use in_memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

/// Error returned by a backend operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The store is unreachable or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server refused a write because it is a read-only replica
    /// (a failover that hasn't finished promotion).
    #[error("server is read-only: {0}")]
    ReadOnly(String),

    /// The store rejected the command.
    #[error("command error: {0}")]
    Command(String),

    /// A stored record could not be decoded.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl BackendError {
    /// Errors that mean "reconnect", as opposed to "this command is wrong".
    pub fn is_connection_level(&self) -> bool {
        matches!(self, BackendError::Connection(_) | BackendError::ReadOnly(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Result of persisting a new job.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// Stored; the snapshot carries the broker-assigned `seq`.
    Added(Job),
    /// A non-terminal job with the same id already exists; nothing was written.
    Duplicate(Job),
}

/// Terminal success of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub result: JsonValue,
    pub finished_at_ms: i64,
    pub history: Vec<AttemptRecord>,
    /// Retention: keep at most this many completed jobs (`None` keeps all).
    pub keep: Option<u32>,
}

/// Failed attempt, either retried or terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error: String,
    pub finished_at_ms: i64,
    pub history: Vec<AttemptRecord>,
    /// `Some` to retry: the job is eligible again at this instant.
    pub retry_at_ms: Option<i64>,
    /// Retention for the terminal case: keep at most this many failed jobs.
    pub keep: Option<u32>,
}

/// What the watchdog did with one expired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledRecovery {
    pub job_id: JobId,
    pub job_name: String,
    /// Attempts after recovery (a requeue rolls back the interrupted one).
    pub attempts: u32,
    pub stalled_count: u32,
    pub outcome: StalledOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalledOutcome {
    /// Moved back to `waiting`.
    Requeued,
    /// Exceeded `max_stalled_count`; moved to `failed`.
    Failed,
}

/// How long a terminal outcome stays readable after retention deleted the job.
pub const FINISHED_OUTCOME_TTL: Duration = Duration::from_secs(60 * 60);

/// Result or error of a job whose record was removed by retention.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishedOutcome {
    Completed(JsonValue),
    Failed(String),
}

/// Terminal error recorded on a job the watchdog gave up on.
pub const STALLED_TOO_MANY_TIMES: &str =
    "StalledTooManyTimes: job lease expired more often than allowed";

/// Atomic job-state transitions against one store.
///
/// Every method is a single atomic step from the point of view of other callers
/// (one critical section in memory, one Lua script in Redis). Methods that act
/// on an active job take the lease token and return `false` when the caller no
/// longer holds the lease.
pub trait Backend: Send + Sync {
    /// (Re-)establish the underlying connection.
    fn connect(&self) -> BackendResult<()>;

    /// Readiness handshake: succeeds only when the server can serve commands.
    fn ping(&self) -> BackendResult<()>;

    /// Drop the underlying connection (no-op when not connected).
    fn disconnect(&self);

    /// Create the queue's bookkeeping structures (idempotent).
    fn ensure_queue(&self, queue: &str) -> BackendResult<()>;

    /// Whether the queue's bookkeeping structures exist in the store.
    fn queue_exists(&self, queue: &str) -> BackendResult<bool>;

    /// Persist a new job in `waiting` (or `delayed`).
    ///
    /// An existing job with the same id that is not terminal wins: nothing is
    /// written and `Duplicate` is returned. A terminal one is replaced.
    fn add_job(&self, job: &Job, now_ms: i64) -> BackendResult<AddOutcome>;

    /// Promote due delayed jobs, then move the highest-priority, oldest waiting
    /// job to `active` under a lease expiring at `now_ms + lock_ms`.
    fn claim_next(
        &self,
        queue: &str,
        token: LockToken,
        now_ms: i64,
        lock_ms: u64,
    ) -> BackendResult<Option<Job>>;

    fn renew_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        until_ms: i64,
    ) -> BackendResult<bool>;

    fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        completion: &Completion,
    ) -> BackendResult<bool>;

    fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        failure: &Failure,
    ) -> BackendResult<bool>;

    /// Requeue (or fail) every active job whose lease expired before `now_ms`.
    fn recover_stalled(
        &self,
        queue: &str,
        now_ms: i64,
        max_stalled_count: u32,
    ) -> BackendResult<Vec<StalledRecovery>>;

    fn get_job(&self, queue: &str, job_id: &JobId) -> BackendResult<Option<Job>>;

    /// Outcome of a finished job that retention already deleted, kept for
    /// [`FINISHED_OUTCOME_TTL`] after the deletion.
    fn finished_outcome(
        &self,
        queue: &str,
        job_id: &JobId,
        now_ms: i64,
    ) -> BackendResult<Option<FinishedOutcome>>;

    fn counts(&self, queue: &str) -> BackendResult<JobCounts>;
}

/// Rank used to order the waiting set: higher priority first, then FIFO by `seq`.
///
/// The Lua scripts compute the same value as the sorted-set score.
pub(crate) fn waiting_rank(priority: u8, seq: u64) -> u64 {
    ((255 - priority as u64) << 40) + seq
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_rank_orders_priority_then_seq() {
        assert!(waiting_rank(10, 500) < waiting_rank(0, 1));
        assert!(waiting_rank(0, 1) < waiting_rank(0, 2));
    }

    #[test]
    fn connection_level_errors() {
        assert!(BackendError::Connection("x".into()).is_connection_level());
        assert!(BackendError::ReadOnly("x".into()).is_connection_level());
        assert!(!BackendError::Command("x".into()).is_connection_level());
    }
}
