//! Job queue: producer API, worker pool and stalled-job recovery.
//!
//! ## Components
//!
//! - `Queue`: enqueue jobs, read their state, wait for results
//! - `WorkerPool`: claim jobs, run handlers, renew leases, apply retry policy
//! - `StalledJobWatchdog`: requeue jobs whose worker died mid-flight
//!
//! The broker is the source of truth for every job; the optional event bus only
//! carries notifications.

mod events;
pub mod queue;
pub mod types;
pub mod watchdog;
pub mod worker;

pub use queue::{Enqueued, Queue, QueueError, QueueResult};
pub use types::{
    AttemptRecord, Backoff, BackoffStrategy, DefaultJobOptions, FailureStep, Job, JobCounts,
    JobOptions, JobSettings, JobState, Lease, MAX_BACKOFF_DELAY, MAX_JOB_DELAY,
};
pub use watchdog::{StalledJobWatchdog, WatchdogHandle};
pub use worker::{
    HandlerError, HandlerResult, JobContext, JobHandler, PoolStats, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};
