//! Durable job queue for background document generation.
//!
//! A [`BrokerConnection`](broker::BrokerConnection) wraps a storage backend
//! (in-memory, or Redis with the `redis` feature). [`Queue`](jobs::Queue) adds
//! jobs, [`WorkerPool`](jobs::WorkerPool) runs them, and the
//! [`StalledJobWatchdog`](jobs::StalledJobWatchdog) recovers jobs whose worker
//! went away.

pub mod broker;
pub mod config;
pub mod health;
pub mod jobs;


pub use broker::{BrokerConnection, BrokerError, ConnectionState, InMemoryBackend};
pub use config::{BrokerConfig, ConfigError};
pub use health::{health_check, HealthStatus};
pub use jobs::{
    DefaultJobOptions, Enqueued, HandlerError, Job, JobContext, JobHandler, JobOptions, JobState,
    Queue, QueueError, WorkerPool, WorkerPoolConfig,
};
