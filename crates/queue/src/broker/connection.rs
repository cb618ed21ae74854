//! Broker connection: state machine, reconnect loop and offline buffer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use pdfgen_core::now_millis;

use super::{AddOutcome, Backend, BackendError};
use crate::config::BrokerConfig;
use crate::jobs::Job;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Not connected, and the command could not be buffered or waited out.
    #[error("broker connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// The connection was shut down.
    #[error("broker connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`BrokerConnection::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    Added(Job),
    /// A non-terminal job with the same id already exists.
    Duplicate(Job),
    /// Held in the offline buffer until the connection is ready again.
    Buffered(Job),
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    last_error: Option<String>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: BrokerConfig,
    status: Mutex<Status>,
    changed: Condvar,
    /// Lock order: `offline` before `status`.
    offline: Mutex<VecDeque<Job>>,
    /// Lock order: `status` before `reconnect`.
    reconnect: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Shared connection to one broker backend.
///
/// Created through [`BrokerConnection::connect`], which only returns once the
/// backend is reachable. Afterwards any connection-level error flips the state to
/// `reconnecting` and starts a single background reconnect thread; commands issued
/// meanwhile either wait, are buffered (enqueues) or fail, depending on the config.
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    /// Open the backend, retrying up to `config.connect_attempts` times.
    #[instrument(skip(backend, config), fields(url = %config.redis_url()))]
    pub fn connect(backend: Arc<dyn Backend>, config: BrokerConfig) -> BrokerResult<Arc<Self>> {
        let attempts = config.connect_attempts.max(1);
        let inner = Arc::new(Inner {
            backend,
            config,
            status: Mutex::new(Status {
                state: ConnectionState::Connecting,
                last_error: None,
            }),
            changed: Condvar::new(),
            offline: Mutex::new(VecDeque::new()),
            reconnect: Mutex::new(None),
        });

        for attempt in 1..=attempts {
            match inner.open() {
                Ok(()) => {
                    inner.set_state(ConnectionState::Ready);
                    info!(attempt, "broker connection ready");
                    return Ok(Arc::new(Self { inner }));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "broker connection attempt failed");
                    inner.status().last_error = Some(e.to_string());
                    if attempt < attempts {
                        thread::sleep(inner.config.retry_delay(attempt));
                    }
                }
            }
        }

        let reason = inner
            .status()
            .last_error
            .clone()
            .unwrap_or_else(|| "no connection attempt made".to_string());
        inner.backend.disconnect();
        inner.set_state(ConnectionState::Closed);
        Err(BrokerError::ConnectionUnavailable(reason))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.status().last_error.clone()
    }

    /// Number of enqueues waiting for the connection to come back.
    pub fn offline_len(&self) -> usize {
        self.inner.offline().len()
    }

    /// Block until the connection is ready, closed, or `timeout` elapses.
    /// Returns whether it is ready.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let status = self.inner.status();
        let (status, _) = self
            .inner
            .changed
            .wait_timeout_while(status, timeout, |s| {
                !matches!(s.state, ConnectionState::Ready | ConnectionState::Closed)
            })
            .unwrap();
        status.state == ConnectionState::Ready
    }

    /// Run `op` against the backend, waiting out reconnects.
    ///
    /// While the connection is down the caller blocks until it is ready again;
    /// with `max_retries_per_request = Some(n)` the wait is bounded by
    /// `n × command_timeout`. With the offline queue disabled, the call fails
    /// immediately instead.
    pub fn call<T, F>(&self, op: F) -> BrokerResult<T>
    where
        F: Fn(&dyn Backend) -> Result<T, BackendError>,
    {
        let config = &self.inner.config;
        let deadline = config
            .max_retries_per_request
            .map(|n| Instant::now() + config.command_timeout.saturating_mul(n));

        loop {
            self.inner.wait_ready(deadline)?;
            match op(self.inner.backend.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_level() => self.inner.connection_lost(&e),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `op` only if the connection is ready right now.
    pub fn try_call<T, F>(&self, op: F) -> BrokerResult<T>
    where
        F: FnOnce(&dyn Backend) -> Result<T, BackendError>,
    {
        {
            let status = self.inner.status();
            match status.state {
                ConnectionState::Ready => {}
                ConnectionState::Closed => return Err(BrokerError::ConnectionClosed),
                _ => return Err(unavailable(&status)),
            }
        }

        op(self.inner.backend.as_ref()).map_err(|e| {
            if e.is_connection_level() {
                self.inner.connection_lost(&e);
            }
            e.into()
        })
    }

    /// Persist a new job, or buffer it while disconnected.
    pub fn submit(&self, job: Job) -> BrokerResult<Submitted> {
        loop {
            {
                let mut offline = self.inner.offline();
                let status = self.inner.status();
                match status.state {
                    ConnectionState::Ready => {}
                    ConnectionState::Closed => return Err(BrokerError::ConnectionClosed),
                    _ if !self.inner.config.enable_offline_queue => {
                        return Err(unavailable(&status));
                    }
                    _ if offline.len() >= self.inner.config.offline_queue_limit => {
                        return Err(BrokerError::ConnectionUnavailable(format!(
                            "offline queue full ({} jobs)",
                            offline.len()
                        )));
                    }
                    _ => {
                        debug!(
                            queue = %job.queue,
                            job_id = %job.id,
                            "buffering job while disconnected"
                        );
                        offline.push_back(job.clone());
                        return Ok(Submitted::Buffered(job));
                    }
                }
            }

            match self.inner.backend.add_job(&job, now_millis()) {
                Ok(AddOutcome::Added(stored)) => return Ok(Submitted::Added(stored)),
                Ok(AddOutcome::Duplicate(existing)) => return Ok(Submitted::Duplicate(existing)),
                Err(e) if e.is_connection_level() => self.inner.connection_lost(&e),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the connection: stop reconnecting, release waiters, drop the socket.
    ///
    /// Jobs still in the offline buffer are discarded.
    pub fn shutdown(&self) {
        {
            let mut status = self.inner.status();
            if status.state == ConnectionState::Closed {
                return;
            }
            status.state = ConnectionState::Closed;
        }
        self.inner.changed.notify_all();

        let handle = self.inner.reconnect.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let dropped = {
            let mut offline = self.inner.offline();
            let n = offline.len();
            offline.clear();
            n
        };
        if dropped > 0 {
            warn!(dropped, "discarding buffered jobs on shutdown");
        }

        self.inner.backend.disconnect();
        info!("broker connection closed");
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status();
        f.debug_struct("BrokerConnection")
            .field("state", &status.state)
            .field("last_error", &status.last_error)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn unavailable(status: &Status) -> BrokerError {
    BrokerError::ConnectionUnavailable(
        status
            .last_error
            .clone()
            .unwrap_or_else(|| format!("connection is {}", status.state)),
    )
}

impl Inner {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap()
    }

    fn offline(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.offline.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status().state = state;
        self.changed.notify_all();
    }

    /// Connect, then run the readiness handshake when enabled.
    fn open(&self) -> Result<(), BackendError> {
        self.backend.connect()?;
        if self.config.enable_ready_check {
            self.backend.ping()?;
        }
        Ok(())
    }

    fn wait_ready(&self, deadline: Option<Instant>) -> BrokerResult<()> {
        let mut status = self.status();
        loop {
            match status.state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => return Err(BrokerError::ConnectionClosed),
                _ if !self.config.enable_offline_queue => return Err(unavailable(&status)),
                _ => {}
            }

            let wait = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(unavailable(&status));
                    }
                    left.min(self.config.command_timeout)
                }
                None => self.config.command_timeout,
            };
            status = self.changed.wait_timeout(status, wait).unwrap().0;
        }
    }

    /// Record a connection-level failure; the first one while `ready` starts the
    /// reconnect thread.
    fn connection_lost(self: &Arc<Self>, err: &BackendError) {
        let mut status = self.status();
        status.last_error = Some(err.to_string());
        if status.state != ConnectionState::Ready {
            return;
        }
        status.state = ConnectionState::Reconnecting;
        warn!(error = %err, "broker connection lost; reconnecting");

        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("broker-reconnect".to_string())
            .spawn(move || reconnect_loop(inner))
            .expect("failed to spawn broker reconnect thread");

        // Stored before the status lock is released so `shutdown`, which flips
        // to `closed` under that lock, always finds and joins the handle.
        let previous = self.reconnect.lock().unwrap().replace(handle);
        drop(status);

        // The previous reconnect thread already set `ready` and is exiting.
        if let Some(previous) = previous {
            let _ = previous.join();
        }
    }

    /// Push buffered jobs to the backend in order, then flip to `ready`.
    ///
    /// Holding the offline lock across the state change keeps a concurrent
    /// `submit` from buffering a job that would never be flushed.
    fn flush_and_mark_ready(&self) -> Result<(), BackendError> {
        let mut offline = self.offline();
        let total = offline.len();

        while let Some(job) = offline.front() {
            match self.backend.add_job(job, now_millis()) {
                Ok(AddOutcome::Added(stored)) => {
                    debug!(queue = %stored.queue, job_id = %stored.id, "flushed buffered job");
                }
                Ok(AddOutcome::Duplicate(existing)) => {
                    warn!(
                        queue = %existing.queue,
                        job_id = %existing.id,
                        "buffered job already exists; dropped"
                    );
                }
                Err(e) if e.is_connection_level() => return Err(e),
                Err(e) => {
                    error!(
                        queue = %job.queue,
                        job_id = %job.id,
                        error = %e,
                        "failed to flush buffered job; dropped"
                    );
                }
            }
            offline.pop_front();
        }

        let mut status = self.status();
        if status.state == ConnectionState::Closed {
            return Ok(());
        }
        status.state = ConnectionState::Ready;
        drop(status);
        self.changed.notify_all();

        if total > 0 {
            info!(flushed = total, "offline queue flushed");
        }
        Ok(())
    }
}

fn reconnect_loop(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let delay = inner.config.retry_delay(attempt);

        {
            let status = inner.status();
            let (status, _) = inner
                .changed
                .wait_timeout_while(status, delay, |s| s.state != ConnectionState::Closed)
                .unwrap();
            if status.state == ConnectionState::Closed {
                debug!("reconnect loop stopped by shutdown");
                return;
            }
        }

        inner.backend.disconnect();
        let result = inner.open().and_then(|()| inner.flush_and_mark_ready());

        match result {
            Ok(()) => {
                info!(attempt, "broker connection re-established");
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                inner.status().last_error = Some(e.to_string());
                inner.changed.notify_all();
            }
        }
    }
}
