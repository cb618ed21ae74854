//! Worker pool: claims jobs, runs handlers, renews leases, records outcomes.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use pdfgen_core::{millis_after, now_millis, to_millis, JobId, LockToken};
use pdfgen_events::{EventBus, JobEvent, JobEventKind};

use super::events::EventSink;
use super::types::{AttemptRecord, FailureStep, Job};
use super::watchdog::{StalledJobWatchdog, WatchdogHandle};
use crate::broker::{BrokerConnection, Completion, Failure};

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Retried while attempts remain.
    #[error("{0}")]
    Failed(String),

    /// Fails the job immediately, whatever attempts remain.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        HandlerError::Unrecoverable(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{err:#}"))
    }
}

/// What a handler sees of the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(job: Job, cancelled: Arc<AtomicBool>) -> Self {
        Self { job, cancelled }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Decode the payload; a payload that doesn't fit will never succeed, so
    /// the error is unrecoverable.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.job.payload.clone())
            .map_err(|e| HandlerError::Unrecoverable(format!("invalid payload: {e}")))
    }

    /// 1-indexed number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    /// Set when the pool shuts down or the lease was lost. Long-running
    /// handlers should check it and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub type HandlerResult = Result<JsonValue, HandlerError>;

/// Runs one kind of job.
pub trait JobHandler: Send + Sync {
    fn handle(&self, ctx: &JobContext) -> HandlerResult;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &JobContext) -> HandlerResult {
        self(ctx)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Thread-name and log prefix.
    pub name: String,
    pub lock_duration: Duration,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    /// Start a stalled-job watchdog with the pool.
    pub run_watchdog: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "pdf-worker".to_string(),
            lock_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            run_watchdog: true,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    pub fn with_watchdog(mut self, enabled: bool) -> Self {
        self.run_watchdog = enabled;
        self
    }

    fn renew_interval(&self) -> Duration {
        (self.lock_duration / 2).max(Duration::from_millis(10))
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Lease held by a running job.
struct InFlight {
    token: LockToken,
    cancelled: Arc<AtomicBool>,
}

struct PoolShared {
    broker: Arc<BrokerConnection>,
    queue: String,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    events: EventSink,
    config: WorkerPoolConfig,
    in_flight: Mutex<HashMap<JobId, InFlight>>,
    stats: Mutex<PoolStats>,
    started: Instant,
}

/// Consumes one queue with registered handlers.
pub struct WorkerPool {
    broker: Arc<BrokerConnection>,
    queue: String,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    concurrency: usize,
    events: EventSink,
}

impl WorkerPool {
    pub fn new(broker: Arc<BrokerConnection>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            handlers: HashMap::new(),
            concurrency: 0,
            events: EventSink::default(),
        }
    }

    /// Publish job notifications on `bus`.
    pub fn with_events<B>(mut self, bus: B) -> Self
    where
        B: EventBus<JobEvent> + 'static,
    {
        self.events = EventSink::new(bus);
        self
    }

    /// Register the handler for jobs named `job_name`, adding `concurrency`
    /// worker slots to the pool.
    pub fn register_handler<H>(
        &mut self,
        job_name: impl Into<String>,
        handler: H,
        concurrency: usize,
    ) where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_name.into(), Arc::new(handler));
        self.concurrency += concurrency.max(1);
    }

    /// Total worker slots.
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Start the worker slots, the lock extender and (optionally) the watchdog.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let slots = self.concurrency();
        let watchdog = config.run_watchdog.then(|| {
            StalledJobWatchdog::new(
                Arc::clone(&self.broker),
                self.queue.clone(),
                config.stalled_interval,
                config.max_stalled_count,
            )
            .with_sink(self.events.clone())
            .spawn()
        });

        let shared = Arc::new(PoolShared {
            broker: self.broker,
            queue: self.queue,
            handlers: self.handlers,
            events: self.events,
            config,
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(PoolStats::default()),
            started: Instant::now(),
        });

        let mut workers = Vec::with_capacity(slots);
        for slot in 0..slots {
            let (tx, rx) = mpsc::channel::<()>();
            let worker_name = format!("{}-{slot}", shared.config.name);
            let worker_shared = Arc::clone(&shared);
            let join = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || worker_loop(worker_shared, worker_name, rx))
                .expect("failed to spawn worker thread");
            workers.push((tx, join));
        }

        let (tx, rx) = mpsc::channel::<()>();
        let extender_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(format!("{}-lock-extender", shared.config.name))
            .spawn(move || lock_extender_loop(extender_shared, rx))
            .expect("failed to spawn lock extender thread");

        info!(
            pool = %shared.config.name,
            queue = %shared.queue,
            slots,
            handlers = shared.handlers.len(),
            "worker pool started"
        );

        WorkerPoolHandle {
            shared,
            workers,
            extender: Some((tx, join)),
            watchdog,
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue)
            .field("handlers", &names)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

type Stop = (mpsc::Sender<()>, thread::JoinHandle<()>);

/// Handle to control a running pool.
///
/// Dropping the handle stops the pool the same way [`shutdown`](Self::shutdown) does.
pub struct WorkerPoolHandle {
    shared: Arc<PoolShared>,
    workers: Vec<Stop>,
    extender: Option<Stop>,
    watchdog: Option<WatchdogHandle>,
}

impl WorkerPoolHandle {
    /// Stop claiming, let in-flight handlers finish, join every thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Like [`shutdown`](Self::shutdown), but first flags every in-flight job as
    /// cancelled so cooperative handlers return early.
    pub fn shutdown_now(mut self) {
        for in_flight in self.shared.in_flight.lock().unwrap().values() {
            in_flight.cancelled.store(true, Ordering::SeqCst);
        }
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() && self.extender.is_none() && self.watchdog.is_none() {
            return;
        }
        for (tx, _) in &self.workers {
            let _ = tx.send(());
        }
        for (_, join) in self.workers.drain(..) {
            let _ = join.join();
        }

        // Leases are renewed until the last handler has returned.
        if let Some((tx, join)) = self.extender.take() {
            let _ = tx.send(());
            let _ = join.join();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.shutdown();
        }
        info!(pool = %self.shared.config.name, "worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.shared.stats.lock().unwrap().clone();
        stats.uptime_secs = self.shared.started.elapsed().as_secs();
        stats
    }
}

impl Drop for WorkerPoolHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolHandle")
            .field("pool", &self.shared.config.name)
            .field("workers", &self.workers.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Sleep for `timeout` unless told to stop. Returns `true` to stop.
fn stop_requested(rx: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    !matches!(rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn worker_loop(shared: Arc<PoolShared>, worker: String, shutdown_rx: mpsc::Receiver<()>) {
    debug!(worker = %worker, "worker started");
    let lock_ms = saturating_millis(shared.config.lock_duration);

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        if !shared.broker.is_ready() {
            if stop_requested(&shutdown_rx, shared.config.poll_interval) {
                break;
            }
            continue;
        }

        let token = LockToken::new();
        match shared
            .broker
            .try_call(|b| b.claim_next(&shared.queue, token, now_millis(), lock_ms))
        {
            Ok(Some(job)) => process(&shared, &worker, job, token),
            Ok(None) => {
                if stop_requested(&shutdown_rx, shared.config.poll_interval) {
                    break;
                }
            }
            Err(e) => {
                warn!(worker = %worker, queue = %shared.queue, error = %e, "failed to claim job");
                if stop_requested(&shutdown_rx, shared.config.poll_interval) {
                    break;
                }
            }
        }
    }

    debug!(worker = %worker, "worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn process(shared: &PoolShared, worker: &str, job: Job, token: LockToken) {
    let cancelled = Arc::new(AtomicBool::new(false));
    shared.in_flight.lock().unwrap().insert(
        job.id.clone(),
        InFlight {
            token,
            cancelled: Arc::clone(&cancelled),
        },
    );
    shared.stats.lock().unwrap().current_running += 1;

    debug!(
        worker = %worker,
        job_id = %job.id,
        job_name = %job.name,
        attempt = job.attempts,
        "claimed job"
    );
    shared.events.emit(JobEvent::new(
        shared.queue.clone(),
        job.id.clone(),
        job.name.clone(),
        JobEventKind::Active {
            attempt: job.attempts,
        },
    ));

    let started = Utc::now();
    let outcome = match shared.handlers.get(&job.name) {
        Some(handler) => {
            let ctx = JobContext::new(job.clone(), cancelled);
            panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx))).unwrap_or_else(
                |payload| {
                    Err(HandlerError::Failed(format!(
                        "handler panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                },
            )
        }
        None => Err(HandlerError::Unrecoverable(format!(
            "no handler registered for job `{}`",
            job.name
        ))),
    };
    let finished = Utc::now();

    shared.in_flight.lock().unwrap().remove(&job.id);
    finalize(shared, worker, &job, token, outcome, started, finished);

    let mut stats = shared.stats.lock().unwrap();
    stats.current_running = stats.current_running.saturating_sub(1);
    stats.jobs_processed += 1;
}

fn finalize(
    shared: &PoolShared,
    worker: &str,
    job: &Job,
    token: LockToken,
    outcome: Result<JsonValue, HandlerError>,
    started: chrono::DateTime<Utc>,
    finished: chrono::DateTime<Utc>,
) {
    let finished_at_ms = to_millis(finished);

    let (recorded, event) = match outcome {
        Ok(result) => {
            let completion = Completion {
                result: result.clone(),
                finished_at_ms,
                history: job.history_with(AttemptRecord::new(
                    job.attempts,
                    started,
                    finished,
                    None,
                )),
                keep: job.settings.remove_on_complete,
            };
            let recorded = shared
                .broker
                .call(|b| b.complete(&shared.queue, &job.id, token, &completion));
            if matches!(recorded, Ok(true)) {
                shared.stats.lock().unwrap().jobs_succeeded += 1;
                debug!(worker = %worker, job_id = %job.id, "job completed");
            }
            (recorded, JobEventKind::Completed { result })
        }
        Err(err) => {
            let message = err.to_string();
            let step = job.next_step_after_failure(err.is_retryable());
            let retry_at_ms = match step {
                FailureStep::Retry { delay } => Some(millis_after(finished_at_ms, delay)),
                FailureStep::Fail => None,
            };
            let failure = Failure {
                error: message.clone(),
                finished_at_ms,
                history: job.history_with(AttemptRecord::new(
                    job.attempts,
                    started,
                    finished,
                    Some(message.clone()),
                )),
                retry_at_ms,
                keep: job.settings.remove_on_fail,
            };
            let recorded = shared
                .broker
                .call(|b| b.fail(&shared.queue, &job.id, token, &failure));

            let event = match step {
                FailureStep::Retry { delay } => {
                    if matches!(recorded, Ok(true)) {
                        shared.stats.lock().unwrap().jobs_retried += 1;
                        debug!(
                            worker = %worker,
                            job_id = %job.id,
                            attempt = job.attempts,
                            delay_ms = saturating_millis(delay),
                            error = %message,
                            "job failed; retrying"
                        );
                    }
                    JobEventKind::Retrying {
                        attempt: job.attempts,
                        delay_ms: saturating_millis(delay),
                        error: message,
                    }
                }
                FailureStep::Fail => {
                    if matches!(recorded, Ok(true)) {
                        shared.stats.lock().unwrap().jobs_failed += 1;
                        warn!(
                            worker = %worker,
                            job_id = %job.id,
                            job_name = %job.name,
                            attempts = job.attempts,
                            error = %message,
                            "job failed"
                        );
                    }
                    JobEventKind::Failed {
                        attempts: job.attempts,
                        error: message,
                        stalled: false,
                    }
                }
            };
            (recorded, event)
        }
    };

    match recorded {
        Ok(true) => shared.events.emit(JobEvent::new(
            shared.queue.clone(),
            job.id.clone(),
            job.name.clone(),
            event,
        )),
        Ok(false) => warn!(
            worker = %worker,
            job_id = %job.id,
            "lease lost before the outcome was recorded; discarded"
        ),
        Err(e) => error!(
            worker = %worker,
            job_id = %job.id,
            error = %e,
            "failed to record job outcome"
        ),
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock_extender_loop(shared: Arc<PoolShared>, shutdown_rx: mpsc::Receiver<()>) {
    let interval = shared.config.renew_interval();
    let lock_duration = shared.config.lock_duration;

    while !stop_requested(&shutdown_rx, interval) {
        if !shared.broker.is_ready() {
            continue;
        }

        let leases: Vec<(JobId, LockToken, Arc<AtomicBool>)> = shared
            .in_flight
            .lock()
            .unwrap()
            .iter()
            .map(|(id, f)| (id.clone(), f.token, Arc::clone(&f.cancelled)))
            .collect();

        for (job_id, token, cancelled) in leases {
            let until = millis_after(now_millis(), lock_duration);
            match shared
                .broker
                .try_call(|b| b.renew_lease(&shared.queue, &job_id, token, until))
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %job_id, "lease lost; cancelling handler");
                    cancelled.store(true, Ordering::SeqCst);
                }
                Err(e) => debug!(job_id = %job_id, error = %e, "lease renewal failed"),
            }
        }
    }
}
