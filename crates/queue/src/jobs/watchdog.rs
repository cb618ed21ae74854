//! Stalled-job watchdog: recovers jobs whose worker stopped renewing its lease.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use pdfgen_core::now_millis;
use pdfgen_events::{EventBus, JobEvent, JobEventKind};

use super::events::EventSink;
use crate::broker::{
    BrokerConnection, BrokerResult, StalledOutcome, StalledRecovery, STALLED_TOO_MANY_TIMES,
};

/// Periodically requeues (or fails) active jobs whose lease expired.
#[derive(Debug)]
pub struct StalledJobWatchdog {
    broker: Arc<BrokerConnection>,
    queue: String,
    interval: Duration,
    max_stalled_count: u32,
    events: EventSink,
}

impl StalledJobWatchdog {
    pub fn new(
        broker: Arc<BrokerConnection>,
        queue: impl Into<String>,
        interval: Duration,
        max_stalled_count: u32,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            interval,
            max_stalled_count,
            events: EventSink::default(),
        }
    }

    pub fn with_events<B>(mut self, bus: B) -> Self
    where
        B: EventBus<JobEvent> + 'static,
    {
        self.events = EventSink::new(bus);
        self
    }

    pub(crate) fn with_sink(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// One scan. Fails fast when the broker is not ready.
    pub fn check_once(&self) -> BrokerResult<Vec<StalledRecovery>> {
        let recovered = self.broker.try_call(|b| {
            b.recover_stalled(&self.queue, now_millis(), self.max_stalled_count)
        })?;

        for recovery in &recovered {
            let kind = match recovery.outcome {
                StalledOutcome::Requeued => {
                    warn!(
                        queue = %self.queue,
                        job_id = %recovery.job_id,
                        job_name = %recovery.job_name,
                        stalled_count = recovery.stalled_count,
                        "stalled job moved back to waiting"
                    );
                    JobEventKind::Stalled {
                        stalled_count: recovery.stalled_count,
                    }
                }
                StalledOutcome::Failed => {
                    warn!(
                        queue = %self.queue,
                        job_id = %recovery.job_id,
                        job_name = %recovery.job_name,
                        stalled_count = recovery.stalled_count,
                        "job stalled too many times; failed"
                    );
                    JobEventKind::Failed {
                        attempts: recovery.attempts,
                        error: STALLED_TOO_MANY_TIMES.to_string(),
                        stalled: true,
                    }
                }
            };
            self.events.emit(JobEvent::new(
                self.queue.clone(),
                recovery.job_id.clone(),
                recovery.job_name.clone(),
                kind,
            ));
        }

        Ok(recovered)
    }

    /// Run [`check_once`](Self::check_once) every `interval` on a background thread.
    pub fn spawn(self) -> WatchdogHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(format!("{}-stalled-watchdog", self.queue))
            .spawn(move || watchdog_loop(self, shutdown_rx))
            .expect("failed to spawn stalled-job watchdog thread");

        WatchdogHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn watchdog_loop(watchdog: StalledJobWatchdog, shutdown_rx: mpsc::Receiver<()>) {
    info!(queue = %watchdog.queue, interval = ?watchdog.interval, "stalled-job watchdog started");

    loop {
        match shutdown_rx.recv_timeout(watchdog.interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if !watchdog.broker.is_ready() {
            debug!(queue = %watchdog.queue, "broker not ready; skipping stalled check");
            continue;
        }

        match watchdog.check_once() {
            Ok(recovered) if !recovered.is_empty() => {
                info!(
                    queue = %watchdog.queue,
                    recovered = recovered.len(),
                    "stalled check recovered jobs"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(queue = %watchdog.queue, error = %e, "stalled check failed"),
        }
    }

    info!(queue = %watchdog.queue, "stalled-job watchdog stopped");
}

/// Handle to a running watchdog thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct WatchdogHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.shutdown.send(());
            let _ = join.join();
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
