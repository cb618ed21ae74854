//! Optional job-event publishing shared by the worker pool and the watchdog.

use std::sync::Arc;

use tracing::warn;

use pdfgen_events::{EventBus, JobEvent};

/// Object-safe view of an `EventBus<JobEvent>` (the bus trait has an
/// associated error type).
trait Notify: Send + Sync {
    fn notify(&self, event: JobEvent) -> Result<(), String>;
}

impl<B> Notify for B
where
    B: EventBus<JobEvent>,
{
    fn notify(&self, event: JobEvent) -> Result<(), String> {
        self.publish(event).map_err(|e| format!("{e:?}"))
    }
}

/// Where job notifications go; a no-op until a bus is attached.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    bus: Option<Arc<dyn Notify>>,
}

impl EventSink {
    pub fn new<B>(bus: B) -> Self
    where
        B: EventBus<JobEvent> + 'static,
    {
        Self {
            bus: Some(Arc::new(bus)),
        }
    }

    /// Publish, logging (never propagating) failures.
    pub fn emit(&self, event: JobEvent) {
        let Some(bus) = &self.bus else {
            return;
        };
        let job_id = event.job_id.clone();
        if let Err(error) = bus.notify(event) {
            warn!(job_id = %job_id, error = %error, "failed to publish job event");
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("attached", &self.bus.is_some())
            .finish()
    }
}
