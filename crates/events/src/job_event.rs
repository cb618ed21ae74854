//! Job lifecycle notifications published by workers and the stalled-job watchdog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pdfgen_core::JobId;

/// A notification about one job's lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub queue: String,
    pub job_id: JobId,
    pub job_name: String,
    pub kind: JobEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// A worker claimed the job.
    Active { attempt: u32 },
    /// The handler succeeded; the result is stored on the job.
    Completed { result: JsonValue },
    /// The attempt failed and the job will be retried after `delay_ms`.
    Retrying {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// The job reached its terminal `failed` state.
    ///
    /// `stalled` is true when the watchdog gave up on the job rather than the handler.
    Failed {
        attempts: u32,
        error: String,
        stalled: bool,
    },
    /// The job's lease expired and the watchdog put it back in `waiting`.
    Stalled { stalled_count: u32 },
}

impl JobEvent {
    pub fn new(
        queue: impl Into<String>,
        job_id: JobId,
        job_name: impl Into<String>,
        kind: JobEventKind,
    ) -> Self {
        Self {
            queue: queue.into(),
            job_id,
            job_name: job_name.into(),
            kind,
            at: Utc::now(),
        }
    }

    /// True for the notifications after which the job will not run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::Completed { .. } | JobEventKind::Failed { .. }
        )
    }
}
