//! Health check for readiness and liveness endpoints.

use serde::Serialize;

use crate::broker::{BrokerConnection, ConnectionState};
use crate::jobs::{JobCounts, Queue};

/// Point-in-time health of one queue and its broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub broker_state: ConnectionState,
    pub queue_ready: bool,
    /// Most recent connection error, or the error from the count query.
    pub last_error: Option<String>,
    /// `None` when counts could not be read.
    pub counts: Option<JobCounts>,
    pub offline_queue_len: usize,
}

impl HealthStatus {
    /// Connected, initialized, and counts were readable.
    pub fn is_accepting_work(&self) -> bool {
        self.broker_state == ConnectionState::Ready && self.queue_ready && self.counts.is_some()
    }
}

/// Probe the broker and queue. Never fails and never blocks on a reconnect.
pub fn health_check(broker: &BrokerConnection, queue: &Queue) -> HealthStatus {
    let counts = broker.try_call(|b| b.counts(queue.name()));
    let broker_state = broker.state();
    let mut last_error = broker.last_error();

    let counts = match counts {
        Ok(counts) => Some(counts),
        Err(e) => {
            last_error = Some(e.to_string());
            None
        }
    };

    HealthStatus {
        broker_state,
        queue_ready: queue.is_ready(),
        last_error,
        counts,
        offline_queue_len: broker.offline_len(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::InMemoryBackend;
    use crate::config::BrokerConfig;
    use crate::jobs::DefaultJobOptions;

    #[test]
    fn healthy_queue_accepts_work() {
        let backend = InMemoryBackend::arc();
        let broker = BrokerConnection::connect(backend, BrokerConfig::default()).unwrap();
        let queue = Queue::new(broker.clone(), "pdf", DefaultJobOptions::single_attempt());
        queue.init().unwrap();

        let status = health_check(&broker, &queue);
        assert!(status.is_accepting_work());
        assert_eq!(status.counts, Some(JobCounts::default()));
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn uninitialized_queue_reports_error_instead_of_failing() {
        let backend = InMemoryBackend::arc();
        let broker = BrokerConnection::connect(backend, BrokerConfig::default()).unwrap();
        let queue = Queue::new(broker.clone(), "pdf", DefaultJobOptions::single_attempt());

        let status = queue.health_check();
        assert!(!status.queue_ready);
        assert!(status.counts.is_none());
        assert!(status.last_error.is_some());
        assert!(!status.is_accepting_work());
    }

    #[test]
    fn outage_is_visible() {
        let backend = InMemoryBackend::arc();
        let config = BrokerConfig::default().with_retry_delay(|_| Duration::from_millis(10));
        let broker = BrokerConnection::connect(backend.clone(), config).unwrap();
        let queue = Queue::new(broker.clone(), "pdf", DefaultJobOptions::single_attempt());
        queue.init().unwrap();

        backend.set_available(false);
        let status = health_check(&broker, &queue);
        assert_eq!(status.broker_state, ConnectionState::Reconnecting);
        assert!(status.last_error.is_some());
        assert!(!status.is_accepting_work());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["broker_state"], "reconnecting");
    }
}
