use agentcore_ai::{EventSink, RunEvent};
use async_trait::async_trait;

use crate::bus::StreamBus;

/// Mirrors every run event into the run's response log.
///
/// A failed write does not interrupt the run; the first failure is kept so
/// the caller can close the run as failed once it returns.
pub struct BusSink {
    bus: StreamBus,
    run_id: String,
    failure: Option<String>,
    dropped: usize,
}

impl BusSink {
    pub fn new(bus: StreamBus, run_id: impl Into<String>) -> Self {
        Self {
            bus,
            run_id: run_id.into(),
            failure: None,
            dropped: 0,
        }
    }

    /// First publish error, if any event could not be logged.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[async_trait]
impl EventSink for BusSink {
    async fn emit(&mut self, event: RunEvent) {
        if let Err(error) = self.bus.push_event(&self.run_id, &event) {
            tracing::error!(run_id = %self.run_id, error = %error, "Failed to publish run event");
            self.dropped += 1;
            if self.failure.is_none() {
                self.failure = Some(error.to_string());
            }
        }
    }
}
