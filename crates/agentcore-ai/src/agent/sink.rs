use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::events::RunEvent;

/// Receives the events of a run in emission order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&mut self, event: RunEvent);
}

pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&mut self, _event: RunEvent) {}
}

pub struct ChannelSink {
    tx: mpsc::Sender<RunEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: RunEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Keeps every event; used by callers that inspect a run afterwards.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<RunEvent>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&mut self, event: RunEvent) {
        self.events.push(event);
    }
}
