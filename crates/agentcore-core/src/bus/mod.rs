//! Stream bus: per-run response logs, control channels and liveness keys.
//!
//! Response logs and liveness keys are persisted in the bus tables so a
//! subscriber can replay a run from any index. Channels (`STOP`,
//! `END_STREAM`, append notices) are in-process broadcast channels.

mod keys;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use agentcore_ai::RunEvent;
use async_stream::try_stream;
use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::BusStorage;

pub use keys::{
    active_run_key, control_key, ended_key, instance_control_key, responses_key, run_key_prefix,
};
pub use sink::BusSink;

pub const STOP: &str = "STOP";
pub const END_STREAM: &str = "END_STREAM";

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("Failed to encode run event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Malformed entry {index} in the log of run {run_id}: {source}")]
    Decode {
        run_id: String,
        index: u64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Lifetime of response logs and liveness keys.
    pub ttl: Duration,
    /// Entries read per replay batch.
    pub batch_size: usize,
    /// Delay between a run's end and the removal of its log.
    pub cleanup_delay: Duration,
    pub sweep_interval: Duration,
    /// Fallback re-read interval for tails without a notice.
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
            cleanup_delay: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// One entry of a run's response log.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEntry {
    pub index: u64,
    pub event: RunEvent,
}

#[derive(Clone)]
pub struct StreamBus {
    storage: BusStorage,
    config: BusConfig,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

fn millis_after(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

impl StreamBus {
    pub fn new(storage: BusStorage, config: BusConfig) -> Self {
        Self {
            storage,
            config,
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish on a channel. Returns how many listeners received it.
    pub fn publish(&self, channel: &str, message: &str) -> usize {
        self.sender(channel).send(message.to_string()).unwrap_or(0)
    }

    /// Subscribes while the channel entry is locked so a concurrent
    /// release cannot orphan the receiver.
    pub fn subscribe_channel(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop the run's channels that have no listeners left. Returns how many
    /// were removed.
    pub fn release_channels(&self, run_id: &str) -> usize {
        let prefix = run_key_prefix(run_id);
        let keys: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let released = keys
            .iter()
            .filter(|key| {
                self.channels
                    .remove_if(key.as_str(), |_, sender| sender.receiver_count() == 0)
                    .is_some()
            })
            .count();
        debug!(run_id, released, "Released run channels");
        released
    }

    /// Append an event to the run's response log and notify tails.
    pub fn push_event(&self, run_id: &str, event: &RunEvent) -> Result<u64, BusError> {
        let key = responses_key(run_id);
        let bytes = serde_json::to_vec(event).map_err(BusError::Encode)?;
        let index = self.storage.push(&key, &bytes)?;
        if index == 0 {
            self.storage.expire_at(&key, millis_after(self.config.ttl))?;
        }
        self.publish(&key, &index.to_string());
        Ok(index)
    }

    /// Up to `limit` logged events starting at `from_index`.
    pub fn responses(&self, run_id: &str, from_index: u64, limit: usize) -> Result<Vec<BusEntry>, BusError> {
        self.storage
            .range(&responses_key(run_id), from_index, limit)?
            .into_iter()
            .map(|(index, bytes)| decode_entry(run_id, index, &bytes))
            .collect()
    }

    pub fn response_count(&self, run_id: &str) -> Result<u64, BusError> {
        Ok(self.storage.len(&responses_key(run_id))?)
    }

    pub fn is_ended(&self, run_id: &str) -> Result<bool, BusError> {
        Ok(self.storage.get_value(&ended_key(run_id))?.is_some())
    }

    /// Mark the log complete and publish `END_STREAM`.
    pub fn end_stream(&self, run_id: &str) -> Result<(), BusError> {
        let key = ended_key(run_id);
        self.storage
            .set_value(&key, Utc::now().to_rfc3339().as_bytes())?;
        self.storage.expire_at(&key, millis_after(self.config.ttl))?;
        self.publish(&control_key(run_id), END_STREAM);
        debug!(run_id, "Published END_STREAM");
        Ok(())
    }

    /// Replay the log from `since_index`, then follow it until the run ends.
    pub fn subscribe(
        &self,
        run_id: &str,
        since_index: u64,
    ) -> impl Stream<Item = Result<BusEntry, BusError>> + Send + 'static {
        let bus = self.clone();
        let run_id = run_id.to_string();
        // Listen before the first read so no append can slip between them.
        let mut notices = self.subscribe_channel(&responses_key(&run_id));
        let mut control = self.subscribe_channel(&control_key(&run_id));

        try_stream! {
            let mut next = since_index;
            loop {
                let ended = bus.is_ended(&run_id)?;
                let batch = bus.responses(&run_id, next, bus.config.batch_size.max(1))?;
                if !batch.is_empty() {
                    for entry in batch {
                        next = entry.index + 1;
                        yield entry;
                    }
                    continue;
                }
                if ended {
                    break;
                }

                tokio::select! {
                    notice = notices.recv() => {
                        if let Err(RecvError::Closed) = notice {
                            break;
                        }
                    }
                    signal = control.recv() => {
                        if let Err(RecvError::Closed) = signal {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(bus.config.poll_interval) => {}
                }
            }
        }
    }

    /// Ask a run to stop on the global channel and on the channel of every
    /// instance that holds it. Returns the number of live listeners reached.
    pub fn publish_stop(&self, run_id: &str) -> Result<usize, BusError> {
        let mut reached = self.publish(&control_key(run_id), STOP);
        for key in self.storage.value_keys(keys::ACTIVE_RUN_PREFIX)? {
            if let Some(instance) = keys::instance_of_active_key(&key, run_id) {
                reached += self.publish(&instance_control_key(run_id, instance), STOP);
            }
        }
        info!(run_id, reached, "Published STOP");
        Ok(reached)
    }

    /// Record that `instance_id` is executing the run.
    pub fn mark_active(&self, instance_id: &str, run_id: &str) -> Result<(), BusError> {
        let key = active_run_key(instance_id, run_id);
        self.storage
            .set_value(&key, Utc::now().to_rfc3339().as_bytes())?;
        self.storage.expire_at(&key, millis_after(self.config.ttl))?;
        Ok(())
    }

    pub fn clear_active(&self, instance_id: &str, run_id: &str) -> Result<(), BusError> {
        Ok(self.storage.delete_key(&active_run_key(instance_id, run_id))?)
    }

    /// Instances currently holding the run.
    pub fn active_instances(&self, run_id: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .storage
            .value_keys(keys::ACTIVE_RUN_PREFIX)?
            .iter()
            .filter_map(|key| keys::instance_of_active_key(key, run_id).map(str::to_string))
            .collect())
    }

    /// Expire the run's log after the configured cleanup delay.
    pub fn schedule_cleanup(&self, run_id: &str) -> Result<(), BusError> {
        let at = millis_after(self.config.cleanup_delay);
        self.storage.expire_at(&responses_key(run_id), at)?;
        self.storage.expire_at(&ended_key(run_id), at)?;
        debug!(run_id, cleanup_at = at, "Scheduled response log cleanup");
        Ok(())
    }

    /// Drop expired keys and every channel nobody listens on.
    pub fn sweep(&self) -> Result<usize, BusError> {
        let purged = self.storage.purge_expired(Utc::now().timestamp_millis())?;
        self.channels
            .retain(|_, sender| sender.receiver_count() > 0);
        Ok(purged.len())
    }

    pub fn start_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = bus.sweep() {
                            warn!(error = %error, "Bus sweep failed");
                        }
                    }
                }
            }
            debug!("Bus sweeper stopped");
        })
    }
}

fn decode_entry(run_id: &str, index: u64, bytes: &[u8]) -> Result<BusEntry, BusError> {
    let event = serde_json::from_slice(bytes).map_err(|source| BusError::Decode {
        run_id: run_id.to_string(),
        index,
        source,
    })?;
    Ok(BusEntry { index, event })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_ai::StatusType;
    use futures::StreamExt;
    use redb::Database;
    use tempfile::tempdir;

    fn setup(config: BusConfig) -> (tempfile::TempDir, StreamBus) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("bus.db")).unwrap());
        let bus = StreamBus::new(BusStorage::new(db).unwrap(), config);
        (temp_dir, bus)
    }

    fn small_batches() -> BusConfig {
        BusConfig {
            batch_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replay_plus_tail_equals_fresh_subscription() {
        let (_dir, bus) = setup(small_batches());
        for text in ["a", "b", "c"] {
            bus.push_event("r1", &RunEvent::assistant(text)).unwrap();
        }

        let tail = tokio::spawn({
            let stream = bus.subscribe("r1", 1);
            async move { stream.map(|entry| entry.unwrap()).collect::<Vec<_>>().await }
        });
        tokio::task::yield_now().await;

        bus.push_event("r1", &RunEvent::assistant("d")).unwrap();
        bus.push_event("r1", &RunEvent::status(StatusType::Completed))
            .unwrap();
        bus.end_stream("r1").unwrap();

        let tailed = tail.await.unwrap();
        let fresh: Vec<BusEntry> = bus
            .subscribe("r1", 0)
            .map(|entry| entry.unwrap())
            .collect()
            .await;

        assert_eq!(fresh.len(), 5);
        assert_eq!(fresh[1..].to_vec(), tailed);
        assert_eq!(
            fresh.iter().map(|entry| entry.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(fresh[4].event.is_terminal_status());
    }

    #[tokio::test]
    async fn test_subscribe_after_end_replays_and_finishes() {
        let (_dir, bus) = setup(BusConfig::default());
        bus.push_event("r1", &RunEvent::assistant("only")).unwrap();
        bus.end_stream("r1").unwrap();

        let entries: Vec<_> = bus.subscribe("r1", 0).collect().await;
        assert_eq!(entries.len(), 1);
        let past_end: Vec<_> = bus.subscribe("r1", 7).collect().await;
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_stop_reaches_instance_channels() {
        let (_dir, bus) = setup(BusConfig::default());
        bus.mark_active("worker-a", "r1").unwrap();
        bus.mark_active("worker-b", "r2").unwrap();
        let mut global = bus.subscribe_channel(&control_key("r1"));
        let mut instance = bus.subscribe_channel(&instance_control_key("r1", "worker-a"));

        assert_eq!(bus.publish_stop("r1").unwrap(), 2);
        assert_eq!(global.recv().await.unwrap(), STOP);
        assert_eq!(instance.recv().await.unwrap(), STOP);
        assert_eq!(bus.active_instances("r1").unwrap(), vec!["worker-a".to_string()]);

        bus.clear_active("worker-a", "r1").unwrap();
        assert!(bus.active_instances("r1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expires_log() {
        let (_dir, bus) = setup(BusConfig {
            cleanup_delay: Duration::ZERO,
            ..Default::default()
        });
        bus.push_event("r1", &RunEvent::assistant("x")).unwrap();
        bus.end_stream("r1").unwrap();
        bus.schedule_cleanup("r1").unwrap();

        assert_eq!(bus.sweep().unwrap(), 2);
        assert_eq!(bus.response_count("r1").unwrap(), 0);
        assert!(!bus.is_ended("r1").unwrap());
    }

    #[tokio::test]
    async fn test_finished_runs_leave_no_channels() {
        let (_dir, bus) = setup(BusConfig::default());
        for i in 0..100 {
            let run_id = format!("r{i}");
            let control = bus.subscribe_channel(&control_key(&run_id));
            let local = bus.subscribe_channel(&instance_control_key(&run_id, "worker-1"));
            bus.push_event(&run_id, &RunEvent::assistant("x")).unwrap();
            drop((control, local));
            bus.end_stream(&run_id).unwrap();
            assert_eq!(bus.release_channels(&run_id), 3);
        }
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_release_keeps_channels_with_listeners() {
        let (_dir, bus) = setup(BusConfig::default());
        let mut tail = bus.subscribe_channel(&control_key("r1"));
        bus.subscribe_channel(&control_key("r10"));
        bus.publish(&instance_control_key("r1", "worker-1"), STOP);

        assert_eq!(bus.release_channels("r1"), 1);
        assert_eq!(bus.channel_count(), 2);
        bus.publish(&control_key("r1"), END_STREAM);
        assert_eq!(tail.recv().await.unwrap(), END_STREAM);

        drop(tail);
        bus.sweep().unwrap();
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_log_has_ttl_from_first_push() {
        let (_dir, bus) = setup(BusConfig::default());
        bus.push_event("r1", &RunEvent::assistant("x")).unwrap();
        let expiry = bus.storage.expiry_of(&responses_key("r1")).unwrap().unwrap();
        let day_ms = 24 * 60 * 60 * 1000;
        assert!(expiry > Utc::now().timestamp_millis() + day_ms - 60_000);
    }
}
