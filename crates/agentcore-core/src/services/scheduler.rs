//! Scheduler: fires due scheduled tasks into the run manager.

use std::sync::Arc;
use std::time::Duration;

use agentcore_ai::AgentConfig;
use agentcore_traits::ThreadRecord;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::models::ScheduledTask;
use crate::services::run_manager::{RunManager, RunManagerError, RunRequest};
use crate::storage::Storage;

/// Commands accepted by a running scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    Stop,
    TickNow,
}

/// Handle to control a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub async fn stop(&self) -> Result<()> {
        self.command_tx
            .send(SchedulerCommand::Stop)
            .await
            .map_err(|e| anyhow!("Failed to send stop command: {}", e))
    }

    pub async fn tick_now(&self) -> Result<()> {
        self.command_tx
            .send(SchedulerCommand::TickNow)
            .await
            .map_err(|e| anyhow!("Failed to send tick command: {}", e))
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Run ids started this tick.
    pub started: Vec<String>,
    /// Tasks whose thread was still busy.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    storage: Arc<Storage>,
    runs: Arc<RunManager>,
    default_model: String,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, runs: Arc<RunManager>, default_model: impl Into<String>) -> Self {
        Self {
            storage,
            runs,
            default_model: default_model.into(),
            tick_interval: Duration::from_secs(60),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        tokio::spawn(self.run_loop(command_rx));
        SchedulerHandle { command_tx }
    }

    async fn run_loop(self: Arc<Self>, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        let mut ticker = interval(self.tick_interval);
        info!(tick_secs = self.tick_interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_logged().await,
                cmd = command_rx.recv() => match cmd {
                    Some(SchedulerCommand::TickNow) => {
                        debug!("Manual tick triggered");
                        self.tick_logged().await;
                    }
                    Some(SchedulerCommand::Stop) | None => break,
                },
            }
        }
        info!("Scheduler stopped");
    }

    async fn tick_logged(&self) {
        match self.tick_once(Utc::now()).await {
            Ok(report) if report != TickReport::default() => info!(
                started = report.started.len(),
                skipped = report.skipped,
                failed = report.failed,
                "Scheduler tick"
            ),
            Ok(_) => {}
            Err(error) => warn!(error = %error, "Scheduler tick failed"),
        }
    }

    /// Fire every active task due at `now`. Missed slots are not caught up.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        for task in self.storage.scheduled_tasks.list_due(now)? {
            let mut failed = false;
            match self.fire(&task).await {
                Ok(Some(run_id)) => report.started.push(run_id),
                Ok(None) => report.skipped += 1,
                Err(error) => {
                    failed = true;
                    warn!(task_id = %task.id, error = %error, "Scheduled task failed to fire");
                }
            }
            if let Err(error) = self.advance(&task.id, now) {
                failed = true;
                warn!(task_id = %task.id, error = %error, "Failed to advance scheduled task");
            }
            if failed {
                report.failed += 1;
            }
        }
        Ok(report)
    }

    fn advance(&self, task_id: &str, now: DateTime<Utc>) -> Result<()> {
        let updated = self.storage.scheduled_tasks.update(task_id, |task| {
            if let Err(error) = task.advance(now) {
                warn!(task_id = %task.id, error = %error, "Deactivating task with invalid schedule");
                task.pause();
            }
            Ok(())
        })?;
        if let Some(task) = updated {
            debug!(task_id, next_run_at = %task.next_run_at, "Scheduled task advanced");
        }
        Ok(())
    }

    /// Start one run for the task. `None` when its thread is busy.
    async fn fire(&self, task: &ScheduledTask) -> Result<Option<String>> {
        let thread_id = self.ensure_thread(task)?;

        if let Some(running) = self.storage.agent_runs.running_on_thread(&thread_id)? {
            info!(task_id = %task.id, run_id = %running.id, "Skipping firing, thread is busy");
            return Ok(None);
        }

        let agent_config = task.agent_config.clone().unwrap_or_else(|| AgentConfig {
            agent_id: Some(task.agent_id.clone()),
            ..Default::default()
        });
        let model = task.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut request = RunRequest::new(&thread_id, model).with_agent_config(agent_config);
        if let Some(prompt) = &task.prompt {
            request = request.with_prompt(prompt);
        }

        match self.runs.start_run(request) {
            Ok(handle) => {
                info!(task_id = %task.id, run_id = %handle.run_id, "Scheduled task fired");
                Ok(Some(handle.run_id))
            }
            Err(RunManagerError::ThreadBusy { run_id, .. }) => {
                info!(task_id = %task.id, run_id = %run_id, "Skipping firing, thread is busy");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Create the task's project and thread on first use and persist them.
    fn ensure_thread(&self, task: &ScheduledTask) -> Result<String> {
        if let Some(thread_id) = &task.thread_id
            && self.storage.threads.get_thread(thread_id)?.is_some()
        {
            return Ok(thread_id.clone());
        }

        let project_id = task
            .project_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let thread = ThreadRecord {
            id: task
                .thread_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            account_id: Some(task.account_id.clone()),
            project_id: Some(project_id.clone()),
            agent_id: Some(task.agent_id.clone()),
            created_at: Utc::now(),
        };
        self.storage.threads.create_thread(&thread)?;
        self.storage.scheduled_tasks.update(&task.id, |stored| {
            stored.project_id = Some(project_id);
            stored.thread_id = Some(thread.id.clone());
            Ok(())
        })?;
        info!(task_id = %task.id, thread_id = %thread.id, "Created thread for scheduled task");
        Ok(thread.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, StreamBus};
    use crate::models::{LedgerEntryType, Schedule};
    use crate::services::CreditLedger;
    use agentcore_ai::AgentRunner;
    use agentcore_ai::llm::{MockLlmClient, MockStep};
    use agentcore_traits::{Credits, MessageType, RunStatus};
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        storage: Arc<Storage>,
        scheduler: Scheduler,
    }

    fn harness(steps: Vec<MockStep>) -> Harness {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path().join("core.db")).unwrap());
        let ledger = Arc::new(CreditLedger::new(storage.accounts.clone()));
        ledger
            .grant("acct", Credits::from_dollars(1.0), LedgerEntryType::Grant, "welcome")
            .unwrap();
        let runner = AgentRunner::new(
            storage.clone(),
            ledger,
            Arc::new(MockLlmClient::from_steps(steps)),
        );
        let bus = StreamBus::new(storage.bus.clone(), BusConfig::default());
        let runs = Arc::new(RunManager::new(storage.clone(), bus, Arc::new(runner), "worker-1"));
        let scheduler = Scheduler::new(storage.clone(), runs, "gpt-4o");
        Harness {
            _dir: dir,
            storage,
            scheduler,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
    }

    async fn wait_idle(storage: &Storage) {
        for _ in 0..200 {
            if storage.agent_runs.list_running().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("runs did not finish");
    }

    #[tokio::test]
    async fn test_due_task_creates_thread_and_fires() {
        let h = harness(vec![MockStep::text("Report ready. <complete/>")]);
        let task = ScheduledTask::new(
            "acct",
            "agent-7",
            Schedule::Daily {
                time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            },
            at(8, 0),
        )
        .unwrap()
        .with_prompt("Send the daily report");
        h.storage.scheduled_tasks.put(&task).unwrap();

        assert_eq!(h.scheduler.tick_once(at(8, 59)).await.unwrap(), TickReport::default());

        let report = h.scheduler.tick_once(at(9, 0)).await.unwrap();
        assert_eq!(report.started.len(), 1);
        wait_idle(&h.storage).await;

        let stored = h.storage.scheduled_tasks.get(&task.id).unwrap().unwrap();
        let thread_id = stored.thread_id.clone().unwrap();
        assert!(stored.project_id.is_some());
        assert_eq!(stored.last_run_at, Some(at(9, 0)));
        assert_eq!(stored.next_run_at, at(9, 0) + ChronoDuration::days(1));

        let thread = h.storage.threads.get_thread(&thread_id).unwrap().unwrap();
        assert_eq!(thread.account_id.as_deref(), Some("acct"));
        assert_eq!(thread.agent_id.as_deref(), Some("agent-7"));
        let messages = h.storage.threads.list_messages(&thread_id).unwrap();
        assert_eq!(messages[0].message_type, MessageType::User);
        assert_eq!(messages[0].text(), "Send the daily report");

        let run = h.storage.agent_runs.get(&report.started[0]).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.model.as_deref(), Some("gpt-4o"));

        // Same minute again: nothing is due any more.
        assert!(h.scheduler.tick_once(at(9, 0)).await.unwrap().started.is_empty());
    }

    #[tokio::test]
    async fn test_busy_thread_is_skipped_but_advanced() {
        let h = harness(vec![MockStep::text("slow").with_delay(2_000)]);
        let task = ScheduledTask::new("acct", "agent", Schedule::Hourly { minute_of_hour: 0 }, at(7, 30))
            .unwrap()
            .with_prompt("ping");
        h.storage.scheduled_tasks.put(&task).unwrap();

        let first = h.scheduler.tick_once(at(8, 0)).await.unwrap();
        assert_eq!(first.started.len(), 1);

        let second = h.scheduler.tick_once(at(9, 0)).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert!(second.started.is_empty());

        let stored = h.storage.scheduled_tasks.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.next_run_at, at(10, 0));
        // The skipped firing did not append another prompt.
        let thread_id = stored.thread_id.unwrap();
        assert_eq!(h.storage.threads.list_messages(&thread_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_paused_task_does_not_fire() {
        let h = harness(vec![]);
        let mut task =
            ScheduledTask::new("acct", "agent", Schedule::Hourly { minute_of_hour: 0 }, at(7, 30))
                .unwrap();
        task.pause();
        h.storage.scheduled_tasks.put(&task).unwrap();

        let report = h.scheduler.tick_once(at(12, 0)).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert!(h.storage.threads.list_threads().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_tick_now_and_stop() {
        let h = harness(vec![]);
        let scheduler = Arc::new(h.scheduler.with_tick_interval(std::time::Duration::from_secs(3600)));
        let handle = scheduler.start();
        handle.tick_now().await.unwrap();
        handle.stop().await.unwrap();
    }
}
