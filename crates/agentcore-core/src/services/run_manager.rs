//! Run manager: owns the lifecycle of agent runs on this instance.
//!
//! A launched run gets a cancellation token flipped by its control
//! listener, a liveness key refreshed in the background and a bus sink
//! mirroring its events. When the runner returns, the run is closed,
//! `END_STREAM` is published and the response log is scheduled for cleanup.

use std::sync::Arc;
use std::time::Duration;

use agentcore_ai::{AgentConfig, AgentRunConfig, AgentRunner, ProcessorConfig, RunOutcome};
use agentcore_traits::{NewMessage, RunStatus};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusError, BusSink, END_STREAM, STOP, StreamBus, control_key, instance_control_key};
use crate::models::AgentRun;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum RunManagerError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Thread {thread_id} already has a running agent run ({run_id})")]
    ThreadBusy { thread_id: String, run_id: String },
    #[error("Agent run not found: {0}")]
    RunNotFound(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("Run store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// What to run on a thread.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub thread_id: String,
    pub model: String,
    /// User message appended once the run holds the thread.
    pub prompt: Option<String>,
    pub agent_config: Option<AgentConfig>,
    pub max_iterations: Option<usize>,
    pub processor: Option<ProcessorConfig>,
}

impl RunRequest {
    pub fn new(thread_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            model: model.into(),
            prompt: None,
            agent_config: None,
            max_iterations: None,
            processor: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = Some(config);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = Some(processor);
        self
    }
}

/// A launched run.
pub struct RunHandle {
    pub run_id: String,
    pub join: JoinHandle<RunOutcome>,
}

pub struct RunManager {
    storage: Arc<Storage>,
    bus: StreamBus,
    runner: Arc<AgentRunner>,
    instance_id: String,
    liveness_refresh: Duration,
    active: DashMap<String, CancellationToken>,
}

impl RunManager {
    pub fn new(
        storage: Arc<Storage>,
        bus: StreamBus,
        runner: Arc<AgentRunner>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            bus,
            runner,
            instance_id: instance_id.into(),
            liveness_refresh: Duration::from_secs(30),
            active: DashMap::new(),
        }
    }

    pub fn with_liveness_refresh(mut self, interval: Duration) -> Self {
        self.liveness_refresh = interval;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn bus(&self) -> &StreamBus {
        &self.bus
    }

    /// Create a `running` run on the thread and launch it.
    pub fn start_run(self: &Arc<Self>, request: RunRequest) -> Result<RunHandle, RunManagerError> {
        let run = self.create_run(&request.thread_id, &request.model)?;
        let thread = self
            .storage
            .threads
            .get_thread(&request.thread_id)?
            .ok_or_else(|| RunManagerError::ThreadNotFound(request.thread_id.clone()))?;
        if let Some(prompt) = &request.prompt
            && let Err(error) = self
                .storage
                .threads
                .append_message(NewMessage::user(&run.thread_id, prompt))
        {
            let message = format!("Failed to append prompt: {error}");
            if let Err(close) = self
                .storage
                .agent_runs
                .finish(&run.id, RunStatus::Failed, Some(message))
            {
                warn!(run_id = %run.id, error = %close, "Failed to close agent run");
            }
            return Err(error.into());
        }

        let mut config =
            AgentRunConfig::new(&run.id, &run.thread_id, &request.model, &self.instance_id);
        if let Some(project_id) = thread.project_id {
            config = config.with_project(project_id);
        }
        if let Some(agent_config) = request.agent_config {
            config = config.with_agent_config(agent_config);
        }
        if let Some(max_iterations) = request.max_iterations {
            config = config.with_max_iterations(max_iterations);
        }
        if let Some(processor) = request.processor {
            config = config.with_processor(processor);
        }
        Ok(self.launch(config))
    }

    /// Insert a `running` run unless the thread is busy.
    pub fn create_run(&self, thread_id: &str, model: &str) -> Result<AgentRun, RunManagerError> {
        if self.storage.threads.get_thread(thread_id)?.is_none() {
            return Err(RunManagerError::ThreadNotFound(thread_id.to_string()));
        }
        let run = AgentRun::new(thread_id)
            .with_instance(&self.instance_id)
            .with_model(model);
        if let Some(run_id) = self.storage.agent_runs.insert_if_idle(&run)? {
            return Err(RunManagerError::ThreadBusy {
                thread_id: thread_id.to_string(),
                run_id,
            });
        }
        info!(run_id = %run.id, thread_id, model, "Agent run created");
        Ok(run)
    }

    /// Execute a run whose record already exists.
    pub fn launch(self: &Arc<Self>, config: AgentRunConfig) -> RunHandle {
        let run_id = config.run_id.clone();
        let cancel = CancellationToken::new();
        self.active.insert(run_id.clone(), cancel.clone());

        // Subscribe before spawning so a STOP sent right after launch is seen.
        let global = self.bus.subscribe_channel(&control_key(&run_id));
        let local = self
            .bus
            .subscribe_channel(&instance_control_key(&run_id, &self.instance_id));
        if let Err(error) = self.bus.mark_active(&self.instance_id, &run_id) {
            warn!(run_id = %run_id, error = %error, "Failed to write liveness key");
        }

        let manager = self.clone();
        let join = tokio::spawn(async move {
            let done = CancellationToken::new();
            let listener = spawn_control_listener(global, local, cancel.clone(), done.clone());
            let refresher = manager.spawn_liveness_refresher(&config.run_id, done.clone());

            let mut sink = BusSink::new(manager.bus.clone(), &config.run_id);
            let mut outcome = manager.runner.run(&config, cancel, &mut sink).await;
            if let Some(error) = sink.failure() {
                warn!(
                    run_id = %config.run_id,
                    dropped = sink.dropped(),
                    error,
                    "Run events were lost, failing the run"
                );
                outcome.status = RunStatus::Failed;
                if outcome.error.is_none() {
                    outcome.error = Some(format!("Run events could not be published: {error}"));
                }
            }

            done.cancel();
            let _ = listener.await;
            let _ = refresher.await;
            manager.finalize(&config.run_id, &outcome);
            outcome
        });
        RunHandle { run_id, join }
    }

    fn spawn_liveness_refresher(&self, run_id: &str, done: CancellationToken) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let instance_id = self.instance_id.clone();
        let run_id = run_id.to_string();
        let period = self.liveness_refresh;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = bus.mark_active(&instance_id, &run_id) {
                            warn!(run_id = %run_id, error = %error, "Liveness refresh failed");
                        }
                    }
                }
            }
        })
    }

    fn finalize(&self, run_id: &str, outcome: &RunOutcome) {
        self.active.remove(run_id);
        match self
            .storage
            .agent_runs
            .finish(run_id, outcome.status, outcome.error.clone())
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(run_id, "Run already closed"),
            Err(error) => warn!(run_id, error = %error, "Failed to close agent run"),
        }
        if let Err(error) = self.bus.end_stream(run_id) {
            warn!(run_id, error = %error, "Failed to publish END_STREAM");
        }
        if let Err(error) = self.bus.schedule_cleanup(run_id) {
            warn!(run_id, error = %error, "Failed to schedule response cleanup");
        }
        if let Err(error) = self.bus.clear_active(&self.instance_id, run_id) {
            warn!(run_id, error = %error, "Failed to clear liveness key");
        }
        self.bus.release_channels(run_id);
    }

    /// Stop a run: `stopped`, or `failed` when `error` is given.
    pub fn stop_run(&self, run_id: &str, error: Option<String>) -> Result<AgentRun, RunManagerError> {
        let local = self.active.get(run_id).map(|token| token.value().clone());
        if let Some(token) = &local {
            token.cancel();
        }
        close_run(&self.storage, &self.bus, run_id, error, local.is_some())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<AgentRun>, RunManagerError> {
        Ok(self.storage.agent_runs.get(run_id)?)
    }

    pub fn list_runs_for_thread(&self, thread_id: &str) -> Result<Vec<AgentRun>, RunManagerError> {
        Ok(self.storage.agent_runs.list_for_thread(thread_id)?)
    }

    /// Whether this instance is executing the run.
    pub fn is_local(&self, run_id: &str) -> bool {
        self.active.contains_key(run_id)
    }
}

/// Signal STOP to every holder of the run and record its terminal status.
/// When nobody executes the run its stream is ended here.
pub fn close_run(
    storage: &Storage,
    bus: &StreamBus,
    run_id: &str,
    error: Option<String>,
    held_locally: bool,
) -> Result<AgentRun, RunManagerError> {
    let run = storage
        .agent_runs
        .get(run_id)?
        .ok_or_else(|| RunManagerError::RunNotFound(run_id.to_string()))?;

    bus.publish_stop(run_id)?;
    let status = if error.is_some() {
        RunStatus::Failed
    } else {
        RunStatus::Stopped
    };
    let closed = storage.agent_runs.finish(run_id, status, error)?;
    if closed.is_some() && !held_locally && bus.active_instances(run_id)?.is_empty() {
        bus.end_stream(run_id)?;
    }
    bus.schedule_cleanup(run_id)?;
    if !held_locally {
        bus.release_channels(run_id);
    }
    info!(run_id, status = status.as_str(), "Agent run stop requested");

    Ok(closed.unwrap_or(run))
}

fn spawn_control_listener(
    mut global: tokio::sync::broadcast::Receiver<String>,
    mut local: tokio::sync::broadcast::Receiver<String>,
    cancel: CancellationToken,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = done.cancelled() => break,
                message = global.recv() => message,
                message = local.recv() => message,
            };
            match message {
                Ok(signal) if signal == STOP => {
                    cancel.cancel();
                    break;
                }
                Ok(signal) if signal == END_STREAM => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}
