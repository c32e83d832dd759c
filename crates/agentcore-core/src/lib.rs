//! AgentCore core - persistence-backed services of the agent execution core.
//!
//! This crate provides:
//! - Typed storage over the redb tables (accounts, threads, runs, tasks)
//! - Credit ledger implementing the engine's credit gate
//! - Stream bus with replayable per-run response logs
//! - Run manager and scheduler
//! - Configuration loading

pub mod bus;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;

pub use bus::{BusConfig, BusEntry, BusError, BusSink, StreamBus};
pub use config::CoreConfig;
pub use models::*;
pub use services::{
    CreditLedger, LedgerError, RunHandle, RunManager, RunManagerError, RunRequest, Scheduler,
    SchedulerHandle, TickReport, close_run,
};
pub use storage::Storage;

use std::sync::Arc;

use agentcore_ai::{AgentRunner, LlmClient, ModelCatalog, OpenAIClient};
use agentcore_traits::ThreadRecord;
use anyhow::{Result, anyhow};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state of one process: storage, ledger and bus.
pub struct AgentCore {
    pub config: CoreConfig,
    pub storage: Arc<Storage>,
    pub ledger: Arc<CreditLedger>,
    pub bus: StreamBus,
    instance_id: String,
}

impl AgentCore {
    pub fn open(config: CoreConfig) -> Result<Self> {
        let path = config.database_path();
        let storage = Arc::new(Storage::new(&path)?);
        let ledger = Arc::new(CreditLedger::new(storage.accounts.clone()));
        let bus = StreamBus::new(storage.bus.clone(), config.bus_config());
        let instance_id = config.instance_id();
        info!(path = %path.display(), instance_id = %instance_id, "AgentCore opened");

        Ok(Self {
            config,
            storage,
            ledger,
            bus,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// OpenAI-compatible client from the configured endpoint and key.
    pub fn llm_client(&self) -> Result<Arc<dyn LlmClient>> {
        let api_key = self
            .config
            .llm
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("No LLM API key configured (set AGENTCORE_LLM_API_KEY)"))?;
        let mut client = OpenAIClient::new(api_key);
        if let Some(base_url) = &self.config.llm.base_url {
            client = client.with_base_url(base_url);
        }
        Ok(Arc::new(client))
    }

    pub fn runner(&self, llm: Arc<dyn LlmClient>) -> AgentRunner {
        AgentRunner::new(self.storage.clone(), self.ledger.clone(), llm)
            .with_catalog(Arc::new(ModelCatalog::builtin()))
            .with_mcp(self.config.mcp_resolver(), self.config.mcp_timeouts())
    }

    pub fn run_manager(&self, llm: Arc<dyn LlmClient>) -> Arc<RunManager> {
        Arc::new(
            RunManager::new(
                self.storage.clone(),
                self.bus.clone(),
                Arc::new(self.runner(llm)),
                &self.instance_id,
            )
            .with_liveness_refresh(self.config.liveness_refresh()),
        )
    }

    /// Create a thread owned by `account_id`, opening the account if needed.
    pub fn create_thread(
        &self,
        account_id: &str,
        project_id: Option<String>,
        agent_id: Option<String>,
    ) -> Result<ThreadRecord> {
        self.ledger.ensure_account(account_id)?;
        let thread = ThreadRecord {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: Some(account_id.to_string()),
            project_id: Some(project_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())),
            agent_id,
            created_at: Utc::now(),
        };
        self.storage.threads.create_thread(&thread)?;
        Ok(thread)
    }

    /// Stop a run held by another process or by nobody at all.
    pub fn stop_run(
        &self,
        run_id: &str,
        error: Option<String>,
    ) -> Result<AgentRun, RunManagerError> {
        close_run(&self.storage, &self.bus, run_id, error, false)
    }

    /// Start the scheduler and the bus sweeper around a run manager.
    pub fn start_worker(&self, llm: Arc<dyn LlmClient>) -> Worker {
        let runs = self.run_manager(llm);
        let scheduler = Arc::new(
            Scheduler::new(
                self.storage.clone(),
                runs.clone(),
                &self.config.llm.default_model,
            )
            .with_tick_interval(self.config.scheduler_tick()),
        );
        let sweeper = CancellationToken::new();
        let sweeper_task = self.bus.start_sweeper(sweeper.clone());
        info!(instance_id = %self.instance_id, "Worker started");

        Worker {
            runs,
            scheduler: scheduler.start(),
            sweeper,
            sweeper_task,
        }
    }
}

/// Background services of a worker process.
pub struct Worker {
    pub runs: Arc<RunManager>,
    scheduler: SchedulerHandle,
    sweeper: CancellationToken,
    sweeper_task: JoinHandle<()>,
}

impl Worker {
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub async fn shutdown(self) -> Result<()> {
        self.scheduler.stop().await?;
        self.sweeper.cancel();
        let _ = self.sweeper_task.await;
        info!("Worker stopped");
        Ok(())
    }
}
