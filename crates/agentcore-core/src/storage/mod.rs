//! Storage layer with typed wrappers around agentcore-storage.
//!
//! Wraps the byte-level tables with the core's models and implements the
//! engine's [`ThreadStore`] on top of them.

pub mod account;
pub mod agent_run;
pub mod scheduled_task;
pub mod thread;

use agentcore_traits::{MessageRecord, NewMessage, ThreadRecord, ThreadStore};
use anyhow::Result;
use async_trait::async_trait;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

pub use account::AccountStorage;
pub use agent_run::AgentRunStorage;
pub use agentcore_storage::BusStorage;
pub use scheduled_task::ScheduledTaskStorage;
pub use thread::ThreadStorage;

/// Central storage manager that initializes every storage subsystem on one
/// database.
#[derive(Debug, Clone)]
pub struct Storage {
    db: Arc<Database>,
    pub accounts: AccountStorage,
    pub threads: ThreadStorage,
    pub agent_runs: AgentRunStorage,
    pub scheduled_tasks: ScheduledTaskStorage,
    pub bus: BusStorage,
}

impl Storage {
    /// Create or open the database file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(Database::create(path.as_ref())?);
        Self::from_database(db)
    }

    pub fn from_database(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            accounts: AccountStorage::new(db.clone())?,
            threads: ThreadStorage::new(db.clone())?,
            agent_runs: AgentRunStorage::new(db.clone())?,
            scheduled_tasks: ScheduledTaskStorage::new(db.clone())?,
            bus: BusStorage::new(db.clone())?,
            db,
        })
    }

    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}

#[async_trait]
impl ThreadStore for Storage {
    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        self.threads.get_thread(thread_id)
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        self.threads.list_messages(thread_id)
    }

    async fn latest_llm_message(&self, thread_id: &str) -> Result<Option<MessageRecord>> {
        self.threads.latest_llm_message(thread_id)
    }

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord> {
        self.threads.append_message(message)
    }

    async fn update_message(&self, message: &MessageRecord) -> Result<()> {
        self.threads.update_message(message)
    }

    async fn account_locale(&self, account_id: &str) -> Result<Option<String>> {
        Ok(self
            .accounts
            .get_account(account_id)?
            .and_then(|account| account.locale))
    }
}
