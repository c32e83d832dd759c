//! Agent run lifecycle record.

use agentcore_traits::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AgentRun {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            instance_id: None,
            model: None,
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Close the run. Returns false when it was already terminal.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }
}
