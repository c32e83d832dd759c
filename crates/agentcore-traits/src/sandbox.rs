//! Sandbox interface and lazy per-project handle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub result: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
}

/// Isolated execution environment attached to a project.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn upload_file(&self, bytes: Vec<u8>, path: &str) -> Result<()>;
    async fn download_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn get_file_info(&self, path: &str) -> Result<FileInfo>;
    async fn create_folder(&self, path: &str, mode: u32) -> Result<()>;
    async fn exec(&self, request: ExecRequest) -> Result<ExecResult>;
    async fn create_session(&self, session_id: &str) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn sandbox_for_project(&self, project_id: &str) -> Result<Arc<dyn Sandbox>>;
}

/// Project sandbox that is only created when a tool first asks for it.
#[derive(Clone)]
pub struct LazySandbox {
    project_id: String,
    provider: Option<Arc<dyn SandboxProvider>>,
    cell: Arc<OnceCell<Arc<dyn Sandbox>>>,
}

impl LazySandbox {
    pub fn new(project_id: impl Into<String>, provider: Option<Arc<dyn SandboxProvider>>) -> Self {
        Self {
            project_id: project_id.into(),
            provider,
            cell: Arc::new(OnceCell::new()),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub fn is_created(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn Sandbox>> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No sandbox provider configured"))?;
        let project_id = self.project_id.clone();
        let sandbox = self
            .cell
            .get_or_try_init(|| async move { provider.sandbox_for_project(&project_id).await })
            .await?;
        Ok(sandbox.clone())
    }
}
