//! Tool error types.

use thiserror::Error;

/// Errors raised while resolving or executing a tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool is not enabled: {0}")]
    NotEnabled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Remote tool error: {0}")]
    Remote(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ToolError>;
