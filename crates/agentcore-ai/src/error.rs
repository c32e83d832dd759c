//! Error types for the AI module

use agentcore_traits::{RunStatus, ToolError};
use thiserror::Error;

/// AI module error types
#[derive(Error, Debug)]
pub enum AiError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("{provider} API error ({status}): {message}")]
    LlmHttp {
        provider: String,
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("MCP timeout after {0:?}")]
    McpTimeout(std::time::Duration),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AiError {
    /// Rate limits, 5xx and connection failures; never other 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::LlmHttp { status, .. } => *status == 429 || *status >= 500,
            AiError::Http(err) => err.is_connect() || err.is_timeout(),
            AiError::Llm(message) => {
                let lower = message.to_ascii_lowercase();
                lower.contains("rate limit") || lower.contains("overloaded")
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AiError::LlmHttp {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// Provider refused the tool schemas of the request.
    pub fn is_schema_rejection(&self) -> bool {
        let message = match self {
            AiError::LlmHttp {
                status: 400 | 422,
                message,
                ..
            } => message,
            AiError::Llm(message) | AiError::InvalidFormat(message) => message,
            _ => return false,
        };
        let lower = message.to_ascii_lowercase();
        const MARKERS: [&str; 6] = [
            "schema",
            "anyof",
            "oneof",
            "function.parameters",
            "invalid tool",
            "tools[",
        ];
        MARKERS.iter().any(|marker| lower.contains(marker))
    }
}

/// Result type alias for AI operations
pub type Result<T> = std::result::Result<T, AiError>;

/// Why a run ended other than by completing normally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("{0}")]
    Admission(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool schemas rejected by provider: {0}")]
    Schema(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Store unavailable after {attempts} attempts: {message}")]
    TransientStore { attempts: u32, message: String },
}

impl RunError {
    /// Status the run is closed with when this error ends it.
    pub fn terminal_status(&self) -> RunStatus {
        match self {
            RunError::Admission(_) | RunError::Cancelled => RunStatus::Stopped,
            RunError::Tool(_)
            | RunError::Provider(_)
            | RunError::Schema(_)
            | RunError::Invariant(_)
            | RunError::TransientStore { .. } => RunStatus::Failed,
        }
    }
}
