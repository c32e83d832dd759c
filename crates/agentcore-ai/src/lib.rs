//! AgentCore AI - the reasoning loop of the agent execution core
//!
//! This crate provides:
//! - Streaming LLM client abstraction with an OpenAI-compatible client
//! - Model catalog with pricing, aliases and context windows
//! - Tool registry with schema sanitization and argument validation
//! - MCP client pool (Streamable HTTP and SSE)
//! - Response processor for XML and native tool calls
//! - Thread manager and agent runner

pub mod agent;
pub mod error;
mod http_client;
pub mod llm;
pub mod mcp;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tools;

// Re-export commonly used types
pub use agent::{
    AgentConfig, AgentRunConfig, AgentRunner, EventSink, ProcessorConfig, RunEvent, RunOutcome,
    StatusType, ThreadManager, ToolKitSource,
};
pub use error::{AiError, Result, RunError};
pub use llm::{
    CompletionRequest, LlmClient, Message, ModelCatalog, OpenAIClient, Role, StreamChunk,
    TokenUsage,
};
pub use mcp::{McpClientPool, McpConnectionRequest, McpResolver};
pub use tools::{Tool, ToolOutput, ToolRegistry, ToolSchema};
