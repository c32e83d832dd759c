//! LLM module - provider abstraction, model catalog and clients

mod client;
#[cfg(any(test, feature = "test-utils"))]
mod mock_client;
mod openai;
pub mod pricing;
pub mod retry;

pub use client::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Message, Role, StreamChunk,
    StreamResult, TokenUsage, ToolCall, ToolCallAccumulator, ToolCallDelta, ToolChoice,
};
#[cfg(any(test, feature = "test-utils"))]
pub use mock_client::{MockLlmClient, MockStep, MockStepKind};
pub use openai::OpenAIClient;
pub use pricing::{ModelCatalog, ModelInfo, ModelPricing, supports_full_schema};
pub use retry::LlmRetryConfig;
