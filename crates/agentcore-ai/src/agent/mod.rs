//! Agent execution: prompt assembly, the response processor and the
//! iteration loop of a run.
//!
//! A run is driven by [`AgentRunner`]. Each iteration asks the
//! [`ThreadManager`] for one completion, which the [`ResponseProcessor`]
//! streams to an [`EventSink`] while executing the tool calls it finds.

mod config;
mod context;
mod events;
mod processor;
mod prompt;
mod runner;
mod sink;
mod thread_manager;
mod xml;

pub use config::{
    AgentConfig, AgentRunConfig, DEFAULT_MAX_ITERATIONS, DEFAULT_NATIVE_MAX_AUTO_CONTINUES,
    ToolSelection,
};
pub use context::{
    ContextBudget, LlmSummarizer, Summarizer, estimate_message_tokens, estimate_text_tokens,
    estimate_tokens,
};
pub use events::{RunEvent, StatusType};
pub use processor::{
    ProcessorConfig, ProcessorOutcome, ResponseProcessor, ToolExecution, ToolExecutionStrategy,
    XmlAddingStrategy, format_xml_result,
};
pub use prompt::{
    AGENT_BUILDER_PROMPT, DEFAULT_SYSTEM_PROMPT, MCP_NO_FABRICATION_DIRECTIVE, PromptInputs,
    build_system_prompt, datetime_block,
};
pub use runner::{AgentRunner, RunOutcome, ToolKitSource};
pub use sink::{ChannelSink, CollectingSink, EventSink, NullSink};
pub use thread_manager::{ThreadManager, ThreadRunRequest};
pub use xml::{XmlToolCall, XmlToolParser};
