//! Deterministic mock LLM client driven by scripted steps.

use std::collections::VecDeque;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};

use crate::error::AiError;

use super::{
    CompletionRequest, FinishReason, LlmClient, Role, StreamChunk, StreamResult, TokenUsage,
    ToolCallDelta,
};

#[derive(Debug, Clone)]
pub enum MockStepKind {
    /// Stream the given text pieces, then the finish chunk.
    Text(Vec<String>),
    /// Stream one provider-native tool call.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Fail before producing any chunk.
    HttpError { status: u16, message: String },
    /// Stream the given pieces, then fail.
    StreamError {
        chunks: Vec<String>,
        message: String,
    },
}

/// Scripted completion with optional delays.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay_ms: u64,
    pub chunk_delay_ms: u64,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    pub kind: MockStepKind,
}

impl MockStep {
    fn of(kind: MockStepKind) -> Self {
        Self {
            delay_ms: 0,
            chunk_delay_ms: 0,
            usage: None,
            finish_reason: None,
            kind,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::of(MockStepKind::Text(vec![content.into()]))
    }

    pub fn chunks<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        Self::of(MockStepKind::Text(chunks.into_iter().map(Into::into).collect()))
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::of(MockStepKind::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn http_error(status: u16, message: impl Into<String>) -> Self {
        Self::of(MockStepKind::HttpError {
            status,
            message: message.into(),
        })
    }

    pub fn stream_error<S: Into<String>>(
        chunks: impl IntoIterator<Item = S>,
        message: impl Into<String>,
    ) -> Self {
        Self::of(MockStepKind::StreamError {
            chunks: chunks.into_iter().map(Into::into).collect(),
            message: message.into(),
        })
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(TokenUsage::new(prompt_tokens, completion_tokens));
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_chunk_delay(mut self, delay_ms: u64) -> Self {
        self.chunk_delay_ms = delay_ms;
        self
    }
}

/// Replays scripted steps and records every request it receives.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    script: Arc<Mutex<VecDeque<MockStep>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<MockStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::from(steps))),
            requests: Arc::default(),
        }
    }

    pub async fn push_step(&self, step: MockStep) {
        self.script.lock().await.push_back(step);
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining_steps(&self) -> usize {
        self.script.lock().await.len()
    }

    fn fallback_step(request: &CompletionRequest) -> MockStep {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|msg| msg.role == Role::User)
            .map(|msg| format!("mock-echo: {}", msg.content))
            .unwrap_or_else(|| "mock-ok".to_string());
        MockStep::text(text)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn complete_stream(&self, request: CompletionRequest) -> StreamResult {
        let client = self.clone();
        Box::pin(try_stream! {
            let step = client.script.lock().await.pop_front();
            let step = step.unwrap_or_else(|| MockLlmClient::fallback_step(&request));
            client.requests.lock().await.push(request);

            if step.delay_ms > 0 {
                sleep(Duration::from_millis(step.delay_ms)).await;
            }

            let chunk_delay = Duration::from_millis(step.chunk_delay_ms);
            match step.kind {
                MockStepKind::Text(chunks) => {
                    let mut produced = 0usize;
                    for text in chunks {
                        if !chunk_delay.is_zero() {
                            sleep(chunk_delay).await;
                        }
                        produced += text.len();
                        yield StreamChunk::text(text);
                    }
                    let usage = step
                        .usage
                        .unwrap_or_else(|| TokenUsage::new(1, produced as u32));
                    yield StreamChunk::final_chunk(
                        step.finish_reason.unwrap_or(FinishReason::Stop),
                        Some(usage),
                    );
                }
                MockStepKind::ToolCall { id, name, arguments } => {
                    yield StreamChunk::tool_call(ToolCallDelta {
                        index: 0,
                        id: Some(id),
                        name: Some(name),
                        arguments: Some(arguments.to_string()),
                    });
                    yield StreamChunk::final_chunk(
                        step.finish_reason.unwrap_or(FinishReason::ToolCalls),
                        Some(step.usage.unwrap_or_else(|| TokenUsage::new(1, 1))),
                    );
                }
                MockStepKind::HttpError { status, message } => {
                    Err::<(), _>(AiError::LlmHttp {
                        provider: "mock".to_string(),
                        status,
                        message,
                        retry_after_secs: None,
                    })?;
                }
                MockStepKind::StreamError { chunks, message } => {
                    for text in chunks {
                        if !chunk_delay.is_zero() {
                            sleep(chunk_delay).await;
                        }
                        yield StreamChunk::text(text);
                    }
                    Err::<(), _>(AiError::Llm(message))?;
                }
            }
        })
    }
}
