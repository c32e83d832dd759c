//! OpenAI-compatible streaming chat completions client

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::AiError;
use crate::http_client::build_http_client;
use crate::llm::client::{
    CompletionRequest, FinishReason, LlmClient, Message, Role, StreamChunk, StreamResult,
    TokenUsage, ToolCallDelta,
};
use crate::llm::retry::{LlmRetryConfig, response_to_error};

/// Client for any endpoint speaking the OpenAI chat completions protocol.
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry_config: LlmRetryConfig,
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            retry_config: LlmRetryConfig::default(),
        }
    }

    /// Set custom base URL (for API-compatible services)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_config(mut self, config: LlmRetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
}

impl From<&Message> for OpenAIMessage {
    fn from(message: &Message) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect()
        });
        // Assistant messages carrying tool calls may have null content
        let content = if message.tool_calls.is_some() && message.content.is_empty() {
            None
        } else {
            Some(message.content.clone())
        };
        Self {
            role,
            content,
            tool_call_id: message.tool_call_id.clone(),
            tool_calls,
        }
    }
}

fn request_body(request: &CompletionRequest) -> Value {
    let messages: Vec<OpenAIMessage> = request.messages.iter().map(OpenAIMessage::from).collect();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!(request.tool_choice.as_str());
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.stop.is_empty() {
        body["stop"] = json!(request.stop);
    }
    body
}

#[derive(Deserialize, Debug)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl From<OpenAIUsage> for TokenUsage {
    fn from(usage: OpenAIUsage) -> Self {
        let cached = usage
            .prompt_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or(0);
        TokenUsage {
            // Cached tokens are billed separately at the cache-read rate
            prompt_tokens: usage.prompt_tokens.saturating_sub(cached),
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cache_read_tokens: cached,
            cache_write_tokens: 0,
        }
    }
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct OpenAIStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIStreamToolCall>>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<OpenAIStreamFunction>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Chunks carried by one SSE `data:` payload.
fn parse_event(data: &str) -> Vec<StreamChunk> {
    let parsed: OpenAIStreamResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::debug!(error = %error, "Skipping unparseable stream event");
            return Vec::new();
        }
    };

    let mut chunks = Vec::new();
    for choice in parsed.choices {
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            chunks.push(StreamChunk::text(content));
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            chunks.push(StreamChunk::tool_call(ToolCallDelta {
                index: call.index,
                id: call.id,
                name,
                arguments,
            }));
        }
        if let Some(reason) = choice.finish_reason {
            chunks.push(StreamChunk::final_chunk(
                FinishReason::from_provider(&reason),
                None,
            ));
        }
    }
    if let Some(usage) = parsed.usage {
        chunks.push(StreamChunk {
            usage: Some(usage.into()),
            ..Default::default()
        });
    }
    chunks
}

#[async_trait]
impl LlmClient for OpenAIClient {
    fn provider(&self) -> &str {
        "openai"
    }

    fn complete_stream(&self, request: CompletionRequest) -> StreamResult {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let retry = self.retry_config.clone();

        Box::pin(async_stream::stream! {
            let body = request_body(&request);

            // Retries happen only here, before any chunk has been yielded.
            let mut attempt = 0;
            let response = loop {
                let mut builder = client
                    .post(&url)
                    .bearer_auth(&api_key)
                    .json(&body);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }

                let error = match builder.send().await {
                    Ok(response) if response.status().is_success() => break response,
                    Ok(response) => response_to_error(response, "OpenAI").await,
                    Err(error) => AiError::Http(error),
                };

                if !retry.should_retry(&error, attempt) {
                    yield Err(error);
                    return;
                }
                attempt += 1;
                let delay = retry.delay_for(attempt, error.retry_after());
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying OpenAI request"
                );
                tokio::time::sleep(delay).await;
            };

            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(next) = byte_stream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(AiError::Llm(format!("Stream error: {error}")));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find("\n\n") {
                    let event: String = buffer.drain(..pos + 2).collect();
                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data.is_empty() || data == "[DONE]" {
                            continue;
                        }
                        for chunk in parse_event(data) {
                            yield Ok(chunk);
                        }
                    }
                }
            }

            // Last event may lack its trailing blank line
            for line in buffer.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    let data = data.trim();
                    if !data.is_empty() && data != "[DONE]" {
                        for chunk in parse_event(data) {
                            yield Ok(chunk);
                        }
                    }
                }
            }
        })
    }
}
