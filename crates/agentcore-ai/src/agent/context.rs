//! Token estimation and history folding into a summary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::llm::{CompletionRequest, LlmClient, Message, Role};

const CHARS_PER_TOKEN: usize = 4;
const ROLE_OVERHEAD_TOKENS: usize = 4;
const SUMMARY_TRUNCATE_CHARS: usize = 4000;

pub const DEFAULT_SAFETY_MARGIN_TOKENS: usize = 10_000;
pub const DEFAULT_KEEP_RECENT_MESSAGES: usize = 6;

/// Estimate tokens for a single message (bytes / CHARS_PER_TOKEN + role overhead).
pub fn estimate_message_tokens(msg: &Message) -> usize {
    let mut bytes = msg.content.len();
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            bytes += call.id.len() + call.name.len();
            bytes += call.arguments.to_string().len();
        }
    }
    bytes / CHARS_PER_TOKEN + ROLE_OVERHEAD_TOKENS
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// When the history has to be folded.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub context_window: usize,
    pub safety_margin: usize,
    pub keep_recent: usize,
}

impl ContextBudget {
    pub fn for_window(context_window: usize) -> Self {
        Self {
            context_window,
            safety_margin: DEFAULT_SAFETY_MARGIN_TOKENS.min(context_window / 4),
            keep_recent: DEFAULT_KEEP_RECENT_MESSAGES,
        }
    }

    pub fn limit(&self) -> usize {
        self.context_window.saturating_sub(self.safety_margin)
    }

    pub fn exceeded_by(&self, estimated_tokens: usize) -> bool {
        estimated_tokens > self.limit()
    }
}

/// Index splitting `history` into the part to fold and the part kept
/// verbatim. Never starts the kept part with orphaned tool results.
pub fn fold_split(history: &[Message], keep_recent: usize) -> usize {
    let mut split = history.len().saturating_sub(keep_recent);
    while split < history.len() && history[split].role == Role::Tool {
        split += 1;
    }
    split
}

/// Condenses a prefix of the conversation into one text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

const SUMMARY_PROMPT: &str = "Summarize the conversation below so another assistant can \
continue it. Keep decisions, facts learned from tools, open questions and the user's \
goals. Reply with the summary only.";

/// Summarizer backed by a completion call.
pub struct LlmSummarizer {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                Message::system(SUMMARY_PROMPT),
                Message::user(format_transcript(messages)),
            ],
        );
        let response = self.client.complete(request).await?;
        Ok(response.content.trim().to_string())
    }
}

fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL",
        };
        out.push_str(&format!("[{label}] {}\n\n", truncate_middle(&msg.content)));
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                out.push_str(&format!("  tool_call: {}({})\n", call.name, call.arguments));
            }
        }
    }
    out
}

fn truncate_middle(text: &str) -> String {
    if text.len() <= SUMMARY_TRUNCATE_CHARS {
        return text.to_string();
    }
    let half = SUMMARY_TRUNCATE_CHARS / 2;
    let mut head = half;
    while !text.is_char_boundary(head) {
        head -= 1;
    }
    let mut tail = text.len() - half;
    while !text.is_char_boundary(tail) {
        tail += 1;
    }
    format!("{} [...] {}", &text[..head], &text[tail..])
}
