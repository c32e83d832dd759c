//! Thread and message records shared between the engine and its stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A conversation owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    System,
    User,
    Assistant,
    Tool,
    Status,
    Summary,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::System => "system",
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::Tool => "tool",
            MessageType::Status => "status",
            MessageType::Summary => "summary",
        }
    }
}

/// Lifecycle status of an agent run. Every status but `Running` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }
}

/// A persisted thread message.
///
/// `content` follows `{"role": ..., "content": ...}` for LLM-visible
/// messages; `metadata` carries tool names, strategies and similar details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    pub message_type: MessageType,
    pub content: Value,
    pub is_llm_message: bool,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Text body of the message.
    pub fn text(&self) -> String {
        match self.content.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => match &self.content {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        }
    }

    /// The `role` recorded in the content, if any.
    pub fn role(&self) -> Option<&str> {
        self.content.get("role").and_then(Value::as_str)
    }
}

/// A message about to be appended to a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub thread_id: String,
    pub message_type: MessageType,
    pub content: Value,
    pub is_llm_message: bool,
    pub metadata: Value,
}

impl NewMessage {
    pub fn new(thread_id: impl Into<String>, message_type: MessageType, content: Value) -> Self {
        Self {
            thread_id: thread_id.into(),
            message_type,
            content,
            is_llm_message: !matches!(message_type, MessageType::Status),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn user(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            thread_id,
            MessageType::User,
            json!({"role": "user", "content": text.into()}),
        )
    }

    pub fn assistant(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            thread_id,
            MessageType::Assistant,
            json!({"role": "assistant", "content": text.into()}),
        )
    }

    pub fn summary(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            thread_id,
            MessageType::Summary,
            json!({"role": "system", "content": text.into()}),
        )
    }

    pub fn status(thread_id: impl Into<String>, content: Value) -> Self {
        Self::new(thread_id, MessageType::Status, content)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_llm_visibility(mut self, is_llm_message: bool) -> Self {
        self.is_llm_message = is_llm_message;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_messages_are_hidden_from_llm() {
        assert!(!NewMessage::status("t", json!({"status_type": "error"})).is_llm_message);
        assert!(NewMessage::user("t", "hi").is_llm_message);
    }

    #[test]
    fn test_record_text_and_role() {
        let record = MessageRecord {
            id: "m".into(),
            thread_id: "t".into(),
            message_type: MessageType::Assistant,
            content: json!({"role": "assistant", "content": "hello"}),
            is_llm_message: true,
            metadata: Value::Null,
            created_at: Utc::now(),
        };
        assert_eq!(record.text(), "hello");
        assert_eq!(record.role(), Some("assistant"));
        assert_eq!(
            serde_json::to_value(MessageType::Summary).unwrap(),
            json!("summary")
        );
    }
}
