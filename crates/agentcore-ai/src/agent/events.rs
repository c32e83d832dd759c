//! Normalized events a run streams to its subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    ToolStarted,
    Error,
    Stopped,
    Completed,
    MaxIterationsReached,
}

/// One event on the wire, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Assistant {
        content: String,
    },
    Tool {
        name: String,
        success: bool,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },
    Status {
        status_type: StatusType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
        model: String,
    },
}

impl RunEvent {
    pub fn assistant(content: impl Into<String>) -> Self {
        RunEvent::Assistant {
            content: content.into(),
        }
    }

    pub fn status(status_type: StatusType) -> Self {
        RunEvent::Status {
            status_type,
            tool: None,
            message: None,
            metadata: None,
        }
    }

    pub fn status_with_message(status_type: StatusType, message: impl Into<String>) -> Self {
        RunEvent::Status {
            status_type,
            tool: None,
            message: Some(message.into()),
            metadata: None,
        }
    }

    /// `tool_started` for `tool`; terminators carry `agent_should_terminate`.
    pub fn tool_started(tool: impl Into<String>, terminates: bool) -> Self {
        RunEvent::Status {
            status_type: StatusType::ToolStarted,
            tool: Some(tool.into()),
            message: None,
            metadata: terminates.then(|| serde_json::json!({"agent_should_terminate": true})),
        }
    }

    /// `tool_started` for a parsed call that is reported but not executed.
    pub fn tool_detected(tool: impl Into<String>, arguments: Value, terminates: bool) -> Self {
        let mut metadata = serde_json::json!({"arguments": arguments, "executed": false});
        if terminates {
            metadata["agent_should_terminate"] = Value::Bool(true);
        }
        RunEvent::Status {
            status_type: StatusType::ToolStarted,
            tool: Some(tool.into()),
            message: None,
            metadata: Some(metadata),
        }
    }

    pub fn status_type(&self) -> Option<StatusType> {
        match self {
            RunEvent::Status { status_type, .. } => Some(*status_type),
            _ => None,
        }
    }

    /// `stopped` or `completed`.
    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self.status_type(),
            Some(StatusType::Stopped | StatusType::Completed)
        )
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
