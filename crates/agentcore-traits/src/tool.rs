//! Tool trait and types for agent tools.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// JSON Schema description of one callable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema object
}

/// Result of tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Flatten the output into the single string shown to the model.
    pub fn content_string(&self) -> String {
        if !self.success {
            return self
                .error
                .clone()
                .unwrap_or_else(|| "Tool execution failed".to_string());
        }
        match &self.result {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Registration group. Groups register in declaration order, so a later
/// group overrides an earlier one on a name clash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    Core,
    Sandbox,
    Utility,
    AgentBuilder,
    Browser,
    Mcp,
}

impl ToolGroup {
    pub const ORDER: [ToolGroup; 6] = [
        ToolGroup::Core,
        ToolGroup::Sandbox,
        ToolGroup::Utility,
        ToolGroup::AgentBuilder,
        ToolGroup::Browser,
        ToolGroup::Mcp,
    ];
}

/// Where a registered tool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "server", rename_all = "lowercase")]
pub enum ToolSource {
    Native,
    Mcp(String),
}

impl fmt::Display for ToolSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolSource::Native => write!(f, "native"),
            ToolSource::Mcp(server) => write!(f, "mcp:{}", server),
        }
    }
}

/// Core trait for agent tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (used in tool calls).
    fn name(&self) -> &str;

    /// Human-readable description for LLM context.
    fn description(&self) -> &str;

    /// JSON Schema for input parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, input: Value) -> Result<ToolOutput>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A named set of tool methods registered together.
///
/// Each method is a [`Tool`] carrying its own schema; the registry may keep
/// only a subset of them.
pub trait ToolKit: Send + Sync {
    fn name(&self) -> &str;

    fn group(&self) -> ToolGroup;

    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_string_flattens_results() {
        assert_eq!(ToolOutput::success(Value::String("hits".into())).content_string(), "hits");
        assert_eq!(
            ToolOutput::success(serde_json::json!({"n": 1})).content_string(),
            r#"{"n":1}"#
        );
        assert_eq!(ToolOutput::error("boom").content_string(), "boom");
    }

    #[test]
    fn test_group_order_matches_registration_order() {
        let mut groups = vec![ToolGroup::Mcp, ToolGroup::Core, ToolGroup::Browser];
        groups.sort();
        assert_eq!(groups, vec![ToolGroup::Core, ToolGroup::Browser, ToolGroup::Mcp]);
        assert_eq!(ToolSource::Mcp("slack".into()).to_string(), "mcp:slack");
    }
}
