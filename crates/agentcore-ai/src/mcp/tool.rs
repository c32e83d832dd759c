//! Registry-facing proxy for a remote MCP tool.

use std::sync::Arc;

use agentcore_traits::{Tool, ToolError, ToolOutput, ToolResult};
use async_trait::async_trait;
use serde_json::Value;

use crate::mcp::connection::{McpConnection, McpToolInfo};

/// Forwards execution to the owning connection's `tools/call`.
pub struct McpProxyTool {
    info: McpToolInfo,
    connection: Arc<McpConnection>,
}

impl McpProxyTool {
    pub fn new(info: McpToolInfo, connection: Arc<McpConnection>) -> Self {
        Self { info, connection }
    }

    pub fn server(&self) -> &str {
        self.connection.qualified_name()
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        self.info.description.as_deref().unwrap_or_default()
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, input: Value) -> ToolResult<ToolOutput> {
        tracing::debug!(tool = %self.info.name, server = self.server(), "Calling remote MCP tool");
        self.connection
            .call_tool(&self.info.name, input)
            .await
            .map_err(|error| ToolError::Remote(error.to_string()))
    }
}
