//! An initialized MCP session and its cached tool catalog.

use std::sync::Arc;

use agentcore_traits::{ToolOutput, ToolSchema};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{AiError, Result};
use crate::mcp::transport::{McpTransport, TransportKind};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Tool advertised by a server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl McpToolInfo {
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            parameters: self.input_schema.clone(),
        }
    }
}

pub struct McpConnection {
    qualified_name: String,
    url: String,
    transport: Arc<dyn McpTransport>,
    catalog: Vec<McpToolInfo>,
    enabled_tools: Vec<String>,
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("qualified_name", &self.qualified_name)
            .field("url", &self.url)
            .field("transport", &self.transport.kind())
            .field("tools", &self.catalog.len())
            .finish()
    }
}

impl McpConnection {
    /// Initialize the session over `transport` and fetch the tool catalog.
    pub async fn open(
        qualified_name: &str,
        url: &str,
        transport: Arc<dyn McpTransport>,
        enabled_tools: Vec<String>,
    ) -> Result<Self> {
        let init = transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "agentcore",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        let server_info = init.get("serverInfo").cloned().unwrap_or_default();
        tracing::debug!(
            server = qualified_name,
            server_info = %server_info,
            "MCP session initialized"
        );
        transport
            .notify("notifications/initialized", json!({}))
            .await?;

        let listed = transport.request("tools/list", json!({})).await?;
        let catalog: Vec<McpToolInfo> = match listed.get("tools") {
            Some(tools) => serde_json::from_value(tools.clone())?,
            None => Vec::new(),
        };

        Ok(Self {
            qualified_name: qualified_name.to_string(),
            url: url.to_string(),
            transport,
            catalog,
            enabled_tools,
        })
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn catalog(&self) -> &[McpToolInfo] {
        &self.catalog
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.catalog.iter().any(|tool| tool.name == name)
    }

    /// Whether `name` may be called; an empty allow-list permits everything.
    pub fn allows(&self, name: &str) -> bool {
        self.enabled_tools.is_empty() || self.enabled_tools.iter().any(|tool| tool == name)
    }

    /// Catalog entries callable on this connection.
    pub fn callable_tools(&self) -> impl Iterator<Item = &McpToolInfo> {
        self.catalog.iter().filter(|tool| self.allows(&tool.name))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        if !self.allows(name) {
            return Err(AiError::Mcp(format!(
                "Tool {name} is not enabled on {}",
                self.qualified_name
            )));
        }
        let result = self
            .transport
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;

        let content = normalize_content(&result);
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Ok(ToolOutput::error(content));
        }
        Ok(ToolOutput::success(Value::String(content)))
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// Flatten a `tools/call` result to one string: text blocks are joined,
/// bare strings pass through, anything else is serialized.
pub fn normalize_content(result: &Value) -> String {
    match result.get("content") {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(text) => Some(text.clone()),
                other => other.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => match result {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        },
    }
}
