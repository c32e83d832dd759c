//! Tool registry for one agent run

use std::collections::HashMap;
use std::sync::Arc;

use agentcore_traits::{Tool, ToolError, ToolGroup, ToolKit, ToolOutput, ToolResult, ToolSchema, ToolSource};
use serde_json::Value;

use crate::tools::sanitize::sanitize_schema;
use crate::tools::terminator::MessageToolKit;
use crate::tools::validate::validate_arguments;

/// A registered tool with its description and bookkeeping.
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub schema: ToolSchema,
    pub source: ToolSource,
    pub group: ToolGroup,
    pub enabled: bool,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.schema.name)
            .field("source", &self.source)
            .field("group", &self.group)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// A kit plus the subset of its methods to register (`None` = all).
#[derive(Clone)]
pub struct KitSelection {
    pub kit: Arc<dyn ToolKit>,
    pub enabled_methods: Option<Vec<String>>,
}

impl KitSelection {
    pub fn all(kit: Arc<dyn ToolKit>) -> Self {
        Self {
            kit,
            enabled_methods: None,
        }
    }

    pub fn only(kit: Arc<dyn ToolKit>, methods: Vec<String>) -> Self {
        Self {
            kit,
            enabled_methods: Some(methods),
        }
    }
}

/// Registry of callable tools. Names are unique; registering a name again
/// replaces the earlier entry.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry of a run: terminators first, then kits by group
    /// order. Agent-builder kits are skipped without an agent.
    pub fn build(kits: &[KitSelection], has_agent: bool) -> Self {
        let mut registry = Self::new();
        registry.register_kit(&MessageToolKit, None);

        let mut ordered: Vec<&KitSelection> = kits
            .iter()
            .filter(|selection| has_agent || selection.kit.group() != ToolGroup::AgentBuilder)
            .collect();
        ordered.sort_by_key(|selection| selection.kit.group());

        for selection in ordered {
            registry.register_kit(selection.kit.as_ref(), selection.enabled_methods.as_deref());
        }
        registry
    }

    /// Register a kit's methods, optionally restricted to `enabled_methods`.
    /// Returns how many tools were registered.
    pub fn register_kit(&mut self, kit: &dyn ToolKit, enabled_methods: Option<&[String]>) -> usize {
        let group = kit.group();
        let mut registered = 0;
        for tool in kit.tools() {
            if let Some(methods) = enabled_methods
                && !methods.iter().any(|method| method == tool.name())
            {
                continue;
            }
            self.register_tool(tool, group, ToolSource::Native);
            registered += 1;
        }
        tracing::debug!(kit = kit.name(), registered, "Registered tool kit");
        registered
    }

    /// Register tools discovered on an MCP server.
    pub fn register_mcp(&mut self, server: &str, tools: Vec<Arc<dyn Tool>>) -> usize {
        let count = tools.len();
        for tool in tools {
            self.register_tool(tool, ToolGroup::Mcp, ToolSource::Mcp(server.to_string()));
        }
        tracing::info!(server, count, "Registered MCP tools");
        count
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>, group: ToolGroup, source: ToolSource) {
        let schema = tool.schema();
        let name = schema.name.clone();
        if let Some(previous) = self.tools.get(&name) {
            tracing::debug!(
                tool = %name,
                replaced = %previous.source,
                by = %source,
                "Tool registration overrides an earlier one"
            );
            self.order.retain(|existing| existing != &name);
        }
        self.order.push(name.clone());
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                schema,
                source,
                group,
                enabled: true,
            },
        );
    }

    /// Enable or disable a tool. Returns false for unknown names.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.tools.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Callable for an enabled tool.
    pub fn get_callable(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .filter(|entry| entry.enabled)
            .map(|entry| entry.tool.clone())
    }

    /// Schemas of all enabled tools in registration order.
    pub fn get_openapi_schemas(&self) -> Vec<ToolSchema> {
        self.enabled().map(|entry| entry.schema.clone()).collect()
    }

    pub fn get_sanitized_schemas(&self) -> Vec<ToolSchema> {
        self.enabled()
            .map(|entry| ToolSchema {
                parameters: sanitize_schema(&entry.schema.parameters),
                ..entry.schema.clone()
            })
            .collect()
    }

    /// Enabled tools in registration order.
    pub fn enabled(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .filter(|entry| entry.enabled)
    }

    pub fn has_enabled_group(&self, group: ToolGroup) -> bool {
        self.enabled().any(|entry| entry.group == group)
    }

    pub fn mcp_tools(&self) -> Vec<&RegisteredTool> {
        self.enabled()
            .filter(|entry| matches!(entry.source, ToolSource::Mcp(_)))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_callable(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `arguments` against the tool's schema and execute it.
    pub async fn execute(&self, name: &str, arguments: Value) -> ToolResult<ToolOutput> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        if !entry.enabled {
            return Err(ToolError::NotEnabled(name.to_string()));
        }
        validate_arguments(&entry.schema.parameters, &arguments).map_err(ToolError::InvalidInput)?;
        entry.tool.execute(arguments).await
    }
}
