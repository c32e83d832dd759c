//! Per-agent and per-run configuration.

use serde::{Deserialize, Serialize};

use crate::agent::processor::ProcessorConfig;
use crate::mcp::McpConnectionRequest;

pub const DEFAULT_NATIVE_MAX_AUTO_CONTINUES: usize = 25;
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// A tool kit enabled for an agent, optionally restricted to some methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSelection {
    pub kit: String,
    #[serde(default)]
    pub enabled_methods: Option<Vec<String>>,
}

impl ToolSelection {
    pub fn kit(name: impl Into<String>) -> Self {
        Self {
            kit: name.into(),
            enabled_methods: None,
        }
    }

    pub fn methods(name: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            kit: name.into(),
            enabled_methods: Some(methods.iter().map(|m| m.to_string()).collect()),
        }
    }
}

/// Stored definition of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Kits to register; `None` registers every available kit.
    #[serde(default)]
    pub tools: Option<Vec<ToolSelection>>,
    #[serde(default)]
    pub configured_mcps: Vec<McpConnectionRequest>,
    #[serde(default)]
    pub custom_mcps: Vec<McpConnectionRequest>,
}

impl AgentConfig {
    /// Every MCP server to connect, configured first. A custom entry with
    /// the same qualified name replaces the configured one.
    pub fn mcp_requests(&self) -> Vec<McpConnectionRequest> {
        let mut requests: Vec<McpConnectionRequest> = Vec::new();
        for request in self.configured_mcps.iter().chain(&self.custom_mcps) {
            requests.retain(|existing| existing.qualified_name != request.qualified_name);
            requests.push(request.clone());
        }
        requests
    }
}

/// Everything one run needs besides its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunConfig {
    pub run_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub model: String,
    #[serde(default)]
    pub agent_config: Option<AgentConfig>,
    #[serde(default = "default_native_max_auto_continues")]
    pub native_max_auto_continues: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    pub instance_id: String,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

fn default_native_max_auto_continues() -> usize {
    DEFAULT_NATIVE_MAX_AUTO_CONTINUES
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

impl AgentRunConfig {
    pub fn new(
        run_id: impl Into<String>,
        thread_id: impl Into<String>,
        model: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            thread_id: thread_id.into(),
            project_id: None,
            model: model.into(),
            agent_config: None,
            native_max_auto_continues: DEFAULT_NATIVE_MAX_AUTO_CONTINUES,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            instance_id: instance_id.into(),
            processor: ProcessorConfig::default(),
        }
    }

    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = Some(config);
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_native_max_auto_continues(mut self, limit: usize) -> Self {
        self.native_max_auto_continues = limit;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_config
            .as_ref()
            .and_then(|config| config.agent_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_config_defaults_from_json() {
        let config: AgentRunConfig = serde_json::from_value(json!({
            "run_id": "r1",
            "thread_id": "t1",
            "model": "gpt-4o",
            "instance_id": "worker-1"
        }))
        .unwrap();
        assert_eq!(config.native_max_auto_continues, 25);
        assert_eq!(config.max_iterations, 100);
        assert!(config.processor.xml_tool_calling);
        assert_eq!(config.agent_id(), None);
    }

    #[test]
    fn test_custom_mcp_overrides_configured() {
        let config = AgentConfig {
            configured_mcps: vec![
                McpConnectionRequest::custom("slack", "http://a/mcp"),
                McpConnectionRequest::custom("github", "http://b/mcp"),
            ],
            custom_mcps: vec![McpConnectionRequest::custom("slack", "http://c/mcp")],
            ..Default::default()
        };
        let requests = config.mcp_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].qualified_name, "github");
        assert_eq!(requests[1].config["url"], "http://c/mcp");
    }
}
