//! System prompt assembly.
//!
//! Sections are appended in a fixed order: the agent's own prompt, the
//! agent-builder guide, knowledge-base context, the MCP tool summary, the
//! XML calling guide, the UTC date block and the locale hint. History and
//! the temporary message are added per completion by the thread manager.

use std::collections::BTreeMap;

use agentcore_traits::{ToolGroup, ToolSchema, ToolSource};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::agent::config::AgentConfig;
use crate::tools::ToolRegistry;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable autonomous agent. Work through the \
user's request step by step, use the available tools when they help, and report results \
accurately. When every task is finished call `complete`; when you need input from the user \
call `ask`.";

pub const AGENT_BUILDER_PROMPT: &str = "# Agent Builder\n\nYou can create and configure agents \
for the user. Confirm the agent's name, purpose and tools with the user before saving, and \
describe the resulting configuration once it is stored.";

pub const MCP_NO_FABRICATION_DIRECTIVE: &str = "NEVER invent, simulate or guess the output of \
an MCP tool. Only report results that were returned by an actual tool call.";

/// Inputs gathered by the runner before the first iteration.
pub struct PromptInputs<'a> {
    pub agent_config: Option<&'a AgentConfig>,
    pub registry: &'a ToolRegistry,
    pub knowledge: Option<String>,
    pub locale: Option<String>,
    pub xml_tool_calling: bool,
    pub now: DateTime<Utc>,
}

pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    let base = inputs
        .agent_config
        .and_then(|config| config.system_prompt.as_deref())
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    sections.push(base.to_string());

    if inputs.registry.has_enabled_group(ToolGroup::AgentBuilder) {
        sections.push(AGENT_BUILDER_PROMPT.to_string());
    }

    if let Some(knowledge) = inputs.knowledge.as_deref().map(str::trim)
        && !knowledge.is_empty()
    {
        sections.push(format!("# Knowledge Base\n\n{knowledge}"));
    }

    if let Some(summary) = mcp_summary(inputs.registry) {
        sections.push(summary);
    }

    if inputs.xml_tool_calling {
        sections.push(xml_tool_section(&inputs.registry.get_openapi_schemas()));
    }

    sections.push(datetime_block(inputs.now));

    if let Some(locale) = inputs.locale.as_deref().filter(|l| !l.trim().is_empty()) {
        sections.push(format!(
            "# User Locale\n\nThe user's preferred locale is `{locale}`. Reply in that language \
             unless the user writes in another one."
        ));
    }

    sections.join("\n\n")
}

fn mcp_summary(registry: &ToolRegistry) -> Option<String> {
    let remote = registry.mcp_tools();
    if remote.is_empty() {
        return None;
    }

    let mut by_server: BTreeMap<&str, Vec<&ToolSchema>> = BTreeMap::new();
    for entry in &remote {
        if let ToolSource::Mcp(server) = &entry.source {
            by_server.entry(server.as_str()).or_default().push(&entry.schema);
        }
    }

    let mut out = String::from(
        "# External MCP Tools\n\nThese tools are provided by connected MCP servers and are \
         called like any other tool:\n",
    );
    for (server, tools) in by_server {
        out.push_str(&format!("\n## {server}\n"));
        for tool in tools {
            out.push_str(&format!("- `{}`: {}\n", tool.name, first_line(&tool.description)));
        }
    }
    out.push('\n');
    out.push_str(MCP_NO_FABRICATION_DIRECTIVE);
    Some(out)
}

fn xml_tool_section(schemas: &[ToolSchema]) -> String {
    let mut out = String::from(
        "# Tool Calling\n\nCall tools by writing XML in your reply. Use either form:\n\n\
         <function_calls>\n<invoke name=\"tool_name\">\n<parameter name=\"param\">value</parameter>\n\
         </invoke>\n</function_calls>\n\nor the compact form <tool_name param=\"value\"/>.\n\n\
         Tool results arrive in the next message. Do not write tool results yourself.\n\n\
         ## Available Tools\n",
    );
    for schema in schemas {
        out.push_str(&format!("\n### {}\n", schema.name));
        if !schema.description.is_empty() {
            out.push_str(&format!("{}\n", schema.description));
        }
        let required: Vec<&str> = schema
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(properties) = schema.parameters.get("properties").and_then(Value::as_object)
            && !properties.is_empty()
        {
            out.push_str("Parameters:\n");
            for (name, property) in properties {
                let kind = property.get("type").map_or("any".to_string(), type_label);
                let marker = if required.contains(&name.as_str()) {
                    ", required"
                } else {
                    ""
                };
                let description = property
                    .get("description")
                    .and_then(Value::as_str)
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default();
                out.push_str(&format!("- `{name}` ({kind}{marker}){description}\n"));
            }
        }
        let rendered = serde_json::to_string_pretty(&schema.parameters)
            .unwrap_or_else(|_| schema.parameters.to_string());
        out.push_str(&format!("Schema:\n```json\n{rendered}\n```\n"));
        out.push_str(&format!("Example: {}\n", compact_example(schema, &required)));
    }
    out
}

fn compact_example(schema: &ToolSchema, required: &[&str]) -> String {
    let attributes: String = required
        .iter()
        .map(|name| format!(" {name}=\"...\""))
        .collect();
    format!("<{}{attributes}/>", schema.name)
}

fn type_label(kind: &Value) -> String {
    match kind {
        Value::String(kind) => kind.clone(),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

pub fn datetime_block(now: DateTime<Utc>) -> String {
    format!(
        "# Current Date and Time (UTC)\n\n- Date: {}\n- Time: {} UTC\n- Year: {}",
        now.format("%Y-%m-%d (%A)"),
        now.format("%H:%M:%S"),
        now.format("%Y"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agentcore_traits::{Tool, ToolOutput, ToolResult};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "Post to a channel\nwith details"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"channel": {"type": "string", "description": "Channel id"}},
                "required": ["channel"]
            })
        }
        async fn execute(&self, _input: Value) -> ToolResult<ToolOutput> {
            Ok(ToolOutput::success(json!("ok")))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 14, 3, 0).unwrap()
    }

    #[test]
    fn test_sections_in_order() {
        let mut registry = ToolRegistry::build(&[], false);
        registry.register_mcp("slack", vec![Arc::new(NamedTool("slack_post_message")) as Arc<dyn Tool>]);
        let config = AgentConfig {
            system_prompt: Some("You are Ops.".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&PromptInputs {
            agent_config: Some(&config),
            registry: &registry,
            knowledge: Some("Runbooks live in /docs.".into()),
            locale: Some("de-DE".into()),
            xml_tool_calling: true,
            now: now(),
        });

        let positions: Vec<usize> = [
            "You are Ops.",
            "# Knowledge Base",
            "# External MCP Tools",
            "# Tool Calling",
            "# Current Date and Time (UTC)",
            "# User Locale",
        ]
        .iter()
        .map(|marker| prompt.find(marker).unwrap())
        .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(prompt.contains(MCP_NO_FABRICATION_DIRECTIVE));
        assert!(prompt.contains("- `slack_post_message`: Post to a channel\n"));
        assert!(prompt.contains("<slack_post_message channel=\"...\"/>"));
        assert!(prompt.contains("- `channel` (string, required): Channel id\n"));
        let schema = serde_json::to_string_pretty(&NamedTool("x").parameters_schema()).unwrap();
        assert!(prompt.contains(&format!("Schema:\n```json\n{schema}\n```\n")));
        assert!(prompt.contains("- Date: 2026-10-16 (Friday)"));
        assert!(!prompt.contains("# Agent Builder"));
    }

    #[test]
    fn test_defaults_without_optional_sections() {
        let registry = ToolRegistry::build(&[], false);
        let prompt = build_system_prompt(&PromptInputs {
            agent_config: None,
            registry: &registry,
            knowledge: None,
            locale: None,
            xml_tool_calling: false,
            now: now(),
        });
        assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(!prompt.contains("# Tool Calling"));
        assert!(!prompt.contains("# External MCP Tools"));
        assert!(prompt.ends_with("- Year: 2026"));
    }
}
