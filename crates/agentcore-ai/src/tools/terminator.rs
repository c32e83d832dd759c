//! `ask` and `complete`: the tools that end a run.

use std::sync::Arc;

use agentcore_traits::{Tool, ToolGroup, ToolKit, ToolOutput, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};

pub const ASK_TOOL: &str = "ask";
pub const COMPLETE_TOOL: &str = "complete";

/// Whether calling `name` ends the run after the current iteration.
pub fn is_terminator(name: &str) -> bool {
    name == ASK_TOOL || name == COMPLETE_TOOL
}

struct AskTool;

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        ASK_TOOL
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their response. Use when blocked on missing \
         information or a decision only the user can make."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Question or information for the user"
                },
                "attachments": {
                    "type": "string",
                    "description": "Comma-separated file paths to show the user"
                }
            }
        })
    }

    async fn execute(&self, _input: Value) -> ToolResult<ToolOutput> {
        Ok(ToolOutput::success(json!("Awaiting user response...")))
    }
}

struct CompleteTool;

#[async_trait]
impl Tool for CompleteTool {
    fn name(&self) -> &str {
        COMPLETE_TOOL
    }

    fn description(&self) -> &str {
        "Signal that every task is finished and no further action is needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Optional closing summary"
                }
            }
        })
    }

    async fn execute(&self, _input: Value) -> ToolResult<ToolOutput> {
        Ok(ToolOutput::success(json!("Entering complete state")))
    }
}

/// Core kit always present in a run's registry.
pub struct MessageToolKit;

impl ToolKit for MessageToolKit {
    fn name(&self) -> &str {
        "message_tool"
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Core
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![Arc::new(AskTool), Arc::new(CompleteTool)]
    }
}
