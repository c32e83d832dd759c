//! In-process MCP server for tests, answering over Streamable HTTP.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[derive(Clone)]
pub(crate) struct McpResponder {
    tools: Value,
    reply: String,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let id = body["id"].clone();
        let result = match body["method"].as_str().unwrap_or_default() {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "test-server", "version": "1.0.0"}
            }),
            "notifications/initialized" => return ResponseTemplate::new(202),
            "tools/list" => json!({"tools": self.tools}),
            "tools/call" => {
                self.calls.lock().push(body["params"].clone());
                json!({"content": [{"type": "text", "text": self.reply}]})
            }
            other => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("Unknown method {other}")}
                }));
            }
        };
        ResponseTemplate::new(200)
            .insert_header("Mcp-Session-Id", "test-session")
            .set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

pub(crate) struct TestMcpServer {
    pub server: MockServer,
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl TestMcpServer {
    pub async fn start(tools: Value, reply: &str) -> Self {
        let server = MockServer::start().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        Mock::given(method("POST"))
            .respond_with(McpResponder {
                tools,
                reply: reply.to_string(),
                calls: calls.clone(),
            })
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Self { server, calls }
    }

    pub fn url(&self) -> String {
        format!("{}/mcp", self.server.uri())
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }
}

pub(crate) fn slack_tools() -> Value {
    json!([
        {
            "name": "slack_post_message",
            "description": "Post a message to a Slack channel",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "channel": {"type": "string"},
                    "text": {"type": "string"}
                },
                "required": ["channel", "text"]
            }
        },
        {
            "name": "slack_delete_message",
            "description": "Delete a Slack message",
            "inputSchema": {"type": "object", "properties": {"ts": {"type": "string"}}}
        }
    ])
}
