//! Pool of MCP connections owned by one agent run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentcore_traits::{Tool, ToolError, ToolOutput};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{AiError, Result};
use crate::mcp::config::{McpConnectionRequest, McpProvider, McpResolver, ResolvedServer};
use crate::mcp::connection::McpConnection;
use crate::mcp::tool::McpProxyTool;
use crate::mcp::transport::{HttpStreamTransport, McpTransport, SseTransport};

#[derive(Debug, Clone)]
pub struct McpTimeouts {
    pub http_connect: Duration,
    pub sse_connect: Duration,
    pub retry_backoff: Duration,
    pub disconnect: Duration,
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            http_connect: Duration::from_secs(30),
            sse_connect: Duration::from_secs(20),
            retry_backoff: Duration::from_millis(500),
            disconnect: Duration::from_secs(5),
        }
    }
}

/// Open sessions keyed by qualified server name. Dropping the pool closes
/// whatever is still open.
pub struct McpClientPool {
    resolver: McpResolver,
    timeouts: McpTimeouts,
    connections: RwLock<HashMap<String, Arc<McpConnection>>>,
}

impl McpClientPool {
    pub fn new(resolver: McpResolver) -> Self {
        Self {
            resolver,
            timeouts: McpTimeouts::default(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: McpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Connect every server concurrently. Failures are logged and skipped;
    /// returns the names that connected.
    pub async fn connect_all(&self, requests: &[McpConnectionRequest]) -> Vec<String> {
        let attempts = requests.iter().map(|request| async move {
            match self.connect(request).await {
                Ok(connection) => Some(connection.qualified_name().to_string()),
                Err(error) => {
                    tracing::warn!(
                        server = %request.qualified_name,
                        error = %error,
                        "Skipping MCP server that failed to connect"
                    );
                    None
                }
            }
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    pub async fn connect(&self, request: &McpConnectionRequest) -> Result<Arc<McpConnection>> {
        let server = self.resolver.resolve(request).await?;

        let connection = match self.open_http(&server, request).await {
            Ok(connection) => connection,
            Err(error) if request.provider == McpProvider::Pipedream => {
                tracing::warn!(
                    server = %request.qualified_name,
                    error = %error,
                    "HTTP stream connect failed, falling back to SSE"
                );
                self.open_sse(&server, request).await?
            }
            Err(error) => return Err(error),
        };

        let connection = Arc::new(connection);
        tracing::info!(
            server = %request.qualified_name,
            transport = ?connection.transport_kind(),
            tools = connection.catalog().len(),
            "MCP server connected"
        );
        self.connections
            .write()
            .insert(request.qualified_name.clone(), connection.clone());
        Ok(connection)
    }

    /// HTTP stream session; a timeout is retried once after a short back-off.
    async fn open_http(
        &self,
        server: &ResolvedServer,
        request: &McpConnectionRequest,
    ) -> Result<McpConnection> {
        let limit = self.timeouts.http_connect;
        let mut retried = false;
        loop {
            let transport: Arc<dyn McpTransport> = Arc::new(HttpStreamTransport::new(server, limit));
            let open = McpConnection::open(
                &request.qualified_name,
                &server.url,
                transport,
                request.enabled_tools.clone(),
            );
            match tokio::time::timeout(limit, open).await {
                Ok(result) => return result,
                Err(_) if !retried => {
                    retried = true;
                    tracing::warn!(
                        server = %request.qualified_name,
                        timeout_ms = limit.as_millis() as u64,
                        "MCP connect timed out, retrying once"
                    );
                    tokio::time::sleep(self.timeouts.retry_backoff).await;
                }
                Err(_) => return Err(AiError::McpTimeout(limit)),
            }
        }
    }

    async fn open_sse(
        &self,
        server: &ResolvedServer,
        request: &McpConnectionRequest,
    ) -> Result<McpConnection> {
        let limit = self.timeouts.sse_connect;
        let open = async {
            let transport: Arc<dyn McpTransport> = Arc::new(SseTransport::connect(server, limit).await?);
            McpConnection::open(
                &request.qualified_name,
                &server.url,
                transport,
                request.enabled_tools.clone(),
            )
            .await
        };
        tokio::time::timeout(limit, open)
            .await
            .map_err(|_| AiError::McpTimeout(limit))?
    }

    pub fn get(&self, qualified_name: &str) -> Option<Arc<McpConnection>> {
        self.connections.read().get(qualified_name).cloned()
    }

    pub fn connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Connection whose catalog lists `tool_name`.
    pub fn connection_for_tool(&self, tool_name: &str) -> Option<Arc<McpConnection>> {
        self.connections
            .read()
            .values()
            .find(|connection| connection.has_tool(tool_name))
            .cloned()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let connection = self
            .connection_for_tool(name)
            .ok_or_else(|| AiError::Tool(ToolError::NotFound(name.to_string())))?;
        connection.call_tool(name, arguments).await
    }

    /// Registry proxies for every callable remote tool, grouped by server
    /// in name order.
    pub fn proxy_tools(&self) -> Vec<(String, Vec<Arc<dyn Tool>>)> {
        let mut connections: Vec<Arc<McpConnection>> =
            self.connections.read().values().cloned().collect();
        connections.sort_by(|a, b| a.qualified_name().cmp(b.qualified_name()));
        connections
            .into_iter()
            .map(|connection| {
                let tools = connection
                    .callable_tools()
                    .map(|info| {
                        Arc::new(McpProxyTool::new(info.clone(), connection.clone())) as Arc<dyn Tool>
                    })
                    .collect();
                (connection.qualified_name().to_string(), tools)
            })
            .collect()
    }

    /// Close every session, each bounded by the disconnect timeout.
    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<McpConnection>> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        close_all(connections, self.timeouts.disconnect).await;
    }
}

async fn close_all(connections: Vec<Arc<McpConnection>>, limit: Duration) {
    for connection in connections {
        match tokio::time::timeout(limit, connection.close()).await {
            Ok(Ok(())) => {
                tracing::debug!(server = connection.qualified_name(), "MCP session closed")
            }
            Ok(Err(error)) => tracing::warn!(
                server = connection.qualified_name(),
                error = %error,
                "MCP session close failed"
            ),
            Err(_) => tracing::warn!(
                server = connection.qualified_name(),
                "MCP session close timed out"
            ),
        }
    }
}

impl Drop for McpClientPool {
    fn drop(&mut self) {
        let connections: Vec<Arc<McpConnection>> =
            self.connections.get_mut().drain().map(|(_, c)| c).collect();
        if connections.is_empty() {
            return;
        }
        let limit = self.timeouts.disconnect;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_all(connections, limit));
            }
            Err(_) => tracing::debug!("No runtime to close MCP sessions on drop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_server::{TestMcpServer, slack_tools};
    use serde_json::json;

    fn fast_timeouts() -> McpTimeouts {
        McpTimeouts {
            http_connect: Duration::from_secs(2),
            sse_connect: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(10),
            disconnect: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_connect_discovers_catalog_and_calls_tool() {
        let server = TestMcpServer::start(slack_tools(), "ok: ts=1").await;
        let pool = McpClientPool::new(McpResolver::default()).with_timeouts(fast_timeouts());

        let connected = pool
            .connect_all(&[McpConnectionRequest::custom("slack", server.url())])
            .await;
        assert_eq!(connected, vec!["slack".to_string()]);

        let output = pool
            .call_tool("slack_post_message", json!({"channel": "C", "text": "hi"}))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.content_string(), "ok: ts=1");
        assert_eq!(
            server.calls(),
            vec![json!({"name": "slack_post_message", "arguments": {"channel": "C", "text": "hi"}})]
        );

        pool.disconnect_all().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_skipped() {
        let server = TestMcpServer::start(slack_tools(), "ok").await;
        let pool = McpClientPool::new(McpResolver::default()).with_timeouts(fast_timeouts());

        let connected = pool
            .connect_all(&[
                McpConnectionRequest::custom("down", "http://127.0.0.1:9/mcp"),
                McpConnectionRequest::custom("slack", server.url()),
            ])
            .await;
        assert_eq!(connected, vec!["slack".to_string()]);
        assert!(pool.get("down").is_none());
        assert_eq!(pool.proxy_tools()[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_enabled_tools_restrict_calls_and_proxies() {
        let server = TestMcpServer::start(slack_tools(), "ok").await;
        let pool = McpClientPool::new(McpResolver::default()).with_timeouts(fast_timeouts());
        pool.connect(
            &McpConnectionRequest::custom("slack", server.url())
                .with_enabled_tools(vec!["slack_post_message".to_string()]),
        )
        .await
        .unwrap();

        let proxies = pool.proxy_tools();
        assert_eq!(proxies[0].1.len(), 1);
        assert_eq!(proxies[0].1[0].name(), "slack_post_message");

        let denied = pool.call_tool("slack_delete_message", json!({"ts": "1"})).await;
        assert!(denied.is_err());
        assert!(server.calls().is_empty());
        assert!(pool.call_tool("unknown", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_proxy_tool_forwards_to_connection() {
        let server = TestMcpServer::start(slack_tools(), "posted").await;
        let pool = McpClientPool::new(McpResolver::default()).with_timeouts(fast_timeouts());
        pool.connect(&McpConnectionRequest::custom("slack", server.url()))
            .await
            .unwrap();

        let (_, tools) = pool.proxy_tools().remove(0);
        let post = tools
            .into_iter()
            .find(|tool| tool.name() == "slack_post_message")
            .unwrap();
        let output = post.execute(json!({"channel": "C", "text": "x"})).await.unwrap();
        assert_eq!(output.content_string(), "posted");
    }
}
