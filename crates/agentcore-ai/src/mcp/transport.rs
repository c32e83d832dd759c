//! JSON-RPC 2.0 transports for MCP servers: Streamable HTTP and the legacy
//! HTTP+SSE pairing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AiError, Result};
use crate::http_client::build_http_client;
use crate::mcp::config::ResolvedServer;

const SESSION_HEADER: &str = "Mcp-Session-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    HttpStream,
    Sse,
}

#[async_trait]
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for its response's `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    async fn notify(&self, method: &str, params: Value) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    method: &'a str,
    params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    fn call(id: i64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        }
    }

    fn notification(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcResponse {
    fn has_id(&self, id: i64) -> bool {
        self.id.as_ref().and_then(Value::as_i64) == Some(id)
    }

    fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(AiError::Mcp(format!(
                "JSON-RPC error {}: {}",
                error.code, error.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Remove complete events from `buffer`, leaving any partial tail in place.
pub(crate) fn drain_sse_events(buffer: &mut String) -> Vec<SseEvent> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        let mut event = None;
        let mut data = Vec::new();
        for line in block.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }
        if event.is_some() || !data.is_empty() {
            events.push(SseEvent {
                event,
                data: data.join("\n"),
            });
        }
    }
    events
}

fn with_headers(mut builder: RequestBuilder, headers: &HashMap<String, String>) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

async fn error_for_status(response: Response, what: &str) -> AiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    AiError::Mcp(format!("{what} failed with {status}: {}", body.chars().take(256).collect::<String>()))
}

/// Streamable HTTP: every message is a POST; responses come back as JSON or
/// as a short SSE body.
pub struct HttpStreamTransport {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl HttpStreamTransport {
    pub fn new(server: &ResolvedServer, timeout: Duration) -> Self {
        Self {
            client: build_http_client(),
            url: server.url.clone(),
            headers: server.headers.clone(),
            session_id: Mutex::new(None),
            next_id: AtomicI64::new(1),
            timeout,
        }
    }

    fn post(&self) -> RequestBuilder {
        let mut builder = with_headers(self.client.post(&self.url), &self.headers)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .timeout(self.timeout);
        if let Some(session) = self.session_id.lock().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    fn remember_session(&self, response: &Response) {
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
    }
}

fn find_response(body: Value, id: i64) -> Option<JsonRpcResponse> {
    let candidates = match body {
        Value::Array(items) => items,
        other => vec![other],
    };
    candidates
        .into_iter()
        .filter_map(|item| serde_json::from_value::<JsonRpcResponse>(item).ok())
        .find(|response| response.has_id(id))
}

#[async_trait]
impl McpTransport for HttpStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStream
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post()
            .json(&JsonRpcRequest::call(id, method, params))
            .send()
            .await?;
        self.remember_session(&response);
        if !response.status().is_success() {
            return Err(error_for_status(response, method).await);
        }

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        let matched = if is_sse {
            let mut body = response.text().await?;
            body.push_str("\n\n");
            drain_sse_events(&mut body)
                .into_iter()
                .filter_map(|event| serde_json::from_str::<Value>(&event.data).ok())
                .find_map(|value| find_response(value, id))
        } else {
            find_response(response.json::<Value>().await?, id)
        };

        matched
            .ok_or_else(|| AiError::Mcp(format!("No response to {method} (id {id})")))?
            .into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let response = self
            .post()
            .json(&JsonRpcRequest::notification(method, params))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_status(response, method).await);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(session) = self.session_id.lock().take() else {
            return Ok(());
        };
        let response = with_headers(self.client.delete(&self.url), &self.headers)
            .header(SESSION_HEADER, session)
            .timeout(self.timeout)
            .send()
            .await?;
        // Servers without explicit session teardown answer 405
        if !response.status().is_success() && response.status().as_u16() != 405 {
            return Err(error_for_status(response, "session close").await);
        }
        Ok(())
    }
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Legacy transport: a long-lived GET event stream carries responses, and
/// requests are POSTed to the endpoint announced on that stream.
pub struct SseTransport {
    client: Client,
    endpoint: String,
    headers: HashMap<String, String>,
    pending: PendingMap,
    next_id: AtomicI64,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl SseTransport {
    pub async fn connect(server: &ResolvedServer, timeout: Duration) -> Result<Self> {
        let client = build_http_client();
        let base = Url::parse(&server.url)
            .map_err(|e| AiError::Mcp(format!("Invalid SSE url {}: {e}", server.url)))?;

        let response = with_headers(client.get(base.as_str()), &server.headers)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_status(response, "SSE connect").await);
        }

        let pending: PendingMap = Arc::default();
        let shutdown = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        tokio::spawn(read_events(
            response,
            pending.clone(),
            shutdown.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(AiError::Mcp(
                    "SSE stream closed before announcing an endpoint".to_string(),
                ));
            }
            Err(_) => {
                shutdown.cancel();
                return Err(AiError::McpTimeout(timeout));
            }
        };
        let endpoint = base
            .join(&endpoint)
            .map_err(|e| AiError::Mcp(format!("Invalid SSE endpoint {endpoint}: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            headers: server.headers.clone(),
            pending,
            next_id: AtomicI64::new(1),
            timeout,
            shutdown,
        })
    }

    async fn post(&self, body: &JsonRpcRequest<'_>) -> Result<()> {
        let response = with_headers(self.client.post(&self.endpoint), &self.headers)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_status(response, body.method).await);
        }
        Ok(())
    }
}

async fn read_events(
    response: Response,
    pending: PendingMap,
    shutdown: CancellationToken,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(error)) => {
                tracing::warn!(error = %error, "MCP SSE stream failed");
                break;
            }
            None => break,
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        for event in drain_sse_events(&mut buffer) {
            match event.event.as_deref() {
                Some("endpoint") => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                }
                Some("message") | None => {
                    let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data) else {
                        tracing::debug!(data = %event.data, "Ignoring unparseable MCP SSE message");
                        continue;
                    };
                    let Some(id) = response.id.as_ref().and_then(Value::as_i64) else {
                        continue;
                    };
                    if let Some(tx) = pending.lock().remove(&id) {
                        let _ = tx.send(response);
                    }
                }
                Some(other) => tracing::debug!(event = other, "Ignoring MCP SSE event"),
            }
        }
    }

    // Waiters see their channel closed
    pending.lock().clear();
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(error) = self.post(&JsonRpcRequest::call(id, method, params)).await {
            self.pending.lock().remove(&id);
            return Err(error);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(AiError::Mcp("SSE stream closed".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(AiError::McpTimeout(self.timeout))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    #[test]
    fn test_drain_sse_events_keeps_partial_tail() {
        let mut buffer =
            "event: endpoint\r\ndata: /messages?session=1\r\n\r\ndata: {\"a\":\ndata: 1}\n\ndata: par".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session=1");
        assert_eq!(events[1].data, "{\"a\":\n1}");
        assert_eq!(buffer, "data: par");
    }

    struct SseResponder;

    impl Respond for SseResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let reply = json!({"jsonrpc": "2.0", "id": body["id"], "result": {"ok": true}});
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "sess-1")
                .set_body_raw(format!("event: message\ndata: {reply}\n\n"), "text/event-stream")
        }
    }

    #[tokio::test]
    async fn test_http_stream_reads_sse_body_and_keeps_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "ping"})))
            .respond_with(SseResponder)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("Mcp-Session-Id", "sess-1"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("Mcp-Session-Id", "sess-1"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(
            &ResolvedServer {
                url: format!("{}/mcp", server.uri()),
                headers: HashMap::new(),
            },
            Duration::from_secs(5),
        );
        let result = transport.request("ping", json!({})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        transport
            .notify("notifications/initialized", json!({}))
            .await
            .unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_stream_surfaces_json_rpc_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "Method not found"}
            })))
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(
            &ResolvedServer {
                url: server.uri(),
                headers: HashMap::new(),
            },
            Duration::from_secs(5),
        );
        let error = transport.request("nope", json!({})).await.unwrap_err();
        assert!(error.to_string().contains("Method not found"));
    }
}
