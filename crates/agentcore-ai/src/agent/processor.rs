//! Consumes one completion stream: relays text, detects and executes tool
//! calls, records results in the thread and reports usage.

use std::sync::Arc;

use agentcore_traits::{MessageRecord, MessageType, NewMessage, ThreadStore, ToolOutput};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::context::estimate_text_tokens;
use crate::agent::events::{RunEvent, StatusType};
use crate::agent::sink::EventSink;
use crate::agent::xml::XmlToolParser;
use crate::error::Result;
use crate::llm::{FinishReason, StreamResult, TokenUsage, ToolCallAccumulator};
use crate::tools::{ToolRegistry, is_terminator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

/// How XML tool results are written back to the thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XmlAddingStrategy {
    #[default]
    UserMessage,
    AssistantMessage,
    /// Folded into the preceding assistant message when the prompt is built.
    Inline,
}

impl XmlAddingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            XmlAddingStrategy::UserMessage => "user_message",
            XmlAddingStrategy::AssistantMessage => "assistant_message",
            XmlAddingStrategy::Inline => "inline",
        }
    }

    fn role(&self) -> &'static str {
        match self {
            XmlAddingStrategy::UserMessage => "user",
            XmlAddingStrategy::AssistantMessage | XmlAddingStrategy::Inline => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub xml_tool_calling: bool,
    pub native_tool_calling: bool,
    pub execute_tools: bool,
    pub execute_on_stream: bool,
    pub tool_execution_strategy: ToolExecutionStrategy,
    pub xml_adding_strategy: XmlAddingStrategy,
    /// 0 means unlimited.
    pub max_xml_tool_calls: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            xml_tool_calling: true,
            native_tool_calling: false,
            execute_tools: true,
            execute_on_stream: true,
            tool_execution_strategy: ToolExecutionStrategy::Sequential,
            xml_adding_strategy: XmlAddingStrategy::UserMessage,
            max_xml_tool_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallSource {
    Xml,
    Native,
}

#[derive(Debug, Clone)]
struct DetectedCall {
    name: String,
    arguments: Value,
    tool_call_id: Option<String>,
    source: CallSource,
}

struct PendingCall {
    call: DetectedCall,
    handle: Option<JoinHandle<ToolOutput>>,
}

/// One executed tool call.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub name: String,
    pub arguments: Value,
    pub output: ToolOutput,
    pub tool_call_id: Option<String>,
    pub message_id: String,
}

/// What a processed completion produced.
#[derive(Debug, Default)]
pub struct ProcessorOutcome {
    pub content: String,
    pub assistant_message_id: Option<String>,
    pub executions: Vec<ToolExecution>,
    pub usage: Option<TokenUsage>,
    /// Usage was estimated because the stream was cut short.
    pub usage_estimated: bool,
    pub finish_reason: Option<FinishReason>,
    /// Terminator tool called in this completion.
    pub terminator: Option<String>,
    /// Provider error that ended the stream.
    pub error: Option<String>,
    pub cancelled: bool,
    pub chunks: usize,
}

#[derive(Default)]
struct StreamState {
    content: String,
    message: Option<MessageRecord>,
    scan_offset: usize,
    xml_calls_seen: usize,
    xml_limit_reached: bool,
    native: ToolCallAccumulator,
    deferred: Vec<DetectedCall>,
    spawned: Vec<PendingCall>,
}

pub struct ResponseProcessor {
    store: Arc<dyn ThreadStore>,
    registry: Arc<ToolRegistry>,
    config: ProcessorConfig,
    parser: XmlToolParser,
    cancel: CancellationToken,
}

impl ResponseProcessor {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        registry: Arc<ToolRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        let parser = XmlToolParser::new(&registry.get_openapi_schemas());
        Self {
            store,
            registry,
            config,
            parser,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Drive `stream` to its end (or until cancelled), emitting events in
    /// order. Provider failures are reported through the outcome; only
    /// store failures are returned as errors.
    pub async fn process(
        &self,
        thread_id: &str,
        model: &str,
        prompt_tokens_estimate: u32,
        mut stream: StreamResult,
        sink: &mut dyn EventSink,
    ) -> Result<ProcessorOutcome> {
        let mut outcome = ProcessorOutcome::default();
        let mut state = StreamState::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => {
                    tracing::warn!(thread_id, error = %error, "Provider stream failed");
                    sink.emit(RunEvent::status_with_message(StatusType::Error, error.to_string()))
                        .await;
                    outcome.error = Some(error.to_string());
                    break;
                }
            };
            outcome.chunks += 1;

            if !chunk.text.is_empty() {
                sink.emit(RunEvent::assistant(chunk.text.clone())).await;
                state.content.push_str(&chunk.text);
                self.persist_assistant(thread_id, &mut state, None).await?;
                if outcome.assistant_message_id.is_none() {
                    outcome.assistant_message_id = state.message.as_ref().map(|m| m.id.clone());
                }
            }
            if let Some(delta) = &chunk.tool_call_delta
                && self.config.native_tool_calling
            {
                state.native.accumulate(delta);
            }
            if chunk.usage.is_some() {
                outcome.usage = chunk.usage;
            }
            if chunk.finish_reason.is_some() {
                outcome.finish_reason = chunk.finish_reason;
            }

            if self.config.xml_tool_calling {
                self.detect_xml(thread_id, &mut state, &mut outcome, false, sink)
                    .await?;
            }
        }

        let ended_normally = !outcome.cancelled && outcome.error.is_none();
        if ended_normally && self.config.xml_tool_calling {
            self.detect_xml(thread_id, &mut state, &mut outcome, true, sink)
                .await?;
        }

        let native_calls = std::mem::take(&mut state.native).finalize();
        if ended_normally && !native_calls.is_empty() {
            for call in &native_calls {
                self.note_terminator(&call.name, &mut outcome);
                if !self.config.execute_tools {
                    sink.emit(RunEvent::tool_detected(
                        &call.name,
                        call.arguments.clone(),
                        is_terminator(&call.name),
                    ))
                    .await;
                    continue;
                }
                state.deferred.push(DetectedCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    tool_call_id: Some(call.id.clone()),
                    source: CallSource::Native,
                });
            }
        }
        let native_value = (!native_calls.is_empty()).then(|| {
            Value::Array(
                native_calls
                    .iter()
                    .map(|call| json!({"id": call.id, "name": call.name, "arguments": call.arguments}))
                    .collect(),
            )
        });

        if state.message.is_none() && (!state.content.is_empty() || native_value.is_some()) {
            self.persist_assistant(thread_id, &mut state, native_value.clone())
                .await?;
        }
        outcome.assistant_message_id = state.message.as_ref().map(|m| m.id.clone());

        let spawned = std::mem::take(&mut state.spawned);
        for pending in spawned {
            self.resolve_pending(thread_id, pending, &mut outcome, sink)
                .await?;
        }
        if ended_normally && self.config.execute_tools {
            let deferred = std::mem::take(&mut state.deferred);
            self.execute_deferred(thread_id, deferred, &mut outcome, sink)
                .await?;
        }

        if outcome.usage.is_none() && outcome.cancelled && outcome.chunks > 0 {
            outcome.usage = Some(TokenUsage::new(
                prompt_tokens_estimate,
                estimate_text_tokens(&state.content) as u32,
            ));
            outcome.usage_estimated = true;
        }
        if let Some(usage) = &outcome.usage {
            sink.emit(RunEvent::Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                model: model.to_string(),
            })
            .await;
        }

        if let Some(message) = state.message.as_mut() {
            let stream_status = if outcome.cancelled {
                "cancelled"
            } else if outcome.error.is_some() {
                "error"
            } else {
                "complete"
            };
            message.content = assistant_content(&state.content, native_value);
            message.metadata = json!({"stream_status": stream_status, "model": model});
            self.store.update_message(message).await?;
        }

        outcome.content = state.content;
        Ok(outcome)
    }

    /// Create the assistant message on first use, update it afterwards.
    async fn persist_assistant(
        &self,
        thread_id: &str,
        state: &mut StreamState,
        tool_calls: Option<Value>,
    ) -> Result<()> {
        let content = assistant_content(&state.content, tool_calls);
        match state.message.as_mut() {
            Some(message) => {
                message.content = content;
                self.store.update_message(message).await?;
            }
            None => {
                let message = NewMessage::new(thread_id, MessageType::Assistant, content)
                    .with_metadata(json!({"stream_status": "streaming"}));
                state.message = Some(self.store.append_message(message).await?);
            }
        }
        Ok(())
    }

    async fn detect_xml(
        &self,
        thread_id: &str,
        state: &mut StreamState,
        outcome: &mut ProcessorOutcome,
        finished: bool,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        while !state.xml_limit_reached {
            let Some(block) = self
                .parser
                .next_block(&state.content, state.scan_offset, finished)
            else {
                break;
            };
            state.scan_offset = block.end;

            for call in block.calls {
                let limit = self.config.max_xml_tool_calls;
                if limit > 0 && state.xml_calls_seen >= limit {
                    state.xml_limit_reached = true;
                    tracing::debug!(thread_id, limit, "XML tool call limit reached");
                    break;
                }
                state.xml_calls_seen += 1;
                self.note_terminator(&call.name, outcome);

                let detected = DetectedCall {
                    name: call.name,
                    arguments: call.arguments,
                    tool_call_id: None,
                    source: CallSource::Xml,
                };
                if !self.config.execute_tools {
                    sink.emit(RunEvent::tool_detected(
                        &detected.name,
                        detected.arguments.clone(),
                        is_terminator(&detected.name),
                    ))
                    .await;
                    continue;
                }
                if !self.config.execute_on_stream || finished {
                    state.deferred.push(detected);
                    continue;
                }
                sink.emit(RunEvent::tool_started(
                    &detected.name,
                    is_terminator(&detected.name),
                ))
                .await;
                match self.config.tool_execution_strategy {
                    ToolExecutionStrategy::Sequential => {
                        let output = execute_call(&self.registry, &detected).await;
                        self.record(thread_id, detected, output, outcome, sink)
                            .await?;
                    }
                    ToolExecutionStrategy::Parallel => {
                        let registry = self.registry.clone();
                        let spawned_call = detected.clone();
                        let handle = tokio::spawn(async move {
                            execute_call(&registry, &spawned_call).await
                        });
                        state.spawned.push(PendingCall {
                            call: detected,
                            handle: Some(handle),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute_deferred(
        &self,
        thread_id: &str,
        calls: Vec<DetectedCall>,
        outcome: &mut ProcessorOutcome,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        match self.config.tool_execution_strategy {
            ToolExecutionStrategy::Sequential => {
                for call in calls {
                    sink.emit(RunEvent::tool_started(&call.name, is_terminator(&call.name)))
                        .await;
                    let output = execute_call(&self.registry, &call).await;
                    self.record(thread_id, call, output, outcome, sink).await?;
                }
            }
            ToolExecutionStrategy::Parallel => {
                for call in &calls {
                    sink.emit(RunEvent::tool_started(&call.name, is_terminator(&call.name)))
                        .await;
                }
                let outputs = futures::future::join_all(
                    calls.iter().map(|call| execute_call(&self.registry, call)),
                )
                .await;
                for (call, output) in calls.into_iter().zip(outputs) {
                    self.record(thread_id, call, output, outcome, sink).await?;
                }
            }
        }
        Ok(())
    }

    async fn resolve_pending(
        &self,
        thread_id: &str,
        mut pending: PendingCall,
        outcome: &mut ProcessorOutcome,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let output = match pending.handle.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| ToolOutput::error(format!("Tool task failed: {e}"))),
            None => execute_call(&self.registry, &pending.call).await,
        };
        self.record(thread_id, pending.call, output, outcome, sink)
            .await
    }

    /// Emit the tool event and append the thread message for one result.
    async fn record(
        &self,
        thread_id: &str,
        call: DetectedCall,
        output: ToolOutput,
        outcome: &mut ProcessorOutcome,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let text = output.content_string();
        if !output.success {
            tracing::info!(thread_id, tool = %call.name, error = %text, "Tool call failed");
        }
        sink.emit(RunEvent::Tool {
            name: call.name.clone(),
            success: output.success,
            content: text.clone(),
            error: output.error.clone(),
            tool_call_id: call.tool_call_id.clone(),
        })
        .await;

        let assistant_message_id = outcome.assistant_message_id.clone();
        let message = match call.source {
            CallSource::Native => NewMessage::new(
                thread_id,
                MessageType::Tool,
                json!({
                    "role": "tool",
                    "tool_call_id": call.tool_call_id,
                    "content": text,
                }),
            )
            .with_metadata(json!({
                "tool_name": call.name,
                "success": output.success,
                "source": "native",
                "tool_call_id": call.tool_call_id,
                "assistant_message_id": assistant_message_id,
            })),
            CallSource::Xml => {
                let strategy = self.config.xml_adding_strategy;
                NewMessage::new(
                    thread_id,
                    MessageType::Tool,
                    json!({
                        "role": strategy.role(),
                        "content": format_xml_result(&call.name, &output),
                    }),
                )
                .with_metadata(json!({
                    "tool_name": call.name,
                    "success": output.success,
                    "source": "xml",
                    "strategy": strategy.as_str(),
                    "assistant_message_id": assistant_message_id,
                }))
            }
        };
        let record = self.store.append_message(message).await?;

        outcome.executions.push(ToolExecution {
            name: call.name,
            arguments: call.arguments,
            output,
            tool_call_id: call.tool_call_id,
            message_id: record.id,
        });
        Ok(())
    }

    fn note_terminator(&self, name: &str, outcome: &mut ProcessorOutcome) {
        if is_terminator(name) && outcome.terminator.is_none() {
            outcome.terminator = Some(name.to_string());
        }
    }
}

async fn execute_call(registry: &ToolRegistry, call: &DetectedCall) -> ToolOutput {
    match registry.execute(&call.name, call.arguments.clone()).await {
        Ok(output) => output,
        Err(error) => ToolOutput::error(error.to_string()),
    }
}

fn assistant_content(text: &str, tool_calls: Option<Value>) -> Value {
    match tool_calls {
        Some(calls) => json!({"role": "assistant", "content": text, "tool_calls": calls}),
        None => json!({"role": "assistant", "content": text}),
    }
}

/// Result text written back for an XML call.
pub fn format_xml_result(name: &str, output: &ToolOutput) -> String {
    format!(
        "<tool_result name=\"{name}\" success=\"{}\">{}</tool_result>",
        output.success,
        output.content_string()
    )
}

#[cfg(test)]
mod tests {
    use agentcore_traits::ToolGroup;

    use super::*;
    use crate::agent::sink::CollectingSink;
    use crate::llm::{CompletionRequest, LlmClient, Message, MockLlmClient, MockStep};
    use crate::testing::{InMemoryThreadStore, StaticToolKit, search_web_tool};
    use crate::tools::KitSelection;

    const THREAD: &str = "thread-1";

    fn registry() -> Arc<ToolRegistry> {
        let kit = StaticToolKit::new(
            "web",
            ToolGroup::Utility,
            vec![Arc::new(search_web_tool("hits"))],
        );
        Arc::new(ToolRegistry::build(&[KitSelection::all(Arc::new(kit))], false))
    }

    fn stream(step: MockStep) -> StreamResult {
        MockLlmClient::from_steps(vec![step])
            .complete_stream(CompletionRequest::new("gpt-4o", vec![Message::user("go")]))
    }

    async fn run(
        config: ProcessorConfig,
        step: MockStep,
    ) -> (ProcessorOutcome, Vec<RunEvent>, Arc<InMemoryThreadStore>) {
        let store = Arc::new(InMemoryThreadStore::new());
        let processor = ResponseProcessor::new(store.clone(), registry(), config);
        let mut sink = CollectingSink::new();
        let outcome = processor
            .process(THREAD, "gpt-4o", 100, stream(step), &mut sink)
            .await
            .unwrap();
        (outcome, sink.events, store)
    }

    fn kinds(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                RunEvent::Assistant { .. } => "assistant".to_string(),
                RunEvent::Tool { name, .. } => format!("tool:{name}"),
                RunEvent::Status {
                    status_type, tool, ..
                } => format!("status:{status_type:?}:{}", tool.clone().unwrap_or_default()),
                RunEvent::Usage { .. } => "usage".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_xml_call_executes_mid_stream() {
        let (outcome, events, store) = run(
            ProcessorConfig::default(),
            MockStep::chunks(["Let me search. <search_", "web query=\"x\"/>", " Done."])
                .with_usage(10, 5),
        )
        .await;

        assert_eq!(
            kinds(&events),
            vec![
                "assistant",
                "assistant",
                "status:ToolStarted:search_web",
                "tool:search_web",
                "assistant",
                "usage"
            ]
        );
        assert_eq!(outcome.executions.len(), 1);
        assert_eq!(outcome.executions[0].arguments, json!({"query": "x"}));
        assert_eq!(outcome.usage, Some(TokenUsage::new(10, 5)));
        assert!(outcome.terminator.is_none());

        let messages = store.messages(THREAD);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::Assistant);
        assert_eq!(messages[0].text(), "Let me search. <search_web query=\"x\"/> Done.");
        assert_eq!(messages[0].metadata["stream_status"], "complete");
        assert_eq!(messages[1].message_type, MessageType::Tool);
        assert_eq!(messages[1].role(), Some("user"));
        assert!(messages[1].text().contains(">hits</tool_result>"));
        assert_eq!(
            messages[1].metadata["assistant_message_id"],
            json!(messages[0].id)
        );
    }

    #[tokio::test]
    async fn test_excess_xml_blocks_stay_text() {
        let (outcome, events, _) = run(
            ProcessorConfig::default(),
            MockStep::text("<search_web query=\"a\"/><search_web query=\"b\"/>"),
        )
        .await;
        assert_eq!(outcome.executions.len(), 1);
        assert_eq!(outcome.executions[0].arguments["query"], "a");
        assert_eq!(
            events.iter().filter(|e| matches!(e, RunEvent::Tool { .. })).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_calls_become_failed_results() {
        let config = ProcessorConfig {
            max_xml_tool_calls: 0,
            ..Default::default()
        };
        let text = "<function_calls><invoke name=\"deploy\"></invoke>\
                    <invoke name=\"search_web\"></invoke></function_calls>";
        let (outcome, events, store) = run(config, MockStep::text(text)).await;

        assert_eq!(outcome.executions.len(), 2);
        assert!(outcome.executions.iter().all(|e| !e.output.success));
        assert!(matches!(
            &events[2],
            RunEvent::Tool { name, success: false, error: Some(error), .. }
                if name == "deploy" && error.contains("not found")
        ));
        assert_eq!(store.messages_of_type(THREAD, MessageType::Tool).len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_starts_at_detection_and_records_in_order() {
        let config = ProcessorConfig {
            max_xml_tool_calls: 0,
            tool_execution_strategy: ToolExecutionStrategy::Parallel,
            ..Default::default()
        };
        let (outcome, events, _) = run(
            config,
            MockStep::chunks(["<search_web query=\"1\"/>", " then ", "<complete/>"]),
        )
        .await;
        let kinds = kinds(&events);

        // Started as soon as the first block closed, before the next delta.
        assert_eq!(&kinds[..3], &["assistant", "status:ToolStarted:search_web", "assistant"]);

        let tools: Vec<&String> = kinds.iter().filter(|k| k.starts_with("tool:")).collect();
        assert_eq!(tools, vec!["tool:search_web", "tool:complete"]);
        let last_started = kinds.iter().rposition(|k| k.starts_with("status:")).unwrap();
        let first_result = kinds.iter().position(|k| k.starts_with("tool:")).unwrap();
        assert!(last_started < first_result);
        assert_eq!(outcome.terminator.as_deref(), Some("complete"));
    }

    #[tokio::test]
    async fn test_parsed_calls_reported_without_execution() {
        let config = ProcessorConfig {
            execute_tools: false,
            ..Default::default()
        };
        let (outcome, events, store) = run(
            config,
            MockStep::text("<search_web query=\"x\"/>").with_usage(10, 5),
        )
        .await;

        assert_eq!(
            kinds(&events),
            vec!["assistant", "status:ToolStarted:search_web", "usage"]
        );
        match &events[1] {
            RunEvent::Status {
                metadata: Some(meta),
                ..
            } => {
                assert_eq!(meta["arguments"], json!({"query": "x"}));
                assert_eq!(meta["executed"], false);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(outcome.executions.is_empty());
        assert!(store.messages_of_type(THREAD, MessageType::Tool).is_empty());
    }

    #[tokio::test]
    async fn test_terminator_flags_should_terminate() {
        let (outcome, events, _) = run(ProcessorConfig::default(), MockStep::text("<complete/>")).await;
        assert_eq!(outcome.terminator.as_deref(), Some("complete"));
        assert!(events.iter().any(|event| matches!(
            event,
            RunEvent::Status { metadata: Some(meta), .. } if meta["agent_should_terminate"] == true
        )));
    }

    #[tokio::test]
    async fn test_native_tool_call_recorded_as_tool_role() {
        let config = ProcessorConfig {
            native_tool_calling: true,
            ..Default::default()
        };
        let (outcome, events, store) = run(
            config,
            MockStep::tool_call("call_9", "search_web", json!({"query": "rust"})),
        )
        .await;

        assert_eq!(outcome.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(outcome.executions[0].tool_call_id.as_deref(), Some("call_9"));
        assert!(matches!(&events[1], RunEvent::Tool { tool_call_id: Some(id), .. } if id == "call_9"));

        let messages = store.messages(THREAD);
        assert_eq!(messages[0].content["tool_calls"][0]["name"], "search_web");
        assert_eq!(messages[1].role(), Some("tool"));
        assert_eq!(messages[1].content["tool_call_id"], "call_9");
    }

    #[tokio::test]
    async fn test_deferred_execution_runs_after_stream() {
        let config = ProcessorConfig {
            execute_on_stream: false,
            xml_adding_strategy: XmlAddingStrategy::Inline,
            ..Default::default()
        };
        let (_, events, store) = run(
            config,
            MockStep::chunks(["<search_web query=\"x\"/>", " more text"]),
        )
        .await;
        assert_eq!(
            kinds(&events),
            vec![
                "assistant",
                "assistant",
                "status:ToolStarted:search_web",
                "tool:search_web",
                "usage"
            ]
        );
        let tool = &store.messages_of_type(THREAD, MessageType::Tool)[0];
        assert_eq!(tool.role(), Some("assistant"));
        assert_eq!(tool.metadata["strategy"], "inline");
    }

    #[tokio::test]
    async fn test_provider_error_reported_without_usage() {
        let (outcome, events, store) = run(
            ProcessorConfig::default(),
            MockStep::stream_error(["partial "], "connection reset"),
        )
        .await;
        assert!(outcome.error.as_deref().unwrap().contains("connection reset"));
        assert!(outcome.usage.is_none());
        assert_eq!(
            events.last().and_then(RunEvent::status_type),
            Some(StatusType::Error)
        );
        assert_eq!(store.messages(THREAD)[0].metadata["stream_status"], "error");
    }

    struct CancelAfterFirstChunk {
        token: CancellationToken,
        events: Vec<RunEvent>,
    }

    #[async_trait::async_trait]
    impl EventSink for CancelAfterFirstChunk {
        async fn emit(&mut self, event: RunEvent) {
            if matches!(event, RunEvent::Assistant { .. }) {
                self.token.cancel();
            }
            self.events.push(event);
        }
    }

    #[tokio::test]
    async fn test_cancellation_keeps_current_chunk_and_estimates_usage() {
        let store = Arc::new(InMemoryThreadStore::new());
        let token = CancellationToken::new();
        let processor = ResponseProcessor::new(store.clone(), registry(), ProcessorConfig::default())
            .with_cancellation(token.clone());
        let mut sink = CancelAfterFirstChunk {
            token,
            events: Vec::new(),
        };

        let outcome = processor
            .process(
                THREAD,
                "gpt-4o",
                400,
                stream(MockStep::chunks(["first chunk", " second"]).with_chunk_delay(20)),
                &mut sink,
            )
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.usage_estimated);
        assert_eq!(outcome.usage, Some(TokenUsage::new(400, 3)));
        assert_eq!(outcome.content, "first chunk");
        let messages = store.messages(THREAD);
        assert_eq!(messages[0].text(), "first chunk");
        assert_eq!(messages[0].metadata["stream_status"], "cancelled");
    }
}
