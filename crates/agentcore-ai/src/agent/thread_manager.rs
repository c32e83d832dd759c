//! Thread history, prompt messages and the completion call of one iteration.

use std::sync::Arc;

use agentcore_traits::{MessageRecord, MessageType, NewMessage, ThreadStore, ToolSchema};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::agent::context::{ContextBudget, Summarizer, estimate_tokens, fold_split};
use crate::agent::processor::{ProcessorConfig, ProcessorOutcome, ResponseProcessor};
use crate::agent::sink::EventSink;
use crate::error::{AiError, Result};
use crate::llm::{
    CompletionRequest, LlmClient, Message, ModelCatalog, Role, StreamResult, ToolCall, ToolChoice,
    supports_full_schema,
};
use crate::tools::ToolRegistry;

const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

/// Inputs of one `run_thread` call.
pub struct ThreadRunRequest<'a> {
    pub thread_id: &'a str,
    pub model: &'a str,
    pub system_prompt: &'a str,
    /// Appended last and never persisted.
    pub temporary_message: Option<Message>,
    pub registry: Arc<ToolRegistry>,
    pub processor: ProcessorConfig,
    pub cancel: CancellationToken,
}

pub struct ThreadManager {
    store: Arc<dyn ThreadStore>,
    llm: Arc<dyn LlmClient>,
    catalog: Arc<ModelCatalog>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ThreadManager {
    pub fn new(store: Arc<dyn ThreadStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            store,
            llm,
            catalog: Arc::new(ModelCatalog::builtin()),
            summarizer: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub async fn add_message(&self, message: NewMessage) -> Result<MessageRecord> {
        Ok(self.store.append_message(message).await?)
    }

    /// Prompt messages: system prompt, history (folded when over budget)
    /// and the optional temporary message.
    pub async fn build_messages(
        &self,
        thread_id: &str,
        model: &str,
        system_prompt: &str,
        temporary_message: Option<Message>,
    ) -> Result<Vec<Message>> {
        let records = self.store.list_messages(thread_id).await?;
        let (mut summary, mut visible) = split_at_summary(records);

        let system = Message::system(system_prompt);
        let mut fixed_tokens = estimate_tokens(std::slice::from_ref(&system));
        if let Some(temporary) = &temporary_message {
            fixed_tokens += estimate_tokens(std::slice::from_ref(temporary));
        }
        let budget = ContextBudget::for_window(self.catalog.context_window(model) as usize);
        let history_tokens = estimate_tokens(&history_messages(summary.as_ref(), &visible));

        if budget.exceeded_by(fixed_tokens + history_tokens)
            && let Some(summarizer) = &self.summarizer
        {
            tracing::info!(
                thread_id,
                estimated_tokens = fixed_tokens + history_tokens,
                limit = budget.limit(),
                "Folding thread history into a summary"
            );
            if let Some((record, kept)) = self
                .fold(thread_id, summarizer.as_ref(), summary.as_ref(), visible.clone(), budget)
                .await?
            {
                summary = Some(record);
                visible = kept;
            }
        }

        let mut messages = vec![system];
        messages.extend(history_messages(summary.as_ref(), &visible));
        messages.extend(temporary_message);
        Ok(messages)
    }

    /// Summarize everything but the recent tail and persist the summary.
    /// Returns the summary record and the records kept verbatim.
    async fn fold(
        &self,
        thread_id: &str,
        summarizer: &dyn Summarizer,
        previous: Option<&MessageRecord>,
        visible: Vec<MessageRecord>,
        budget: ContextBudget,
    ) -> Result<Option<(MessageRecord, Vec<MessageRecord>)>> {
        let as_messages: Vec<Message> = visible.iter().flat_map(record_to_message).collect();
        let mut split = fold_split(&as_messages, budget.keep_recent).min(visible.len());
        while split < visible.len() && visible[split].message_type == MessageType::Tool {
            split += 1;
        }
        if split == 0 {
            return Ok(None);
        }

        let folded = &visible[..split];
        let input = history_messages(previous, folded);
        let text = summarizer.summarize(&input).await?;
        if text.trim().is_empty() {
            tracing::warn!(thread_id, "Summarizer returned nothing, keeping full history");
            return Ok(None);
        }

        let record = self
            .store
            .append_message(NewMessage::summary(thread_id, text).with_metadata(json!({
                "folded_until": folded[folded.len() - 1].id,
                "folded_messages": folded.len(),
            })))
            .await?;
        Ok(Some((record, visible[split..].to_vec())))
    }

    /// Run one completion with the schema fallback chain and process it.
    pub async fn run_thread(
        &self,
        request: ThreadRunRequest<'_>,
        sink: &mut dyn EventSink,
    ) -> Result<ProcessorOutcome> {
        let messages = self
            .build_messages(
                request.thread_id,
                request.model,
                request.system_prompt,
                request.temporary_message,
            )
            .await?;
        let prompt_estimate = estimate_tokens(&messages) as u32;
        let provider_model = self.catalog.provider_id(request.model);
        let canonical = self.catalog.canonical_id(request.model);

        let processor = ResponseProcessor::new(
            self.store.clone(),
            request.registry.clone(),
            request.processor.clone(),
        )
        .with_cancellation(request.cancel.clone());

        let attempts = schema_attempts(&request.registry, &canonical, &request.processor);
        let mut last_rejection: Option<AiError> = None;

        for (attempt, tools) in attempts.into_iter().enumerate() {
            let mut completion = CompletionRequest::new(provider_model.clone(), messages.clone());
            if !tools.is_empty() {
                completion = completion
                    .with_tools(tools.clone())
                    .with_tool_choice(ToolChoice::Auto);
            }

            let mut stream = self.llm.complete_stream(completion);
            let first = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => {
                    return Ok(ProcessorOutcome {
                        cancelled: true,
                        ..Default::default()
                    });
                }
                first = stream.next() => first,
            };

            let first = match first {
                Some(Err(error)) if error.is_schema_rejection() && !tools.is_empty() => {
                    tracing::warn!(
                        thread_id = request.thread_id,
                        attempt,
                        tools = tools.len(),
                        error = %error,
                        "Provider rejected tool schemas, retrying with fewer"
                    );
                    last_rejection = Some(error);
                    continue;
                }
                Some(Err(error)) if error.is_schema_rejection() && last_rejection.is_some() => {
                    tracing::warn!(
                        thread_id = request.thread_id,
                        attempt,
                        error = %error,
                        "Provider rejected the request without tools, giving up"
                    );
                    return Err(error);
                }
                other => other,
            };

            let stream: StreamResult = match first {
                Some(item) => Box::pin(futures::stream::once(async move { item }).chain(stream)),
                None => stream,
            };
            return processor
                .process(request.thread_id, request.model, prompt_estimate, stream, sink)
                .await;
        }

        Err(last_rejection
            .unwrap_or_else(|| AiError::Llm("Tool schemas rejected by provider".to_string())))
    }
}

/// Tool lists to try in order: the model's preferred schemas, all
/// sanitized, then none.
fn schema_attempts(
    registry: &ToolRegistry,
    model: &str,
    config: &ProcessorConfig,
) -> Vec<Vec<ToolSchema>> {
    if !config.native_tool_calling || registry.enabled().next().is_none() {
        return vec![Vec::new()];
    }
    let sanitized = registry.get_sanitized_schemas();
    let preferred = if supports_full_schema(model) {
        registry.get_openapi_schemas()
    } else {
        sanitized.clone()
    };

    let mut attempts = vec![preferred.clone()];
    if sanitized != preferred {
        attempts.push(sanitized);
    }
    attempts.push(Vec::new());
    attempts
}

/// Latest summary and the LLM-visible records it does not cover.
fn split_at_summary(records: Vec<MessageRecord>) -> (Option<MessageRecord>, Vec<MessageRecord>) {
    let summary = records
        .iter()
        .rev()
        .find(|record| record.message_type == MessageType::Summary)
        .cloned();

    let folded_until = summary
        .as_ref()
        .and_then(|s| s.metadata.get("folded_until"))
        .and_then(Value::as_str)
        .and_then(|id| records.iter().position(|record| record.id == id));

    let start = folded_until.map_or(0, |index| index + 1);
    let visible = records
        .into_iter()
        .skip(start)
        .filter(|record| record.is_llm_message && record.message_type != MessageType::Summary)
        .collect();
    (summary, visible)
}

fn history_messages(summary: Option<&MessageRecord>, records: &[MessageRecord]) -> Vec<Message> {
    let mut messages: Vec<Message> = summary.into_iter().flat_map(record_to_message).collect();
    for record in records {
        let inline = record.message_type == MessageType::Tool
            && record.metadata.get("strategy").and_then(Value::as_str) == Some("inline");
        if inline
            && let Some(previous) = messages.last_mut()
            && previous.role == Role::Assistant
        {
            previous.content.push('\n');
            previous.content.push_str(&record.text());
            continue;
        }
        messages.extend(record_to_message(record));
    }
    messages
}

fn record_to_message(record: &MessageRecord) -> Option<Message> {
    let text = record.text();
    let message = match record.message_type {
        MessageType::Status => return None,
        MessageType::System => Message::system(text),
        MessageType::User => Message::user(text),
        MessageType::Summary => Message::system(format!("{SUMMARY_PREFIX}\n{text}")),
        MessageType::Assistant => {
            let calls: Vec<ToolCall> = record
                .content
                .get("tool_calls")
                .and_then(|calls| serde_json::from_value(calls.clone()).ok())
                .unwrap_or_default();
            if calls.is_empty() {
                Message::assistant(text)
            } else {
                Message::assistant_with_tool_calls(text, calls)
            }
        }
        MessageType::Tool => match record.role() {
            Some("tool") => {
                let call_id = record
                    .content
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Message::tool_result(call_id, text)
            }
            Some("assistant") => Message::assistant(text),
            _ => Message::user(text),
        },
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use agentcore_traits::ToolGroup;
    use async_trait::async_trait;

    use super::*;
    use crate::agent::sink::CollectingSink;
    use crate::llm::{MockLlmClient, MockStep, ModelInfo, ModelPricing};
    use crate::testing::{InMemoryThreadStore, StaticTool, StaticToolKit};
    use crate::tools::KitSelection;

    const THREAD: &str = "thread-1";

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, messages: &[Message]) -> Result<String> {
            Ok(format!("{} messages about deployment", messages.len()))
        }
    }

    fn anyof_registry() -> Arc<ToolRegistry> {
        let tool = StaticTool::new("lookup", "found").with_schema(json!({
            "type": "object",
            "properties": {"id": {"anyOf": [{"type": "string"}, {"type": "null"}]}}
        }));
        let kit = StaticToolKit::new("lookup", ToolGroup::Utility, vec![Arc::new(tool)]);
        Arc::new(ToolRegistry::build(&[KitSelection::all(Arc::new(kit))], false))
    }

    fn request<'a>(
        model: &'a str,
        registry: Arc<ToolRegistry>,
        processor: ProcessorConfig,
    ) -> ThreadRunRequest<'a> {
        ThreadRunRequest {
            thread_id: THREAD,
            model,
            system_prompt: "You are helpful.",
            temporary_message: None,
            registry,
            processor,
            cancel: CancellationToken::new(),
        }
    }

    fn native() -> ProcessorConfig {
        ProcessorConfig {
            native_tool_calling: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_history_mapping_and_temporary_message() {
        let store = Arc::new(InMemoryThreadStore::new());
        store.append_message(NewMessage::user(THREAD, "hi")).await.unwrap();
        store
            .append_message(NewMessage::assistant(THREAD, "<search_web query=\"x\"/>"))
            .await
            .unwrap();
        store
            .append_message(
                NewMessage::new(THREAD, MessageType::Tool, json!({"role": "assistant", "content": "<tool_result>hits</tool_result>"}))
                    .with_metadata(json!({"strategy": "inline"})),
            )
            .await
            .unwrap();
        store
            .append_message(NewMessage::status(THREAD, json!({"status_type": "tool_started"})))
            .await
            .unwrap();

        let manager = ThreadManager::new(store, Arc::new(MockLlmClient::new()));
        let messages = manager
            .build_messages(THREAD, "gpt-4o", "SYS", Some(Message::user("Continue.")))
            .await
            .unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::system("SYS"));
        assert_eq!(messages[1], Message::user("hi"));
        assert_eq!(
            messages[2].content,
            "<search_web query=\"x\"/>\n<tool_result>hits</tool_result>"
        );
        assert_eq!(messages[3], Message::user("Continue."));
    }

    #[tokio::test]
    async fn test_history_folds_into_persisted_summary() {
        let store = Arc::new(InMemoryThreadStore::new());
        for i in 0..10 {
            store
                .append_message(NewMessage::user(THREAD, format!("question {i} {}", "x".repeat(400))))
                .await
                .unwrap();
            store
                .append_message(NewMessage::assistant(THREAD, format!("answer {i}")))
                .await
                .unwrap();
        }
        let catalog = ModelCatalog::new().with_model(ModelInfo {
            canonical_id: "tiny".into(),
            provider_id: "tiny-1".into(),
            pricing: ModelPricing::flat(1.0, 1.0),
            context_window: 1_000,
            aliases: vec![],
        });
        let manager = ThreadManager::new(store.clone(), Arc::new(MockLlmClient::new()))
            .with_catalog(Arc::new(catalog))
            .with_summarizer(Arc::new(FixedSummarizer));

        let messages = manager.build_messages(THREAD, "tiny", "SYS", None).await.unwrap();
        assert_eq!(messages.len(), 1 + 1 + 6);
        assert_eq!(
            messages[1].content,
            format!("{SUMMARY_PREFIX}\n14 messages about deployment")
        );
        assert_eq!(messages[2].content, format!("question 7 {}", "x".repeat(400)));

        let summaries = store.messages_of_type(THREAD, MessageType::Summary);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].metadata["folded_messages"], 14);

        // Rebuilding reuses the stored summary without folding again.
        let again = manager.build_messages(THREAD, "tiny", "SYS", None).await.unwrap();
        assert_eq!(again, messages);
        assert_eq!(store.messages_of_type(THREAD, MessageType::Summary).len(), 1);
    }

    #[tokio::test]
    async fn test_schema_fallback_sanitizes_then_drops_tools() {
        let store = Arc::new(InMemoryThreadStore::new());
        store.append_message(NewMessage::user(THREAD, "find it")).await.unwrap();
        let llm = Arc::new(MockLlmClient::from_steps(vec![
            MockStep::http_error(400, "Invalid schema for function 'lookup': anyOf not supported"),
            MockStep::http_error(400, "Invalid schema: tools[0] rejected"),
            MockStep::text("No tools needed."),
        ]));
        let manager = ThreadManager::new(store, llm.clone());
        let mut sink = CollectingSink::new();

        let outcome = manager
            .run_thread(request("claude-sonnet-4", anyof_registry(), native()), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome.content, "No tools needed.");

        let requests = llm.requests().await;
        assert_eq!(requests.len(), 3);
        let lookup = |i: usize| requests[i].tools.iter().find(|t| t.name == "lookup").cloned();
        assert!(lookup(0).unwrap().parameters["properties"]["id"].get("anyOf").is_some());
        assert_eq!(
            lookup(1).unwrap().parameters["properties"]["id"],
            json!({"type": "string"})
        );
        assert!(requests[2].tools.is_empty());
    }

    #[tokio::test]
    async fn test_schema_fallback_exhausted_is_an_error() {
        let store = Arc::new(InMemoryThreadStore::new());
        let llm = Arc::new(MockLlmClient::from_steps(vec![
            MockStep::http_error(400, "invalid schema"),
            MockStep::http_error(400, "invalid schema"),
        ]));
        let manager = ThreadManager::new(store, llm.clone());
        let mut sink = CollectingSink::new();

        // Sanitized schemas are preferred for this model, so there are two
        // attempts and the tools-free one is rejected too.
        let error = manager
            .run_thread(request("gpt-3.5-turbo", anyof_registry(), native()), &mut sink)
            .await
            .unwrap_err();
        assert!(error.is_schema_rejection());
        assert_eq!(llm.requests().await.len(), 2);
        assert!(sink.events.is_empty());
    }

    #[tokio::test]
    async fn test_non_schema_error_is_reported_through_outcome() {
        let store = Arc::new(InMemoryThreadStore::new());
        let llm = Arc::new(MockLlmClient::from_steps(vec![MockStep::http_error(
            401,
            "invalid api key",
        )]));
        let manager = ThreadManager::new(store, llm.clone());
        let mut sink = CollectingSink::new();

        let outcome = manager
            .run_thread(request("gpt-4o", anyof_registry(), native()), &mut sink)
            .await
            .unwrap();
        assert!(outcome.error.unwrap().contains("invalid api key"));
        assert_eq!(llm.requests().await.len(), 1);
        assert_eq!(sink.events.len(), 1);
    }

    #[tokio::test]
    async fn test_xml_mode_sends_no_tools_and_resolves_provider_id() {
        let store = Arc::new(InMemoryThreadStore::new());
        let llm = Arc::new(MockLlmClient::from_steps(vec![MockStep::text("ok")]));
        let manager = ThreadManager::new(store, llm.clone());
        let mut sink = CollectingSink::new();
        manager
            .run_thread(
                request("sonnet", anyof_registry(), ProcessorConfig::default()),
                &mut sink,
            )
            .await
            .unwrap();

        let requests = llm.requests().await;
        assert!(requests[0].tools.is_empty());
        assert_eq!(requests[0].model, "claude-sonnet-4-20250514");
    }
}
