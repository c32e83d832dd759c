//! Agent runner: the outer loop of one run.
//!
//! Each iteration is admitted by the credit gate, streams one completion
//! through the thread manager and settles its cost. The loop ends on a
//! terminator tool, a final assistant reply, a provider error, a refused
//! admission, cancellation or the iteration limit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agentcore_traits::{
    CreditGate, Credits, KnowledgeBase, LazySandbox, MessageType, RunStatus, SandboxProvider,
    ThreadRecord, ThreadStore, ToolKit,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::config::AgentRunConfig;
use crate::agent::context::{LlmSummarizer, Summarizer};
use crate::agent::events::{RunEvent, StatusType};
use crate::agent::processor::ProcessorOutcome;
use crate::agent::prompt::{PromptInputs, build_system_prompt};
use crate::agent::sink::EventSink;
use crate::agent::thread_manager::{ThreadManager, ThreadRunRequest};
use crate::error::RunError;
use crate::llm::{FinishReason, LlmClient, Message, ModelCatalog};
use crate::mcp::{McpClientPool, McpResolver, McpTimeouts};
use crate::tools::{KitSelection, ToolRegistry};

const STORE_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_STEP: Duration = Duration::from_millis(200);
const CONTINUE_PROMPT: &str = "Continue exactly where your previous reply stopped.";

/// Supplies the tool kits of a run. Kits that need a sandbox receive the
/// run's lazily created one.
pub trait ToolKitSource: Send + Sync {
    fn kits(&self, sandbox: &Arc<LazySandbox>) -> Vec<Arc<dyn ToolKit>>;
}

impl ToolKitSource for Vec<Arc<dyn ToolKit>> {
    fn kits(&self, _sandbox: &Arc<LazySandbox>) -> Vec<Arc<dyn ToolKit>> {
        self.clone()
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub iterations: usize,
    pub total_cost: Credits,
}

#[derive(Debug, Default)]
struct RunProgress {
    iterations: usize,
    total_cost: Credits,
}

impl RunProgress {
    fn finish(&self, status: RunStatus, error: Option<String>) -> RunOutcome {
        RunOutcome {
            status,
            error,
            iterations: self.iterations,
            total_cost: self.total_cost,
        }
    }
}

pub struct AgentRunner {
    store: Arc<dyn ThreadStore>,
    credits: Arc<dyn CreditGate>,
    llm: Arc<dyn LlmClient>,
    catalog: Arc<ModelCatalog>,
    kits: Arc<dyn ToolKitSource>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    sandbox_provider: Option<Arc<dyn SandboxProvider>>,
    mcp_resolver: McpResolver,
    mcp_timeouts: McpTimeouts,
    retry_step: Duration,
}

impl AgentRunner {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        credits: Arc<dyn CreditGate>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            credits,
            llm,
            catalog: Arc::new(ModelCatalog::builtin()),
            kits: Arc::new(Vec::<Arc<dyn ToolKit>>::new()),
            knowledge: None,
            summarizer: None,
            sandbox_provider: None,
            mcp_resolver: McpResolver::default(),
            mcp_timeouts: McpTimeouts::default(),
            retry_step: DEFAULT_RETRY_STEP,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_kits(mut self, kits: Arc<dyn ToolKitSource>) -> Self {
        self.kits = kits;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_sandbox_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox_provider = Some(provider);
        self
    }

    pub fn with_mcp(mut self, resolver: McpResolver, timeouts: McpTimeouts) -> Self {
        self.mcp_resolver = resolver;
        self.mcp_timeouts = timeouts;
        self
    }

    /// Base delay of the linear store retry.
    pub fn with_retry_step(mut self, step: Duration) -> Self {
        self.retry_step = step;
        self
    }

    /// Drive the run to a terminal status. Never fails: every error closes
    /// the run as `stopped` or `failed` and is reported on `sink`.
    pub async fn run(
        &self,
        config: &AgentRunConfig,
        cancel: CancellationToken,
        sink: &mut dyn EventSink,
    ) -> RunOutcome {
        let pool =
            McpClientPool::new(self.mcp_resolver.clone()).with_timeouts(self.mcp_timeouts.clone());
        let mut progress = RunProgress::default();

        let result = self
            .execute(config, &cancel, &pool, &mut progress, sink)
            .await;
        pool.disconnect_all().await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                let event = match &error {
                    RunError::Cancelled => RunEvent::status(StatusType::Stopped),
                    RunError::Admission(message) => {
                        RunEvent::status_with_message(StatusType::Stopped, message.clone())
                    }
                    other => RunEvent::status_with_message(StatusType::Error, other.to_string()),
                };
                sink.emit(event).await;
                let message = (error != RunError::Cancelled).then(|| error.to_string());
                progress.finish(error.terminal_status(), message)
            }
        };

        tracing::info!(
            run_id = %config.run_id,
            thread_id = %config.thread_id,
            status = outcome.status.as_str(),
            iterations = outcome.iterations,
            cost = %outcome.total_cost,
            "Agent run finished"
        );
        outcome
    }

    async fn execute(
        &self,
        config: &AgentRunConfig,
        cancel: &CancellationToken,
        pool: &McpClientPool,
        progress: &mut RunProgress,
        sink: &mut dyn EventSink,
    ) -> Result<RunOutcome, RunError> {
        let thread = self.fetch_thread(&config.thread_id).await?;
        let account_id = thread.account_id.clone().ok_or_else(|| {
            RunError::Invariant(format!("Thread {} has no account", thread.id))
        })?;
        let project_id = config
            .project_id
            .clone()
            .or_else(|| thread.project_id.clone())
            .unwrap_or_default();
        let sandbox = Arc::new(LazySandbox::new(project_id, self.sandbox_provider.clone()));

        let registry = self.build_registry(config, &sandbox, pool).await;
        let system_prompt = self.system_prompt(config, &account_id, &registry).await;

        let summarizer = self.summarizer.clone().unwrap_or_else(|| {
            Arc::new(LlmSummarizer::new(
                self.llm.clone(),
                self.catalog.provider_id(&config.model),
            ))
        });
        let threads = ThreadManager::new(self.store.clone(), self.llm.clone())
            .with_catalog(self.catalog.clone())
            .with_summarizer(summarizer);

        let mut continues = 0usize;
        let mut temporary: Option<Message> = None;

        while progress.iterations < config.max_iterations {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let admission = self
                .with_store_retry("reserve credits", || self.credits.reserve(&account_id))
                .await?;
            if !admission.ok {
                return Err(RunError::Admission(admission.message.unwrap_or_else(|| {
                    format!("Insufficient credits: balance is ${}", admission.balance)
                })));
            }
            let reservation_id = admission.reservation_id.ok_or_else(|| {
                RunError::Invariant("Admission granted without a reservation".to_string())
            })?;

            if temporary.is_none() && self.last_reply_is_assistant(&config.thread_id).await? {
                self.refund(&reservation_id, "nothing left to answer").await;
                sink.emit(RunEvent::status(StatusType::Completed)).await;
                return Ok(progress.finish(RunStatus::Completed, None));
            }

            progress.iterations += 1;
            tracing::info!(
                run_id = %config.run_id,
                iteration = progress.iterations,
                model = %config.model,
                "Starting iteration"
            );

            let result = threads
                .run_thread(
                    ThreadRunRequest {
                        thread_id: &config.thread_id,
                        model: &config.model,
                        system_prompt: &system_prompt,
                        temporary_message: temporary.take(),
                        registry: registry.clone(),
                        processor: config.processor.clone(),
                        cancel: cancel.clone(),
                    },
                    sink,
                )
                .await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.refund(&reservation_id, "completion did not start").await;
                    return Err(if error.is_schema_rejection() {
                        RunError::Schema(error.to_string())
                    } else {
                        RunError::Provider(error.to_string())
                    });
                }
            };

            self.settle(&reservation_id, config, &outcome, progress)
                .await?;

            if outcome.cancelled {
                return Err(RunError::Cancelled);
            }
            if let Some(error) = outcome.error {
                // Already reported on the stream by the processor.
                return Ok(progress.finish(
                    RunStatus::Failed,
                    Some(RunError::Provider(error).to_string()),
                ));
            }
            if let Some(tool) = &outcome.terminator {
                tracing::info!(run_id = %config.run_id, tool = %tool, "Terminator called");
                sink.emit(RunEvent::status(StatusType::Completed)).await;
                return Ok(progress.finish(RunStatus::Completed, None));
            }

            if matches!(
                outcome.finish_reason,
                Some(FinishReason::ToolCalls | FinishReason::MaxTokens)
            ) {
                continues += 1;
                if continues > config.native_max_auto_continues {
                    tracing::warn!(
                        run_id = %config.run_id,
                        limit = config.native_max_auto_continues,
                        "Native auto-continue limit reached"
                    );
                    sink.emit(RunEvent::status(StatusType::Completed)).await;
                    return Ok(progress.finish(RunStatus::Completed, None));
                }
                if outcome.finish_reason == Some(FinishReason::MaxTokens) {
                    temporary = Some(Message::user(CONTINUE_PROMPT));
                }
            }
        }

        tracing::warn!(
            run_id = %config.run_id,
            max_iterations = config.max_iterations,
            "Iteration limit reached"
        );
        sink.emit(RunEvent::status_with_message(
            StatusType::MaxIterationsReached,
            format!(
                "Stopped after reaching the limit of {} iterations",
                config.max_iterations
            ),
        ))
        .await;
        sink.emit(RunEvent::status(StatusType::Completed)).await;
        Ok(progress.finish(RunStatus::Completed, None))
    }

    /// Load the run's thread. A thread that is not visible yet is retried
    /// with the same linear back-off as a failed store call.
    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadRecord, RunError> {
        let mut attempt = 1u32;
        loop {
            match self.store.get_thread(thread_id).await {
                Ok(Some(thread)) => return Ok(thread),
                Ok(None) if attempt >= STORE_ATTEMPTS => {
                    return Err(RunError::Invariant(format!(
                        "Thread {thread_id} not found after {STORE_ATTEMPTS} attempts"
                    )));
                }
                Ok(None) => {
                    tracing::warn!(thread_id, attempt, "Thread not visible yet, retrying");
                }
                Err(error) if attempt >= STORE_ATTEMPTS => {
                    return Err(RunError::TransientStore {
                        attempts: STORE_ATTEMPTS,
                        message: format!("load thread: {error}"),
                    });
                }
                Err(error) => {
                    tracing::warn!(thread_id, attempt, error = %error, "Thread lookup failed, retrying");
                }
            }
            tokio::time::sleep(self.retry_step * attempt).await;
            attempt += 1;
        }
    }

    async fn last_reply_is_assistant(&self, thread_id: &str) -> Result<bool, RunError> {
        let latest = self
            .with_store_retry("load latest message", || {
                self.store.latest_llm_message(thread_id)
            })
            .await?;
        Ok(latest.is_some_and(|message| message.message_type == MessageType::Assistant))
    }

    async fn build_registry(
        &self,
        config: &AgentRunConfig,
        sandbox: &Arc<LazySandbox>,
        pool: &McpClientPool,
    ) -> Arc<ToolRegistry> {
        let kits = self.kits.kits(sandbox);
        let agent = config.agent_config.as_ref();

        let selections: Vec<KitSelection> = match agent.and_then(|a| a.tools.as_ref()) {
            None => kits.into_iter().map(KitSelection::all).collect(),
            Some(selected) => {
                let mut selections = Vec::new();
                for selection in selected {
                    let Some(kit) = kits.iter().find(|kit| kit.name() == selection.kit) else {
                        tracing::warn!(kit = %selection.kit, "Unknown tool kit in agent config");
                        continue;
                    };
                    selections.push(match &selection.enabled_methods {
                        Some(methods) => KitSelection::only(kit.clone(), methods.clone()),
                        None => KitSelection::all(kit.clone()),
                    });
                }
                selections
            }
        };
        let mut registry = ToolRegistry::build(&selections, config.agent_id().is_some());

        let requests = agent.map(|a| a.mcp_requests()).unwrap_or_default();
        if !requests.is_empty() {
            let connected = pool.connect_all(&requests).await;
            tracing::info!(
                run_id = %config.run_id,
                requested = requests.len(),
                connected = connected.len(),
                "MCP servers connected"
            );
            for (server, tools) in pool.proxy_tools() {
                let count = registry.register_mcp(&server, tools);
                tracing::debug!(server = %server, tools = count, "Registered MCP tools");
            }
        }
        Arc::new(registry)
    }

    async fn system_prompt(
        &self,
        config: &AgentRunConfig,
        account_id: &str,
        registry: &ToolRegistry,
    ) -> String {
        let knowledge = match (&self.knowledge, config.agent_id()) {
            (Some(knowledge), Some(agent_id)) => knowledge
                .context_for_agent(agent_id)
                .await
                .unwrap_or_else(|error| {
                    tracing::warn!(agent_id, error = %error, "Knowledge base unavailable");
                    None
                }),
            _ => None,
        };
        let locale = self
            .store
            .account_locale(account_id)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(account_id, error = %error, "Could not load account locale");
                None
            });

        build_system_prompt(&PromptInputs {
            agent_config: config.agent_config.as_ref(),
            registry,
            knowledge,
            locale,
            xml_tool_calling: config.processor.xml_tool_calling,
            now: Utc::now(),
        })
    }

    /// Commit reported (or estimated) usage, refund when there is none.
    async fn settle(
        &self,
        reservation_id: &str,
        config: &AgentRunConfig,
        outcome: &ProcessorOutcome,
        progress: &mut RunProgress,
    ) -> Result<(), RunError> {
        let Some(usage) = &outcome.usage else {
            self.refund(reservation_id, "no usage reported").await;
            return Ok(());
        };

        let cost = self.catalog.cost_for(&config.model, usage);
        let metadata = json!({
            "run_id": config.run_id,
            "thread_id": config.thread_id,
            "model": self.catalog.canonical_id(&config.model),
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "cache_read_tokens": usage.cache_read_tokens,
            "cache_write_tokens": usage.cache_write_tokens,
            "estimated": outcome.usage_estimated,
        });
        let committed = self
            .with_store_retry("commit usage", || {
                self.credits.commit(reservation_id, cost, metadata.clone())
            })
            .await;
        let balance = match committed {
            Ok(balance) => balance,
            Err(error) => {
                self.refund(reservation_id, "usage commit failed").await;
                return Err(error);
            }
        };
        progress.total_cost += cost;
        tracing::info!(
            run_id = %config.run_id,
            reservation_id,
            cost = %cost,
            balance = %balance,
            estimated = outcome.usage_estimated,
            "Committed usage"
        );
        Ok(())
    }

    async fn refund(&self, reservation_id: &str, reason: &str) {
        match self.credits.refund(reservation_id, reason).await {
            Ok(()) => tracing::info!(reservation_id, reason, "Reservation refunded"),
            Err(error) => {
                tracing::error!(reservation_id, error = %error, "Failed to refund reservation")
            }
        }
    }

    /// Retry a store call with linear back-off (1x, 2x, 3x, 4x the step).
    async fn with_store_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < STORE_ATTEMPTS => {
                    tracing::warn!(operation, attempt, error = %error, "Store call failed, retrying");
                    tokio::time::sleep(self.retry_step * attempt).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RunError::TransientStore {
                        attempts: STORE_ATTEMPTS,
                        message: format!("{operation}: {error}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use agentcore_traits::{NewMessage, Tool, ToolGroup};
    use serde_json::Value;

    use super::*;
    use crate::agent::config::AgentConfig;
    use crate::agent::sink::CollectingSink;
    use crate::llm::{MockLlmClient, MockStep, ModelInfo, ModelPricing};
    use crate::mcp::McpConnectionRequest;
    use crate::mcp::test_server::{TestMcpServer, slack_tools};
    use crate::testing::{InMemoryCreditGate, InMemoryThreadStore, StaticToolKit, search_web_tool};

    const THREAD: &str = "thread-1";
    const ACCOUNT: &str = "acct-1";
    const MODEL: &str = "flat";

    fn one_dollar_catalog() -> Arc<ModelCatalog> {
        Arc::new(ModelCatalog::new().with_model(ModelInfo {
            canonical_id: "test/flat".into(),
            provider_id: "flat-001".into(),
            pricing: ModelPricing::flat(1.0, 1.0),
            context_window: 200_000,
            aliases: vec![MODEL.into()],
        }))
    }

    struct Harness {
        store: Arc<InMemoryThreadStore>,
        credits: Arc<InMemoryCreditGate>,
        llm: Arc<MockLlmClient>,
        runner: AgentRunner,
    }

    async fn harness(balance: f64, steps: Vec<MockStep>) -> Harness {
        let store = Arc::new(InMemoryThreadStore::new());
        store.add_thread(THREAD, Some(ACCOUNT), Some("proj-1"));
        store
            .append_message(NewMessage::user(THREAD, "Research x for me"))
            .await
            .unwrap();
        let credits = Arc::new(
            InMemoryCreditGate::new().with_balance(ACCOUNT, Credits::from_dollars(balance)),
        );
        let llm = Arc::new(MockLlmClient::from_steps(steps));
        let search = StaticToolKit::new(
            "web_search",
            ToolGroup::Utility,
            vec![Arc::new(search_web_tool("hits")) as Arc<dyn Tool>],
        );
        let kits: Vec<Arc<dyn ToolKit>> = vec![Arc::new(search)];
        let runner = AgentRunner::new(store.clone(), credits.clone(), llm.clone())
            .with_catalog(one_dollar_catalog())
            .with_kits(Arc::new(kits))
            .with_retry_step(Duration::from_millis(1));
        Harness {
            store,
            credits,
            llm,
            runner,
        }
    }

    fn run_config() -> AgentRunConfig {
        AgentRunConfig::new("run-1", THREAD, MODEL, "worker-1")
    }

    fn statuses(sink: &CollectingSink) -> Vec<StatusType> {
        sink.events.iter().filter_map(RunEvent::status_type).collect()
    }

    #[tokio::test]
    async fn test_terminator_completes_and_debits_once() {
        let h = harness(
            5.0,
            vec![MockStep::text("Done. <complete/>").with_usage(10_000, 5_000)],
        )
        .await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(h.llm.requests().await.len(), 1);

        let entries = h.credits.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount.to_string(), "-0.015");
        assert_eq!(entries[0].balance_after.to_string(), "4.985");
        assert_eq!(statuses(&sink).last(), Some(&StatusType::Completed));
        assert_eq!(h.credits.open_reservations(), 0);
    }

    #[tokio::test]
    async fn test_tool_iteration_then_ask() {
        let h = harness(
            5.0,
            vec![
                MockStep::text("<search_web query=\"x\"/>").with_usage(100, 10),
                MockStep::text("Which region? <ask/>").with_usage(120, 8),
            ],
        )
        .await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(h.credits.entries().len(), 2);

        let kinds: Vec<MessageType> = h
            .store
            .messages(THREAD)
            .into_iter()
            .map(|m| m.message_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::User,
                MessageType::Assistant,
                MessageType::Tool,
                MessageType::Assistant,
                MessageType::Tool,
            ]
        );
        let search_result = &h.store.messages_of_type(THREAD, MessageType::Tool)[0];
        assert!(search_result.text().contains("hits"));

        // The second completion saw the tool result.
        let requests = h.llm.requests().await;
        assert!(requests[1].messages.iter().any(|m| m.content.contains("hits")));
    }

    #[tokio::test]
    async fn test_insufficient_credits_stop_second_iteration() {
        let h = harness(
            0.10,
            vec![MockStep::text("<search_web query=\"x\"/>").with_usage(100_000, 50_000)],
        )
        .await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(outcome.error.unwrap().contains("Insufficient credits"));
        assert_eq!(h.llm.requests().await.len(), 1);

        let entries = h.credits.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount.to_string(), "-0.15");
        assert_eq!(h.credits.balance(ACCOUNT).to_string(), "-0.05");

        match sink.events.last() {
            Some(RunEvent::Status {
                status_type: StatusType::Stopped,
                message: Some(message),
                ..
            }) => assert!(message.contains("Insufficient credits")),
            other => panic!("unexpected final event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_mcp_tool_call() {
        let server = TestMcpServer::start(slack_tools(), "ok: ts=1").await;
        let h = harness(
            5.0,
            vec![
                MockStep::text("<slack_post_message channel=\"C\" text=\"hi\"/>"),
                MockStep::text("Posted. <complete/>"),
            ],
        )
        .await;
        let runner = h.runner.with_mcp(
            McpResolver::default(),
            McpTimeouts {
                http_connect: Duration::from_secs(2),
                sse_connect: Duration::from_secs(1),
                retry_backoff: Duration::from_millis(10),
                disconnect: Duration::from_secs(1),
            },
        );
        let config = run_config().with_agent_config(AgentConfig {
            custom_mcps: vec![McpConnectionRequest::custom("slack", server.url())],
            ..Default::default()
        });
        let mut sink = CollectingSink::new();
        let outcome = runner.run(&config, CancellationToken::new(), &mut sink).await;
        assert_eq!(outcome.status, RunStatus::Completed);

        assert!(sink.events.contains(&RunEvent::tool_started("slack_post_message", false)));
        assert!(sink.events.iter().any(|event| matches!(
            event,
            RunEvent::Tool { name, success: true, content, .. }
                if name == "slack_post_message" && content == "ok: ts=1"
        )));
        assert_eq!(
            server.calls(),
            vec![serde_json::json!({
                "name": "slack_post_message",
                "arguments": {"channel": "C", "text": "hi"}
            })]
        );

        let slack_messages: Vec<_> = h
            .store
            .messages_of_type(THREAD, MessageType::Tool)
            .into_iter()
            .filter(|m| m.metadata["tool_name"] == Value::from("slack_post_message"))
            .collect();
        assert_eq!(slack_messages.len(), 1);

        // The system prompt advertised the remote tool.
        let requests = h.llm.requests().await;
        assert!(requests[0].messages[0].content.contains("# External MCP Tools"));
    }

    #[tokio::test]
    async fn test_max_iterations_completes_with_truncation_event() {
        let h = harness(
            5.0,
            vec![
                MockStep::text("<search_web query=\"a\"/>"),
                MockStep::text("<search_web query=\"b\"/>"),
            ],
        )
        .await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(
                &run_config().with_max_iterations(2),
                CancellationToken::new(),
                &mut sink,
            )
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        let statuses = statuses(&sink);
        assert_eq!(
            &statuses[statuses.len() - 2..],
            &[StatusType::MaxIterationsReached, StatusType::Completed]
        );
    }

    #[tokio::test]
    async fn test_plain_reply_completes_on_next_admission() {
        let h = harness(5.0, vec![MockStep::text("Here is the answer.")]).await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(h.credits.entries().len(), 1);
        assert_eq!(h.credits.open_reservations(), 0);
    }

    #[tokio::test]
    async fn test_provider_error_fails_and_refunds() {
        let h = harness(5.0, vec![MockStep::http_error(401, "invalid api key")]).await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("invalid api key"));
        assert!(h.credits.entries().is_empty());
        assert_eq!(h.credits.open_reservations(), 0);
        assert_eq!(statuses(&sink), vec![StatusType::Error]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_stops_without_calls() {
        let h = harness(5.0, vec![]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = CollectingSink::new();
        let outcome = h.runner.run(&run_config(), cancel, &mut sink).await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(outcome.error, None);
        assert!(h.llm.requests().await.is_empty());
        assert_eq!(sink.events, vec![RunEvent::status(StatusType::Stopped)]);
    }

    #[tokio::test]
    async fn test_thread_lookup_retries_then_fails_on_missing_account() {
        let h = harness(5.0, vec![MockStep::text("<complete/>")]).await;
        h.store.fail_thread_lookups(2);
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;
        assert_eq!(outcome.status, RunStatus::Completed);

        h.store.add_thread("orphan", None, None);
        let config = AgentRunConfig::new("run-2", "orphan", MODEL, "worker-1");
        let outcome = h
            .runner
            .run(&config, CancellationToken::new(), &mut sink)
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("has no account"));

        h.store.fail_thread_lookups(5);
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("after 5 attempts"));
    }

    #[tokio::test]
    async fn test_truncated_reply_continues_with_temporary_prompt() {
        let h = harness(
            5.0,
            vec![
                MockStep::text("Part one").with_finish_reason(FinishReason::MaxTokens),
                MockStep::text(" and part two. <complete/>"),
            ],
        )
        .await;
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        let requests = h.llm.requests().await;
        assert_eq!(
            requests[1].messages.last().map(|m| m.content.as_str()),
            Some(CONTINUE_PROMPT)
        );
        assert!(
            h.store
                .messages(THREAD)
                .iter()
                .all(|m| !m.text().contains(CONTINUE_PROMPT))
        );
    }

    #[tokio::test]
    async fn test_failed_commit_releases_reservation() {
        let h = harness(5.0, vec![MockStep::text("Done. <complete/>").with_usage(100, 10)]).await;
        h.credits.fail_commits(5);
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("commit usage"));
        assert!(h.credits.entries().is_empty());
        assert_eq!(h.credits.open_reservations(), 0);
    }

    #[tokio::test]
    async fn test_commit_retry_recovers() {
        let h = harness(5.0, vec![MockStep::text("Done. <complete/>").with_usage(100, 10)]).await;
        h.credits.fail_commits(2);
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&run_config(), CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(h.credits.entries().len(), 1);
        assert_eq!(h.credits.open_reservations(), 0);
    }

    #[tokio::test]
    async fn test_thread_visible_after_delay_is_picked_up() {
        let h = harness(5.0, vec![MockStep::text("Hi. <complete/>")]).await;
        let runner = h.runner.with_retry_step(Duration::from_millis(20));

        let store = h.store.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.add_thread("late", Some(ACCOUNT), None);
            store
                .append_message(NewMessage::user("late", "hello"))
                .await
                .unwrap();
        });

        let config = AgentRunConfig::new("run-late", "late", MODEL, "worker-1");
        let mut sink = CollectingSink::new();
        let outcome = runner.run(&config, CancellationToken::new(), &mut sink).await;
        writer.await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed, "{:?}", outcome.error);
        assert_eq!(h.llm.requests().await.len(), 1);
        assert_eq!(h.credits.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_thread_never_visible_fails_after_retries() {
        let h = harness(5.0, vec![]).await;
        let config = AgentRunConfig::new("run-ghost", "ghost", MODEL, "worker-1");
        let mut sink = CollectingSink::new();
        let outcome = h
            .runner
            .run(&config, CancellationToken::new(), &mut sink)
            .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("Thread ghost not found after 5 attempts"));
        assert!(h.llm.requests().await.is_empty());
        assert_eq!(h.credits.open_reservations(), 0);
    }
}
