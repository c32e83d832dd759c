//! In-memory collaborators for exercising runs without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agentcore_traits::{
    Admission, CreditGate, Credits, KnowledgeBase, MessageRecord, MessageType, NewMessage,
    ThreadRecord, ThreadStore, Tool, ToolGroup, ToolKit, ToolOutput, ToolResult,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};

#[derive(Default)]
pub struct InMemoryThreadStore {
    threads: Mutex<HashMap<String, ThreadRecord>>,
    messages: Mutex<Vec<MessageRecord>>,
    locales: Mutex<HashMap<String, String>>,
    thread_failures: AtomicUsize,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, thread_id: &str, account_id: Option<&str>, project_id: Option<&str>) {
        self.threads.lock().insert(
            thread_id.to_string(),
            ThreadRecord {
                id: thread_id.to_string(),
                account_id: account_id.map(str::to_string),
                project_id: project_id.map(str::to_string),
                agent_id: None,
                created_at: Utc::now(),
            },
        );
    }

    pub fn set_locale(&self, account_id: &str, locale: &str) {
        self.locales
            .lock()
            .insert(account_id.to_string(), locale.to_string());
    }

    /// Make the next `count` thread lookups fail.
    pub fn fail_thread_lookups(&self, count: usize) {
        self.thread_failures.store(count, Ordering::SeqCst);
    }

    pub fn messages(&self, thread_id: &str) -> Vec<MessageRecord> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect()
    }

    pub fn messages_of_type(&self, thread_id: &str, message_type: MessageType) -> Vec<MessageRecord> {
        self.messages(thread_id)
            .into_iter()
            .filter(|m| m.message_type == message_type)
            .collect()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        let remaining = self.thread_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.thread_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("store unavailable"));
        }
        Ok(self.threads.lock().get(thread_id).cloned())
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        Ok(self.messages(thread_id))
    }

    async fn latest_llm_message(&self, thread_id: &str) -> Result<Option<MessageRecord>> {
        Ok(self
            .messages
            .lock()
            .iter()
            .rev()
            .find(|m| m.thread_id == thread_id && m.is_llm_message)
            .cloned())
    }

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let mut messages = self.messages.lock();
        let last: Option<DateTime<Utc>> = messages
            .iter()
            .filter(|m| m.thread_id == message.thread_id)
            .map(|m| m.created_at)
            .max();
        let now = Utc::now();
        let created_at = match last {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: message.thread_id,
            message_type: message.message_type,
            content: message.content,
            is_llm_message: message.is_llm_message,
            metadata: message.metadata,
            created_at,
        };
        messages.push(record.clone());
        Ok(record)
    }

    async fn update_message(&self, message: &MessageRecord) -> Result<()> {
        let mut messages = self.messages.lock();
        let existing = messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| anyhow!("message {} not found", message.id))?;
        existing.content = message.content.clone();
        existing.metadata = message.metadata.clone();
        Ok(())
    }

    async fn account_locale(&self, account_id: &str) -> Result<Option<String>> {
        Ok(self.locales.lock().get(account_id).cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEntry {
    pub account_id: String,
    pub amount: Credits,
    pub balance_after: Credits,
    pub kind: &'static str,
    pub reservation_id: String,
}

#[derive(Debug)]
struct Reservation {
    account_id: String,
    committed: Option<Credits>,
    refunded: bool,
}

/// Credit gate over an in-memory balance map.
#[derive(Default)]
pub struct InMemoryCreditGate {
    balances: Mutex<HashMap<String, Credits>>,
    reservations: Mutex<HashMap<String, Reservation>>,
    entries: Mutex<Vec<RecordedEntry>>,
    commit_failures: AtomicUsize,
}

impl InMemoryCreditGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, account_id: &str, balance: Credits) -> Self {
        self.balances.lock().insert(account_id.to_string(), balance);
        self
    }

    pub fn balance(&self, account_id: &str) -> Credits {
        self.balances
            .lock()
            .get(account_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<RecordedEntry> {
        self.entries.lock().clone()
    }

    /// Make the next `count` commits fail.
    pub fn fail_commits(&self, count: usize) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    pub fn open_reservations(&self) -> usize {
        self.reservations
            .lock()
            .values()
            .filter(|r| r.committed.is_none() && !r.refunded)
            .count()
    }
}

#[async_trait]
impl CreditGate for InMemoryCreditGate {
    async fn get_balance(&self, account_id: &str) -> Result<Credits> {
        Ok(self.balance(account_id))
    }

    async fn reserve(&self, account_id: &str) -> Result<Admission> {
        let balance = self.balance(account_id);
        if !balance.is_positive() {
            return Ok(Admission {
                ok: false,
                message: Some(format!(
                    "Insufficient credits: balance is ${balance}. Add credits to continue."
                )),
                reservation_id: None,
                balance,
            });
        }
        let reservation_id = uuid::Uuid::new_v4().to_string();
        self.reservations.lock().insert(
            reservation_id.clone(),
            Reservation {
                account_id: account_id.to_string(),
                committed: None,
                refunded: false,
            },
        );
        Ok(Admission {
            ok: true,
            message: None,
            reservation_id: Some(reservation_id),
            balance,
        })
    }

    async fn commit(&self, reservation_id: &str, actual_cost: Credits, _metadata: Value) -> Result<Credits> {
        if self
            .commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("ledger unavailable"));
        }
        let mut reservations = self.reservations.lock();
        let reservation = reservations
            .get_mut(reservation_id)
            .ok_or_else(|| anyhow!("unknown reservation {reservation_id}"))?;
        if reservation.committed.is_some() {
            return Ok(self.balance(&reservation.account_id));
        }
        reservation.committed = Some(actual_cost);
        let mut balances = self.balances.lock();
        let balance = balances.entry(reservation.account_id.clone()).or_default();
        *balance = *balance - actual_cost;
        self.entries.lock().push(RecordedEntry {
            account_id: reservation.account_id.clone(),
            amount: -actual_cost,
            balance_after: *balance,
            kind: "usage",
            reservation_id: reservation_id.to_string(),
        });
        Ok(*balance)
    }

    async fn refund(&self, reservation_id: &str, _reason: &str) -> Result<()> {
        let mut reservations = self.reservations.lock();
        let Some(reservation) = reservations.get_mut(reservation_id) else {
            return Ok(());
        };
        if reservation.refunded {
            return Ok(());
        }
        reservation.refunded = true;
        if let Some(cost) = reservation.committed {
            let mut balances = self.balances.lock();
            let balance = balances.entry(reservation.account_id.clone()).or_default();
            *balance += cost;
            self.entries.lock().push(RecordedEntry {
                account_id: reservation.account_id.clone(),
                amount: cost,
                balance_after: *balance,
                kind: "refund",
                reservation_id: reservation_id.to_string(),
            });
        }
        Ok(())
    }
}

pub struct StaticKnowledgeBase(pub HashMap<String, String>);

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn context_for_agent(&self, agent_id: &str) -> Result<Option<String>> {
        Ok(self.0.get(agent_id).cloned())
    }
}

/// Tool answering every call with a fixed reply and recording its inputs.
pub struct StaticTool {
    name: String,
    reply: String,
    schema: Value,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl StaticTool {
    pub fn new(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: reply.to_string(),
            schema: json!({"type": "object", "properties": {}}),
            calls: Arc::default(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<Value>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed reply"
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, input: Value) -> ToolResult<ToolOutput> {
        self.calls.lock().push(input);
        Ok(ToolOutput::success(Value::String(self.reply.clone())))
    }
}

/// Kit wrapping prepared tools.
pub struct StaticToolKit {
    name: String,
    group: ToolGroup,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolKit {
    pub fn new(name: &str, group: ToolGroup, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: name.to_string(),
            group,
            tools,
        }
    }
}

impl ToolKit for StaticToolKit {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> ToolGroup {
        self.group
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

/// `search_web` tool with a required `query` parameter.
pub fn search_web_tool(reply: &str) -> StaticTool {
    StaticTool::new("search_web", reply).with_schema(json!({
        "type": "object",
        "properties": {"query": {"type": "string"}},
        "required": ["query"]
    }))
}
