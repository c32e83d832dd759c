//! Store and collaborator traits consumed by the execution engine.
//!
//! Implementations are provided by downstream crates (e.g. agentcore-core).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credits::Credits;
use crate::thread::{MessageRecord, NewMessage, ThreadRecord};

// ── ThreadStore ──────────────────────────────────────────────────────

#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>>;

    /// All messages of the thread in `created_at` order.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<MessageRecord>>;

    /// Newest message with `is_llm_message == true`.
    async fn latest_llm_message(&self, thread_id: &str) -> Result<Option<MessageRecord>>;

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord>;

    /// Rewrite content and metadata of an existing message in place.
    async fn update_message(&self, message: &MessageRecord) -> Result<()>;

    async fn account_locale(&self, account_id: &str) -> Result<Option<String>>;
}

// ── CreditGate ───────────────────────────────────────────────────────

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub ok: bool,
    pub message: Option<String>,
    pub reservation_id: Option<String>,
    pub balance: Credits,
}

#[async_trait]
pub trait CreditGate: Send + Sync {
    async fn get_balance(&self, account_id: &str) -> Result<Credits>;

    /// Admit an iteration iff the balance is strictly positive. No funds are held.
    async fn reserve(&self, account_id: &str) -> Result<Admission>;

    /// Debit `actual_cost`; repeated commits of one reservation are no-ops.
    async fn commit(&self, reservation_id: &str, actual_cost: Credits, metadata: Value)
    -> Result<Credits>;

    /// Drop an uncommitted reservation or compensate a committed one.
    async fn refund(&self, reservation_id: &str, reason: &str) -> Result<()>;
}

// ── KnowledgeBase ────────────────────────────────────────────────────

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Prompt section for the agent, if it has any knowledge-base content.
    async fn context_for_agent(&self, agent_id: &str) -> Result<Option<String>>;
}
