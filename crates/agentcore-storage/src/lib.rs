//! Agent core storage - low-level persistence layer.
//!
//! Uses redb as the embedded transactional store and exposes byte-level APIs;
//! typed wrappers live in `agentcore-core`.
//!
//! # Tables
//!
//! - `credit_accounts`, `ledger_entries`, `ledger_markers` - credit ledger
//! - `threads`, `thread_messages` - conversations
//! - `agent_runs` - run lifecycle with a per-thread index
//! - `scheduled_tasks` - recurring prompts
//! - `bus_lists`, `bus_values`, `bus_expiry` - stream bus persistence

pub mod agent_run;
pub mod bus;
pub mod credit;
pub mod message;
pub mod range_utils;
pub mod scheduled_task;
pub mod simple_storage;
pub mod thread;

pub use agent_run::AgentRunStorage;
pub use bus::BusStorage;
pub use credit::{CreditStorage, LedgerApply, LedgerWrite};
pub use message::MessageStorage;
pub use scheduled_task::ScheduledTaskStorage;
pub use simple_storage::SimpleStorage;
pub use thread::ThreadStorage;
