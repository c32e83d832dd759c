//! Persisted domain models of the execution core.

pub mod account;
pub mod agent_run;
pub mod schedule;

pub use account::{Account, AccountTier, LedgerEntry, LedgerEntryType};
pub use agent_run::AgentRun;
pub use schedule::{Schedule, ScheduleError, ScheduledTask};
