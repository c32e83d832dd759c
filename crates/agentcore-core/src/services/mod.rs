//! Services built on the typed storage: credit ledger, run manager and
//! scheduler.

pub mod ledger;
pub mod run_manager;
pub mod scheduler;

pub use ledger::{CreditLedger, LedgerError};
pub use run_manager::{RunHandle, RunManager, RunManagerError, RunRequest, close_run};
pub use scheduler::{Scheduler, SchedulerCommand, SchedulerHandle, TickReport};
