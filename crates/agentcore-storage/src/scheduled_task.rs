//! Scheduled task storage - byte-level API keyed by task id.

use crate::define_simple_storage;

define_simple_storage! {
    /// Recurring prompt schedules.
    pub struct ScheduledTaskStorage { table: "scheduled_tasks" }
}
