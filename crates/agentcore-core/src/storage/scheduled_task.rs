//! Typed scheduled task storage wrapper.

use crate::models::ScheduledTask;
use anyhow::Result;
use chrono::{DateTime, Utc};
use redb::Database;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ScheduledTaskStorage {
    inner: agentcore_storage::ScheduledTaskStorage,
}

impl ScheduledTaskStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            inner: agentcore_storage::ScheduledTaskStorage::new(db)?,
        })
    }

    pub fn put(&self, task: &ScheduledTask) -> Result<()> {
        let bytes = serde_json::to_vec(task)?;
        self.inner.put_raw(&task.id, &bytes)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        match self.inner.get_raw(task_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks = Vec::new();
        for (_, bytes) in self.inner.list_raw()? {
            tasks.push(serde_json::from_slice(&bytes)?);
        }
        Ok(tasks)
    }

    pub fn list_for_account(&self, account_id: &str) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|task| task.account_id == account_id)
            .collect())
    }

    /// Active tasks whose `next_run_at` is not after `now`.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let mut due: Vec<ScheduledTask> = self
            .list()?
            .into_iter()
            .filter(|task| task.is_due(now))
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        Ok(due)
    }

    /// Read-modify-write of one task. Returns `None` when it does not exist.
    pub fn update<F>(&self, task_id: &str, update: F) -> Result<Option<ScheduledTask>>
    where
        F: FnOnce(&mut ScheduledTask) -> Result<()>,
    {
        let written = self.inner.update_raw(task_id, |current| {
            let Some(bytes) = current else {
                return Ok(None);
            };
            let mut task: ScheduledTask = serde_json::from_slice(bytes)?;
            update(&mut task)?;
            Ok(Some(serde_json::to_vec(&task)?))
        })?;
        match written {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, task_id: &str) -> Result<bool> {
        self.inner.delete(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schedule;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    #[test]
    fn test_list_due_only_returns_active_past_tasks() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("tasks.db")).unwrap());
        let storage = ScheduledTaskStorage::new(db).unwrap();

        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 30, 0).unwrap();
        let hourly = Schedule::Hourly { minute_of_hour: 0 };
        let due = ScheduledTask::new("a", "agent", hourly.clone(), created).unwrap();
        let mut paused = ScheduledTask::new("a", "agent", hourly.clone(), created).unwrap();
        paused.pause();
        let later = ScheduledTask::new("b", "agent", hourly, created + Duration::hours(5)).unwrap();
        for task in [&due, &paused, &later] {
            storage.put(task).unwrap();
        }

        let now = created + Duration::hours(1);
        let listed = storage.list_due(now).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);

        let updated = storage
            .update(&due.id, |task| {
                task.advance(now)?;
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert!(updated.next_run_at > now);
        assert!(storage.list_due(now).unwrap().is_empty());
        assert!(storage.update("missing", |_| Ok(())).unwrap().is_none());
        assert_eq!(storage.list_for_account("b").unwrap().len(), 1);
    }
}
