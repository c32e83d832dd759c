//! Typed agent run storage wrapper.

use crate::models::AgentRun;
use agentcore_traits::RunStatus;
use anyhow::Result;
use redb::Database;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AgentRunStorage {
    inner: agentcore_storage::AgentRunStorage,
}

fn is_running(bytes: &[u8]) -> bool {
    serde_json::from_slice::<AgentRun>(bytes)
        .map(|run| run.is_running())
        .unwrap_or(false)
}

impl AgentRunStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            inner: agentcore_storage::AgentRunStorage::new(db)?,
        })
    }

    /// Insert a new run unless its thread already has a running one.
    /// Returns the id of the running run on conflict.
    pub fn insert_if_idle(&self, run: &AgentRun) -> Result<Option<String>> {
        let bytes = serde_json::to_vec(run)?;
        self.inner
            .insert_unless(&run.id, &run.thread_id, &bytes, is_running)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<AgentRun>> {
        match self.inner.get_raw(run_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Close a running run. Returns the updated run, or `None` when it had
    /// already reached a terminal status.
    pub fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Option<AgentRun>> {
        let written = self.inner.update_raw(run_id, |bytes| {
            let mut run: AgentRun = serde_json::from_slice(bytes)?;
            if !run.finish(status, error) {
                return Ok(None);
            }
            Ok(Some(serde_json::to_vec(&run)?))
        })?;
        match written {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_for_thread(&self, thread_id: &str) -> Result<Vec<AgentRun>> {
        let mut runs: Vec<AgentRun> = Vec::new();
        for (_, bytes) in self.inner.list_by_thread_raw(thread_id)? {
            runs.push(serde_json::from_slice(&bytes)?);
        }
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    pub fn running_on_thread(&self, thread_id: &str) -> Result<Option<AgentRun>> {
        Ok(self
            .list_for_thread(thread_id)?
            .into_iter()
            .find(AgentRun::is_running))
    }

    pub fn list_running(&self) -> Result<Vec<AgentRun>> {
        let mut runs = Vec::new();
        for (_, bytes) in self.inner.list_raw()? {
            let run: AgentRun = serde_json::from_slice(&bytes)?;
            if run.is_running() {
                runs.push(run);
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, AgentRunStorage) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("runs.db")).unwrap());
        (temp_dir, AgentRunStorage::new(db).unwrap())
    }

    #[test]
    fn test_one_running_run_per_thread() {
        let (_dir, storage) = setup();
        let first = AgentRun::new("t1");
        assert_eq!(storage.insert_if_idle(&first).unwrap(), None);

        let second = AgentRun::new("t1");
        assert_eq!(storage.insert_if_idle(&second).unwrap(), Some(first.id.clone()));
        assert!(storage.get(&second.id).unwrap().is_none());

        storage
            .finish(&first.id, RunStatus::Completed, None)
            .unwrap()
            .unwrap();
        assert_eq!(storage.insert_if_idle(&second).unwrap(), None);
        assert_eq!(storage.list_for_thread("t1").unwrap().len(), 2);
        assert_eq!(
            storage.running_on_thread("t1").unwrap().map(|run| run.id),
            Some(second.id)
        );
    }

    #[test]
    fn test_finish_keeps_terminal_status() {
        let (_dir, storage) = setup();
        let run = AgentRun::new("t1");
        storage.insert_if_idle(&run).unwrap();

        let stopped = storage
            .finish(&run.id, RunStatus::Stopped, None)
            .unwrap()
            .unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert!(
            storage
                .finish(&run.id, RunStatus::Failed, Some("late".into()))
                .unwrap()
                .is_none()
        );
        assert_eq!(storage.get(&run.id).unwrap().unwrap().status, RunStatus::Stopped);
        assert!(storage.list_running().unwrap().is_empty());
    }
}
