//! Agent run storage - byte-level API with a per-thread index.

use anyhow::{Result, anyhow};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::range_utils::prefix_range;

const AGENT_RUN_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("agent_runs");
/// Index table: thread_id:run_id -> run_id
const AGENT_RUN_THREAD_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("agent_run_thread_index");

#[derive(Debug, Clone)]
pub struct AgentRunStorage {
    db: Arc<Database>,
}

impl AgentRunStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(AGENT_RUN_TABLE)?;
        write_txn.open_table(AGENT_RUN_THREAD_INDEX_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert a run unless another run of the same thread satisfies `blocks`.
    ///
    /// The check and the insert share one write transaction, so two callers
    /// racing on the same thread cannot both succeed. Returns the id of the
    /// blocking run on conflict.
    pub fn insert_unless<F>(
        &self,
        id: &str,
        thread_id: &str,
        data: &[u8],
        blocks: F,
    ) -> Result<Option<String>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let conflict = {
            let mut runs = write_txn.open_table(AGENT_RUN_TABLE)?;
            let mut index = write_txn.open_table(AGENT_RUN_THREAD_INDEX_TABLE)?;

            let (start, end) = prefix_range(&format!("{}:", thread_id));
            let mut sibling_ids = Vec::new();
            for item in index.range(start.as_str()..end.as_str())? {
                let (_, run_id) = item?;
                sibling_ids.push(run_id.value().to_string());
            }

            let mut conflict = None;
            for sibling in sibling_ids {
                if let Some(bytes) = runs.get(sibling.as_str())?
                    && blocks(bytes.value())
                {
                    conflict = Some(sibling);
                    break;
                }
            }

            if conflict.is_none() {
                runs.insert(id, data)?;
                let index_key = format!("{}:{}", thread_id, id);
                index.insert(index_key.as_str(), id)?;
            }
            conflict
        };

        if conflict.is_some() {
            write_txn.abort()?;
        } else {
            write_txn.commit()?;
        }
        Ok(conflict)
    }

    /// Overwrite an existing run.
    pub fn put_raw(&self, id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut runs = write_txn.open_table(AGENT_RUN_TABLE)?;
            if runs.get(id)?.is_none() {
                return Err(anyhow!("Agent run {} not found", id));
            }
            runs.insert(id, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read-modify-write of one run inside a single transaction.
    pub fn update_raw<F>(&self, id: &str, update: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&[u8]) -> Result<Option<Vec<u8>>>,
    {
        let write_txn = self.db.begin_write()?;
        let written = {
            let mut runs = write_txn.open_table(AGENT_RUN_TABLE)?;
            let current = runs
                .get(id)?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| anyhow!("Agent run {} not found", id))?;
            let next = update(&current)?;
            if let Some(bytes) = &next {
                runs.insert(id, bytes.as_slice())?;
            }
            next
        };
        write_txn.commit()?;
        Ok(written)
    }

    pub fn get_raw(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let runs = read_txn.open_table(AGENT_RUN_TABLE)?;
        Ok(runs.get(id)?.map(|v| v.value().to_vec()))
    }

    pub fn list_by_thread_raw(&self, thread_id: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(AGENT_RUN_THREAD_INDEX_TABLE)?;
        let runs = read_txn.open_table(AGENT_RUN_TABLE)?;
        let (start, end) = prefix_range(&format!("{}:", thread_id));

        let mut items = Vec::new();
        for item in index.range(start.as_str()..end.as_str())? {
            let (_, run_id) = item?;
            let run_id = run_id.value().to_string();
            if let Some(bytes) = runs.get(run_id.as_str())? {
                items.push((run_id, bytes.value().to_vec()));
            }
        }
        Ok(items)
    }

    pub fn list_raw(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let runs = read_txn.open_table(AGENT_RUN_TABLE)?;
        let mut items = Vec::new();
        for item in runs.iter()? {
            let (key, value) = item?;
            items.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(items)
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

    fn is_running(bytes: &[u8]) -> bool {
        bytes == b"running"
    }

    #[test]
    fn test_insert_unless_blocks_second_running_run() {
        let (_dir, storage) = setup();
        assert_eq!(
            storage.insert_unless("r1", "t1", b"running", is_running).unwrap(),
            None
        );
        assert_eq!(
            storage.insert_unless("r2", "t1", b"running", is_running).unwrap(),
            Some("r1".to_string())
        );
        assert!(storage.get_raw("r2").unwrap().is_none());

        // other threads are unaffected
        assert_eq!(
            storage.insert_unless("r3", "t2", b"running", is_running).unwrap(),
            None
        );
    }

    #[test]
    fn test_finished_run_does_not_block() {
        let (_dir, storage) = setup();
        storage.insert_unless("r1", "t1", b"running", is_running).unwrap();
        storage.update_raw("r1", |_| Ok(Some(b"completed".to_vec()))).unwrap();

        assert_eq!(
            storage.insert_unless("r2", "t1", b"running", is_running).unwrap(),
            None
        );
        let listed = storage.list_by_thread_raw("t1").unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn test_put_raw_requires_existing_run() {
        let (_dir, storage) = setup();
        assert!(storage.put_raw("missing", b"x").is_err());
        assert!(storage.update_raw("missing", |_| Ok(None)).is_err());
    }
}
