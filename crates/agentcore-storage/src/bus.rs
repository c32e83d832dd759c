//! Stream bus storage - append-only lists, plain values and key expiry.
//!
//! Lists hold one row per entry under `{list_key}#{index}`. Values are plain
//! key/value rows (liveness keys). Any list or value key can carry an expiry
//! timestamp; [`BusStorage::purge_expired`] removes whatever has lapsed.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::range_utils::{parse_sortable_suffix, prefix_range, sortable_u64};

const BUS_LIST_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bus_lists");
const BUS_VALUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bus_values");
/// key -> unix millis after which the key is dropped
const BUS_EXPIRY_TABLE: TableDefinition<&str, i64> = TableDefinition::new("bus_expiry");

fn list_prefix(list_key: &str) -> String {
    format!("{}#", list_key)
}

#[derive(Debug, Clone)]
pub struct BusStorage {
    db: Arc<Database>,
}

impl BusStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(BUS_LIST_TABLE)?;
        write_txn.open_table(BUS_VALUE_TABLE)?;
        write_txn.open_table(BUS_EXPIRY_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append to a list and return the zero-based index of the new entry.
    pub fn push(&self, list_key: &str, data: &[u8]) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let index = {
            let mut lists = write_txn.open_table(BUS_LIST_TABLE)?;
            let (start, end) = prefix_range(&list_prefix(list_key));
            let next = match lists.range(start.as_str()..end.as_str())?.next_back() {
                Some(item) => {
                    let (key, _) = item?;
                    parse_sortable_suffix(key.value(), '#').map_or(0, |last| last + 1)
                }
                None => 0,
            };
            let key = format!("{}{}", list_prefix(list_key), sortable_u64(next));
            lists.insert(key.as_str(), data)?;
            next
        };
        write_txn.commit()?;
        Ok(index)
    }

    /// Up to `limit` entries starting at `from_index`, as `(index, bytes)`.
    pub fn range(&self, list_key: &str, from_index: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let lists = read_txn.open_table(BUS_LIST_TABLE)?;
        let start = format!("{}{}", list_prefix(list_key), sortable_u64(from_index));
        let (_, end) = prefix_range(&list_prefix(list_key));

        let mut entries = Vec::new();
        for item in lists.range(start.as_str()..end.as_str())?.take(limit) {
            let (key, value) = item?;
            if let Some(index) = parse_sortable_suffix(key.value(), '#') {
                entries.push((index, value.value().to_vec()));
            }
        }
        Ok(entries)
    }

    pub fn len(&self, list_key: &str) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let lists = read_txn.open_table(BUS_LIST_TABLE)?;
        let (start, end) = prefix_range(&list_prefix(list_key));
        let len = match lists.range(start.as_str()..end.as_str())?.next_back() {
            Some(item) => {
                let (key, _) = item?;
                parse_sortable_suffix(key.value(), '#').map_or(0, |last| last + 1)
            }
            None => 0,
        };
        Ok(len)
    }

    pub fn set_value(&self, key: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut values = write_txn.open_table(BUS_VALUE_TABLE)?;
            values.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let values = read_txn.open_table(BUS_VALUE_TABLE)?;
        Ok(values.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Value keys starting with `prefix`.
    pub fn value_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let values = read_txn.open_table(BUS_VALUE_TABLE)?;
        let (start, end) = prefix_range(prefix);
        let mut keys = Vec::new();
        for item in values.range(start.as_str()..end.as_str())? {
            let (key, _) = item?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    /// Set (or move) the expiry of a list or value key.
    pub fn expire_at(&self, key: &str, at_millis: i64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut expiry = write_txn.open_table(BUS_EXPIRY_TABLE)?;
            expiry.insert(key, at_millis)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn expiry_of(&self, key: &str) -> Result<Option<i64>> {
        let read_txn = self.db.begin_read()?;
        let expiry = read_txn.open_table(BUS_EXPIRY_TABLE)?;
        Ok(expiry.get(key)?.map(|v| v.value()))
    }

    /// Delete a key whether it names a list or a value.
    pub fn delete_key(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut lists = write_txn.open_table(BUS_LIST_TABLE)?;
            let mut values = write_txn.open_table(BUS_VALUE_TABLE)?;
            let mut expiry = write_txn.open_table(BUS_EXPIRY_TABLE)?;
            remove_key(&mut lists, &mut values, &mut expiry, key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove every key whose expiry is at or before `now_millis`.
    pub fn purge_expired(&self, now_millis: i64) -> Result<Vec<String>> {
        let write_txn = self.db.begin_write()?;
        let purged = {
            let mut lists = write_txn.open_table(BUS_LIST_TABLE)?;
            let mut values = write_txn.open_table(BUS_VALUE_TABLE)?;
            let mut expiry = write_txn.open_table(BUS_EXPIRY_TABLE)?;

            let mut due = Vec::new();
            for item in expiry.iter()? {
                let (key, at) = item?;
                if at.value() <= now_millis {
                    due.push(key.value().to_string());
                }
            }
            for key in &due {
                remove_key(&mut lists, &mut values, &mut expiry, key)?;
            }
            due
        };
        write_txn.commit()?;
        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "Purged expired bus keys");
        }
        Ok(purged)
    }
}

fn remove_key(
    lists: &mut redb::Table<'_, &'static str, &'static [u8]>,
    values: &mut redb::Table<'_, &'static str, &'static [u8]>,
    expiry: &mut redb::Table<'_, &'static str, i64>,
    key: &str,
) -> Result<()> {
    let (start, end) = prefix_range(&list_prefix(key));
    let mut entry_keys = Vec::new();
    for item in lists.range(start.as_str()..end.as_str())? {
        let (entry_key, _) = item?;
        entry_keys.push(entry_key.value().to_string());
    }
    for entry_key in entry_keys {
        lists.remove(entry_key.as_str())?;
    }
    values.remove(key)?;
    expiry.remove(key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, BusStorage) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("bus.db")).unwrap());
        (temp_dir, BusStorage::new(db).unwrap())
    }

    #[test]
    fn test_push_assigns_sequential_indexes() {
        let (_dir, storage) = setup();
        assert_eq!(storage.push("agent_run:r1:responses", b"a").unwrap(), 0);
        assert_eq!(storage.push("agent_run:r1:responses", b"b").unwrap(), 1);
        assert_eq!(storage.push("agent_run:r2:responses", b"x").unwrap(), 0);
        assert_eq!(storage.len("agent_run:r1:responses").unwrap(), 2);
        assert_eq!(storage.len("agent_run:none:responses").unwrap(), 0);
    }

    #[test]
    fn test_range_batches_from_index() {
        let (_dir, storage) = setup();
        for i in 0..5u8 {
            storage.push("list", &[i]).unwrap();
        }
        let batch = storage.range("list", 1, 2).unwrap();
        assert_eq!(batch, vec![(1, vec![1]), (2, vec![2])]);
        let tail = storage.range("list", 4, 10).unwrap();
        assert_eq!(tail, vec![(4, vec![4])]);
        assert!(storage.range("list", 5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_purge_expired_removes_lists_and_values() {
        let (_dir, storage) = setup();
        storage.push("list", b"a").unwrap();
        storage.set_value("active_run:i1:r1", b"running").unwrap();
        storage.set_value("active_run:i2:r1", b"running").unwrap();
        storage.expire_at("list", 100).unwrap();
        storage.expire_at("active_run:i1:r1", 100).unwrap();
        storage.expire_at("active_run:i2:r1", 500).unwrap();

        let purged = storage.purge_expired(200).unwrap();
        assert_eq!(purged.len(), 2);
        assert_eq!(storage.len("list").unwrap(), 0);
        assert_eq!(storage.value_keys("active_run:").unwrap(), vec!["active_run:i2:r1"]);
        assert_eq!(storage.expiry_of("active_run:i2:r1").unwrap(), Some(500));
    }

    #[test]
    fn test_delete_key() {
        let (_dir, storage) = setup();
        storage.push("list", b"a").unwrap();
        storage.delete_key("list").unwrap();
        assert_eq!(storage.len("list").unwrap(), 0);
    }
}
