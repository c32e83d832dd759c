//! Thread message storage - ordered per thread by creation time.
//!
//! Keys are `{thread_id}:{created_at_micros}:{message_id}`, so a prefix scan
//! returns a thread's messages in creation order. Timestamps are forced to be
//! strictly increasing per thread at insert time.

use anyhow::{Result, anyhow};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::range_utils::{prefix_range, sortable_u64};

const MESSAGE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("thread_messages");
/// message_id -> message key
const MESSAGE_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("thread_message_index");

#[derive(Debug, Clone)]
pub struct MessageStorage {
    db: Arc<Database>,
}

fn micros_from_key(key: &str) -> Option<u64> {
    let mut parts = key.rsplitn(3, ':');
    parts.next()?;
    parts.next()?.parse().ok()
}

impl MessageStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(MESSAGE_TABLE)?;
        write_txn.open_table(MESSAGE_INDEX_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append a message to a thread.
    ///
    /// `requested_micros` is the caller's clock reading; if it does not exceed
    /// the thread's last timestamp the message gets `last + 1`. `build`
    /// receives the final timestamp and returns the bytes to store.
    pub fn append_raw<F>(
        &self,
        thread_id: &str,
        message_id: &str,
        requested_micros: u64,
        build: F,
    ) -> Result<u64>
    where
        F: FnOnce(u64) -> Result<Vec<u8>>,
    {
        let write_txn = self.db.begin_write()?;
        let micros = {
            let mut table = write_txn.open_table(MESSAGE_TABLE)?;
            let mut index = write_txn.open_table(MESSAGE_INDEX_TABLE)?;

            if index.get(message_id)?.is_some() {
                return Err(anyhow!("Message {} already exists", message_id));
            }

            let (start, end) = prefix_range(&format!("{}:", thread_id));
            let last = match table.range(start.as_str()..end.as_str())?.next_back() {
                Some(item) => {
                    let (key, _) = item?;
                    micros_from_key(key.value())
                }
                None => None,
            };
            let micros = match last {
                Some(last) if requested_micros <= last => last + 1,
                _ => requested_micros,
            };

            let data = build(micros)?;
            let key = format!("{}:{}:{}", thread_id, sortable_u64(micros), message_id);
            table.insert(key.as_str(), data.as_slice())?;
            index.insert(message_id, key.as_str())?;
            micros
        };
        write_txn.commit()?;
        Ok(micros)
    }

    /// Replace the stored bytes of an existing message.
    pub fn update_raw(&self, message_id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let index = write_txn.open_table(MESSAGE_INDEX_TABLE)?;
            let key = index
                .get(message_id)?
                .map(|v| v.value().to_string())
                .ok_or_else(|| anyhow!("Message {} not found", message_id))?;
            let mut table = write_txn.open_table(MESSAGE_TABLE)?;
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_raw(&self, message_id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(MESSAGE_INDEX_TABLE)?;
        let Some(key) = index.get(message_id)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(MESSAGE_TABLE)?;
        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    /// All messages of a thread in creation order.
    pub fn list_by_thread_raw(&self, thread_id: &str) -> Result<Vec<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGE_TABLE)?;
        let (start, end) = prefix_range(&format!("{}:", thread_id));

        let mut messages = Vec::new();
        for item in table.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            messages.push(value.value().to_vec());
        }
        Ok(messages)
    }

    /// Walk a thread newest-first until `visit` returns `false`.
    pub fn scan_back_raw<F>(&self, thread_id: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGE_TABLE)?;
        let (start, end) = prefix_range(&format!("{}:", thread_id));

        for item in table.range(start.as_str()..end.as_str())?.rev() {
            let (_, value) = item?;
            if !visit(value.value())? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, MessageStorage) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("messages.db")).unwrap());
        (temp_dir, MessageStorage::new(db).unwrap())
    }

    #[test]
    fn test_append_keeps_timestamps_strictly_increasing() {
        let (_dir, storage) = setup();
        let a = storage
            .append_raw("t1", "m1", 1_000, |ts| Ok(format!("a@{}", ts).into_bytes()))
            .unwrap();
        let b = storage
            .append_raw("t1", "m2", 1_000, |ts| Ok(format!("b@{}", ts).into_bytes()))
            .unwrap();
        let c = storage
            .append_raw("t1", "m3", 500, |ts| Ok(format!("c@{}", ts).into_bytes()))
            .unwrap();

        assert_eq!(a, 1_000);
        assert_eq!(b, 1_001);
        assert_eq!(c, 1_002);

        let listed = storage.list_by_thread_raw("t1").unwrap();
        assert_eq!(listed, vec![b"a@1000".to_vec(), b"b@1001".to_vec(), b"c@1002".to_vec()]);
    }

    #[test]
    fn test_threads_are_isolated() {
        let (_dir, storage) = setup();
        storage.append_raw("t1", "m1", 10, |_| Ok(b"one".to_vec())).unwrap();
        storage.append_raw("t2", "m2", 5, |_| Ok(b"two".to_vec())).unwrap();

        assert_eq!(storage.list_by_thread_raw("t1").unwrap().len(), 1);
        assert_eq!(storage.list_by_thread_raw("t2").unwrap(), vec![b"two".to_vec()]);
    }

    #[test]
    fn test_update_and_scan_back() {
        let (_dir, storage) = setup();
        storage.append_raw("t1", "m1", 10, |_| Ok(b"first".to_vec())).unwrap();
        storage.append_raw("t1", "m2", 20, |_| Ok(b"draft".to_vec())).unwrap();
        storage.update_raw("m2", b"final").unwrap();

        assert_eq!(storage.get_raw("m2").unwrap().unwrap(), b"final");

        let mut seen = Vec::new();
        storage
            .scan_back_raw("t1", |bytes| {
                seen.push(bytes.to_vec());
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![b"final".to_vec(), b"first".to_vec()]);
    }

    #[test]
    fn test_duplicate_message_id_rejected() {
        let (_dir, storage) = setup();
        storage.append_raw("t1", "m1", 10, |_| Ok(b"x".to_vec())).unwrap();
        assert!(storage.append_raw("t1", "m1", 11, |_| Ok(b"y".to_vec())).is_err());
        assert!(storage.update_raw("missing", b"z").is_err());
    }
}
