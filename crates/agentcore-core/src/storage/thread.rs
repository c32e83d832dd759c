//! Typed thread and message storage wrapper.

use agentcore_traits::{MessageRecord, NewMessage, ThreadRecord};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use redb::Database;
use std::sync::Arc;

/// Threads and their ordered messages.
#[derive(Debug, Clone)]
pub struct ThreadStorage {
    threads: agentcore_storage::ThreadStorage,
    messages: agentcore_storage::MessageStorage,
}

impl ThreadStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            threads: agentcore_storage::ThreadStorage::new(db.clone())?,
            messages: agentcore_storage::MessageStorage::new(db)?,
        })
    }

    pub fn create_thread(&self, thread: &ThreadRecord) -> Result<()> {
        let bytes = serde_json::to_vec(thread)?;
        self.threads.put_raw(&thread.id, &bytes)
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        match self.threads.get_raw(thread_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_threads(&self) -> Result<Vec<ThreadRecord>> {
        let mut threads = Vec::new();
        for (_, bytes) in self.threads.list_raw()? {
            threads.push(serde_json::from_slice(&bytes)?);
        }
        Ok(threads)
    }

    /// Append a message; `created_at` is forced strictly past the thread's
    /// previous message.
    pub fn append_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let requested = Utc::now().timestamp_micros().max(0) as u64;
        let mut record = None;
        self.messages
            .append_raw(&message.thread_id, &id, requested, |micros| {
                let created_at = DateTime::<Utc>::from_timestamp_micros(micros as i64)
                    .ok_or_else(|| anyhow!("Invalid message timestamp {}", micros))?;
                let built = MessageRecord {
                    id: id.clone(),
                    thread_id: message.thread_id.clone(),
                    message_type: message.message_type,
                    content: message.content.clone(),
                    is_llm_message: message.is_llm_message,
                    metadata: message.metadata.clone(),
                    created_at,
                };
                let bytes = serde_json::to_vec(&built)?;
                record = Some(built);
                Ok(bytes)
            })?;
        record.ok_or_else(|| anyhow!("Message {} was not written", id))
    }

    pub fn update_message(&self, message: &MessageRecord) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        self.messages.update_raw(&message.id, &bytes)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        match self.messages.get_raw(message_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_messages(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        let mut messages = Vec::new();
        for bytes in self.messages.list_by_thread_raw(thread_id)? {
            messages.push(serde_json::from_slice(&bytes)?);
        }
        Ok(messages)
    }

    pub fn latest_llm_message(&self, thread_id: &str) -> Result<Option<MessageRecord>> {
        let mut found = None;
        self.messages.scan_back_raw(thread_id, |bytes| {
            let record: MessageRecord = serde_json::from_slice(bytes)?;
            if record.is_llm_message {
                found = Some(record);
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_traits::MessageType;
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ThreadStorage) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("threads.db")).unwrap());
        (temp_dir, ThreadStorage::new(db).unwrap())
    }

    #[test]
    fn test_messages_keep_order_and_skip_status() {
        let (_dir, storage) = setup();
        let first = storage.append_message(NewMessage::user("t1", "hi")).unwrap();
        let second = storage
            .append_message(NewMessage::assistant("t1", "hello"))
            .unwrap();
        storage
            .append_message(NewMessage::status("t1", json!({"status_type": "completed"})))
            .unwrap();

        assert!(second.created_at > first.created_at);
        let listed = storage.list_messages("t1").unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[2].message_type, MessageType::Status);

        let latest = storage.latest_llm_message("t1").unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(storage.latest_llm_message("t2").unwrap().is_none());
    }

    #[test]
    fn test_update_message_in_place() {
        let (_dir, storage) = setup();
        let mut record = storage
            .append_message(NewMessage::assistant("t1", "partial"))
            .unwrap();
        record.content = json!({"role": "assistant", "content": "partial and done"});
        storage.update_message(&record).unwrap();

        let stored = storage.get_message(&record.id).unwrap().unwrap();
        assert_eq!(stored.text(), "partial and done");
        assert_eq!(storage.list_messages("t1").unwrap().len(), 1);
    }
}
