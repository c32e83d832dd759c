//! Thread storage - one row per conversation.

use crate::define_simple_storage;

define_simple_storage! {
    /// Thread rows keyed by thread id.
    pub struct ThreadStorage { table: "threads" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_thread_roundtrip_and_delete() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("threads.db")).unwrap());
        let storage = ThreadStorage::new(db).unwrap();

        storage.put_raw("t1", b"{}").unwrap();
        assert!(storage.exists("t1").unwrap());
        assert_eq!(storage.count().unwrap(), 1);
        assert!(storage.delete("t1").unwrap());
        assert!(!storage.delete("t1").unwrap());
    }
}
