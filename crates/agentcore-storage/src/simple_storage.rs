use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;

use crate::range_utils::prefix_range;

/// Byte-level CRUD over a single `&str -> &[u8]` table.
///
/// Implementors only provide the table definition and the database handle.
pub trait SimpleStorage: Send + Sync {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    fn db(&self) -> &Arc<Database>;

    fn put_raw(&self, id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db().begin_write()?;
        {
            let mut table = write_txn.open_table(Self::TABLE)?;
            table.insert(id, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_raw(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.get(id)?.map(|value| value.value().to_vec()))
    }

    fn list_raw(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;

        let mut items = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            items.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(items)
    }

    /// List entries whose key starts with `prefix`, in key order.
    fn list_prefix_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        let (start, end) = prefix_range(prefix);

        let mut items = Vec::new();
        for item in table.range(start.as_str()..end.as_str())? {
            let (key, value) = item?;
            items.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(items)
    }

    /// Read-modify-write inside one write transaction.
    ///
    /// `update` receives the current bytes (if any) and returns the bytes to
    /// store, or `None` to leave the row untouched.
    fn update_raw<F>(&self, id: &str, update: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    {
        let write_txn = self.db().begin_write()?;
        let written = {
            let mut table = write_txn.open_table(Self::TABLE)?;
            let current = table.get(id)?.map(|value| value.value().to_vec());
            let next = update(current.as_deref())?;
            if let Some(bytes) = &next {
                table.insert(id, bytes.as_slice())?;
            }
            next
        };
        write_txn.commit()?;
        Ok(written)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db().begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(Self::TABLE)?;
            table.remove(id)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.get(id)?.is_some())
    }

    fn count(&self) -> Result<usize> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(Self::TABLE)?;
        Ok(table.len()? as usize)
    }
}

/// Generate a storage struct bound to one table, with inherent forwarding
/// methods so callers do not need the trait in scope.
#[macro_export]
macro_rules! define_simple_storage {
    ( $(#[$meta:meta])* $vis:vis struct $name:ident { table: $table_name:literal } ) => {
        const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> =
            redb::TableDefinition::new($table_name);

        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            db: std::sync::Arc<redb::Database>,
        }

        impl $name {
            pub fn new(db: std::sync::Arc<redb::Database>) -> anyhow::Result<Self> {
                let write_txn = db.begin_write()?;
                write_txn.open_table(TABLE)?;
                write_txn.commit()?;

                Ok(Self { db })
            }

            pub fn put_raw(&self, id: &str, data: &[u8]) -> anyhow::Result<()> {
                <Self as $crate::SimpleStorage>::put_raw(self, id, data)
            }

            pub fn get_raw(&self, id: &str) -> anyhow::Result<Option<Vec<u8>>> {
                <Self as $crate::SimpleStorage>::get_raw(self, id)
            }

            pub fn list_raw(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
                <Self as $crate::SimpleStorage>::list_raw(self)
            }

            pub fn list_prefix_raw(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
                <Self as $crate::SimpleStorage>::list_prefix_raw(self, prefix)
            }

            pub fn update_raw<F>(&self, id: &str, update: F) -> anyhow::Result<Option<Vec<u8>>>
            where
                F: FnOnce(Option<&[u8]>) -> anyhow::Result<Option<Vec<u8>>>,
            {
                <Self as $crate::SimpleStorage>::update_raw(self, id, update)
            }

            pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
                <Self as $crate::SimpleStorage>::delete(self, id)
            }

            pub fn exists(&self, id: &str) -> anyhow::Result<bool> {
                <Self as $crate::SimpleStorage>::exists(self, id)
            }

            pub fn count(&self) -> anyhow::Result<usize> {
                <Self as $crate::SimpleStorage>::count(self)
            }
        }

        impl $crate::SimpleStorage for $name {
            const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = TABLE;

            fn db(&self) -> &std::sync::Arc<redb::Database> {
                &self.db
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    crate::define_simple_storage! {
        struct NoteStorage { table: "notes" }
    }

    fn storage() -> (tempfile::TempDir, NoteStorage) {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("notes.db")).unwrap());
        (dir, NoteStorage::new(db).unwrap())
    }

    #[test]
    fn test_list_prefix_is_key_ordered_and_bounded() {
        let (_dir, storage) = storage();
        storage.put_raw("run:b#2", b"2").unwrap();
        storage.put_raw("run:b#1", b"1").unwrap();
        storage.put_raw("run:bb#1", b"x").unwrap();
        storage.put_raw("run:a#1", b"a").unwrap();

        let keys: Vec<String> = storage
            .list_prefix_raw("run:b#")
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["run:b#1", "run:b#2"]);
        assert_eq!(storage.count().unwrap(), 4);
    }

    #[test]
    fn test_update_raw_skips_write_on_none() {
        let (_dir, storage) = storage();
        let written = storage.update_raw("k", |current| {
            assert!(current.is_none());
            Ok(None)
        });
        assert_eq!(written.unwrap(), None);
        assert!(!storage.exists("k").unwrap());

        storage.put_raw("k", b"1").unwrap();
        let written = storage
            .update_raw("k", |current| {
                let mut next = current.unwrap().to_vec();
                next.push(b'2');
                Ok(Some(next))
            })
            .unwrap();
        assert_eq!(written.as_deref(), Some(&b"12"[..]));
        assert!(storage.delete("k").unwrap());
        assert!(!storage.delete("k").unwrap());
    }
}
