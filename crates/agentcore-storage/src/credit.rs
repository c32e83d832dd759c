//! Credit storage - accounts, ledger entries and idempotence markers.
//!
//! Every balance change goes through [`CreditStorage::apply_entry`], which
//! reads the account row, appends one ledger entry and rewrites the account
//! inside a single write transaction. redb serializes write transactions, so
//! ledger writes are linearizable per account.

use anyhow::{Result, anyhow};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::range_utils::{parse_sortable_suffix, prefix_range, sortable_u64};

const ACCOUNTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("credit_accounts");
/// `{id_len}:{account_id}:{seq}` -> entry bytes
const LEDGER_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger_entries");
/// marker -> ledger key of the entry written under that marker
const MARKER_TABLE: TableDefinition<&str, &str> = TableDefinition::new("ledger_markers");

/// Key prefix of an account's ledger entries. The length prefix keeps one
/// id from matching the entries of another id that extends it.
pub fn ledger_prefix(account_id: &str) -> String {
    format!("{:08}:{}:", account_id.len(), account_id)
}

pub fn ledger_key(account_id: &str, seq: u64) -> String {
    format!("{}{}", ledger_prefix(account_id), sortable_u64(seq))
}

/// Bytes produced by the caller for one ledger write.
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    pub account: Vec<u8>,
    pub entry: Vec<u8>,
}

/// Outcome of [`CreditStorage::apply_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerApply {
    /// A new entry was written under this ledger key.
    Applied { entry_key: String },
    /// The marker was already present; nothing was written.
    Duplicate { entry_key: String },
}

#[derive(Debug, Clone)]
pub struct CreditStorage {
    db: Arc<Database>,
}

impl CreditStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(ACCOUNTS_TABLE)?;
        write_txn.open_table(LEDGER_TABLE)?;
        write_txn.open_table(MARKER_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub fn get_account_raw(&self, account_id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;
        Ok(table.get(account_id)?.map(|v| v.value().to_vec()))
    }

    /// Insert the account row only if it does not exist yet.
    pub fn create_account_raw(&self, account_id: &str, data: &[u8]) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(ACCOUNTS_TABLE)?;
            if table.get(account_id)?.is_some() {
                false
            } else {
                table.insert(account_id, data)?;
                true
            }
        };
        write_txn.commit()?;
        Ok(created)
    }

    /// Overwrite account metadata (tier, locale). Balance changes must go
    /// through `apply_entry`.
    pub fn put_account_raw(&self, account_id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCOUNTS_TABLE)?;
            table.insert(account_id, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_accounts_raw(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;
        let mut accounts = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            accounts.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(accounts)
    }

    /// Append one ledger entry and rewrite the account row atomically.
    ///
    /// `build` receives the current account bytes and the key the new entry
    /// will be stored under. When `marker` is given and already recorded, the
    /// closure is not called and `Duplicate` is returned.
    pub fn apply_entry<F>(&self, account_id: &str, marker: Option<&str>, build: F) -> Result<LedgerApply>
    where
        F: FnOnce(&[u8], &str) -> Result<LedgerWrite>,
    {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut markers = write_txn.open_table(MARKER_TABLE)?;
            let existing = match marker {
                Some(marker) => markers.get(marker)?.map(|v| v.value().to_string()),
                None => None,
            };
            if let Some(entry_key) = existing {
                LedgerApply::Duplicate { entry_key }
            } else {
                let mut accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
                let mut ledger = write_txn.open_table(LEDGER_TABLE)?;

                let current = accounts
                    .get(account_id)?
                    .map(|v| v.value().to_vec())
                    .ok_or_else(|| anyhow!("Account {} not found", account_id))?;

                let (start, end) = prefix_range(&ledger_prefix(account_id));
                let last_seq = match ledger.range(start.as_str()..end.as_str())?.next_back() {
                    Some(item) => {
                        let (key, _) = item?;
                        parse_sortable_suffix(key.value(), ':').unwrap_or(0)
                    }
                    None => 0,
                };
                let entry_key = ledger_key(account_id, last_seq + 1);

                let write = build(&current, &entry_key)?;
                ledger.insert(entry_key.as_str(), write.entry.as_slice())?;
                accounts.insert(account_id, write.account.as_slice())?;
                if let Some(marker) = marker {
                    markers.insert(marker, entry_key.as_str())?;
                }
                LedgerApply::Applied { entry_key }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Ledger key recorded for `marker`, if any.
    pub fn get_marker(&self, marker: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MARKER_TABLE)?;
        Ok(table.get(marker)?.map(|v| v.value().to_string()))
    }

    pub fn get_entry_raw(&self, entry_key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEDGER_TABLE)?;
        Ok(table.get(entry_key)?.map(|v| v.value().to_vec()))
    }

    /// All entries of an account in append order.
    pub fn list_entries_raw(&self, account_id: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEDGER_TABLE)?;
        let (start, end) = prefix_range(&ledger_prefix(account_id));

        let mut entries = Vec::new();
        for item in table.range(start.as_str()..end.as_str())? {
            let (key, value) = item?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, CreditStorage) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("credit.db")).unwrap());
        let storage = CreditStorage::new(db).unwrap();
        (temp_dir, storage)
    }

    fn counter_write(current: &[u8], _entry_key: &str) -> Result<LedgerWrite> {
        let value: u64 = std::str::from_utf8(current)?.parse::<u64>()? + 1;
        Ok(LedgerWrite {
            account: value.to_string().into_bytes(),
            entry: format!("entry-{}", value).into_bytes(),
        })
    }

    #[test]
    fn test_apply_entry_appends_in_sequence() {
        let (_dir, storage) = setup();
        assert!(storage.create_account_raw("acct", b"0").unwrap());
        assert!(!storage.create_account_raw("acct", b"99").unwrap());

        storage.apply_entry("acct", None, counter_write).unwrap();
        storage.apply_entry("acct", None, counter_write).unwrap();

        let entries = storage.list_entries_raw("acct").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"entry-1");
        assert_eq!(entries[1].1, b"entry-2");
        assert_eq!(storage.get_account_raw("acct").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_marker_makes_apply_idempotent() {
        let (_dir, storage) = setup();
        storage.create_account_raw("acct", b"0").unwrap();

        let first = storage.apply_entry("acct", Some("commit:r1"), counter_write).unwrap();
        let second = storage.apply_entry("acct", Some("commit:r1"), counter_write).unwrap();

        let LedgerApply::Applied { entry_key } = first else {
            panic!("first apply should write");
        };
        assert_eq!(second, LedgerApply::Duplicate { entry_key: entry_key.clone() });
        assert_eq!(storage.list_entries_raw("acct").unwrap().len(), 1);
        assert_eq!(storage.get_marker("commit:r1").unwrap(), Some(entry_key));
    }

    #[test]
    fn test_account_ids_sharing_a_prefix_keep_separate_ledgers() {
        let (_dir, storage) = setup();
        storage.create_account_raw("org", b"0").unwrap();
        storage.create_account_raw("org:team", b"0").unwrap();

        storage.apply_entry("org", None, counter_write).unwrap();
        for _ in 0..3 {
            storage.apply_entry("org:team", None, counter_write).unwrap();
        }
        let LedgerApply::Applied { entry_key } =
            storage.apply_entry("org", None, counter_write).unwrap()
        else {
            panic!("apply should write");
        };

        assert_eq!(entry_key, ledger_key("org", 2));
        let org = storage.list_entries_raw("org").unwrap();
        assert_eq!(org.len(), 2);
        assert!(org.iter().all(|(key, _)| key.starts_with(&ledger_prefix("org"))));
        assert_eq!(storage.list_entries_raw("org:team").unwrap().len(), 3);
        assert_eq!(storage.get_account_raw("org").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_apply_entry_requires_account() {
        let (_dir, storage) = setup();
        assert!(storage.apply_entry("missing", None, counter_write).is_err());
    }

    #[test]
    fn test_failed_build_writes_nothing() {
        let (_dir, storage) = setup();
        storage.create_account_raw("acct", b"not-a-number").unwrap();
        assert!(storage.apply_entry("acct", Some("m"), counter_write).is_err());
        assert!(storage.list_entries_raw("acct").unwrap().is_empty());
        assert!(storage.get_marker("m").unwrap().is_none());
    }
}
