//! Typed account and ledger storage wrapper.

use crate::models::{Account, LedgerEntry};
use agentcore_storage::{LedgerApply, LedgerWrite};
use anyhow::Result;
use redb::Database;
use std::sync::Arc;

/// Typed wrapper around agentcore-storage::CreditStorage.
#[derive(Debug, Clone)]
pub struct AccountStorage {
    inner: agentcore_storage::CreditStorage,
}

impl AccountStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            inner: agentcore_storage::CreditStorage::new(db)?,
        })
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        match self.inner.get_account_raw(account_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert the account unless it exists. Returns whether it was created.
    pub fn create_account(&self, account: &Account) -> Result<bool> {
        let bytes = serde_json::to_vec(account)?;
        self.inner.create_account_raw(&account.id, &bytes)
    }

    /// Rewrite tier, locale and subscription. The stored balance is kept.
    pub fn update_profile(&self, account: &Account) -> Result<()> {
        let mut updated = account.clone();
        if let Some(stored) = self.get_account(&account.id)? {
            updated.balance = stored.balance;
        }
        let bytes = serde_json::to_vec(&updated)?;
        self.inner.put_account_raw(&account.id, &bytes)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts = Vec::new();
        for (_, bytes) in self.inner.list_accounts_raw()? {
            accounts.push(serde_json::from_slice(&bytes)?);
        }
        Ok(accounts)
    }

    /// Append one ledger entry and the matching balance update in one
    /// transaction. `build` gets the current account and the new entry key.
    pub fn apply<F>(&self, account_id: &str, marker: Option<&str>, build: F) -> Result<LedgerApply>
    where
        F: FnOnce(Account, String) -> Result<(Account, LedgerEntry)>,
    {
        self.inner.apply_entry(account_id, marker, |current, entry_key| {
            let account: Account = serde_json::from_slice(current)?;
            let (account, entry) = build(account, entry_key.to_string())?;
            Ok(LedgerWrite {
                account: serde_json::to_vec(&account)?,
                entry: serde_json::to_vec(&entry)?,
            })
        })
    }

    pub fn marker(&self, marker: &str) -> Result<Option<String>> {
        self.inner.get_marker(marker)
    }

    pub fn get_entry(&self, entry_key: &str) -> Result<Option<LedgerEntry>> {
        match self.inner.get_entry_raw(entry_key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Entries of one account, oldest first.
    pub fn list_entries(&self, account_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for (_, bytes) in self.inner.list_entries_raw(account_id)? {
            entries.push(serde_json::from_slice(&bytes)?);
        }
        Ok(entries)
    }
}
