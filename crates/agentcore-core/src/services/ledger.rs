//! Credit ledger: admission, idempotent usage commits and compensating
//! refunds on top of the append-only ledger tables.

use agentcore_storage::LedgerApply;
use agentcore_traits::{Admission, CreditGate, Credits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Account, LedgerEntry, LedgerEntryType};
use crate::storage::AccountStorage;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Unknown reservation: {0}")]
    UnknownReservation(String),
    #[error("{entry_type} entries must be positive, got {amount}")]
    NonPositiveAmount { entry_type: String, amount: Credits },
    #[error("{0} entries are written by commit and refund only")]
    ReservedEntryType(String),
    #[error("Ledger store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
struct Reservation {
    account_id: String,
    created_at: DateTime<Utc>,
}

fn commit_marker(reservation_id: &str) -> String {
    format!("commit:{}", reservation_id)
}

fn refund_marker(reservation_id: &str) -> String {
    format!("refund:{}", reservation_id)
}

fn insufficient_credits_message(balance: Credits) -> String {
    format!(
        "Insufficient credits: your balance is ${}. Please add credits to continue.",
        balance
    )
}

pub struct CreditLedger {
    accounts: AccountStorage,
    reservations: DashMap<String, Reservation>,
}

impl CreditLedger {
    pub fn new(accounts: AccountStorage) -> Self {
        Self {
            accounts,
            reservations: DashMap::new(),
        }
    }

    /// Create the account with a zero balance unless it exists.
    pub fn ensure_account(&self, account_id: &str) -> Result<Account, LedgerError> {
        if let Some(account) = self.accounts.get_account(account_id)? {
            return Ok(account);
        }
        let account = Account::new(account_id);
        if self.accounts.create_account(&account)? {
            info!(account_id, "Created credit account");
            return Ok(account);
        }
        self.accounts
            .get_account(account_id)?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub fn account(&self, account_id: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self.accounts.get_account(account_id)?)
    }

    pub fn balance(&self, account_id: &str) -> Result<Credits, LedgerError> {
        Ok(self
            .accounts
            .get_account(account_id)?
            .map(|account| account.balance)
            .unwrap_or(Credits::ZERO))
    }

    pub fn entries(&self, account_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.accounts.list_entries(account_id)?)
    }

    /// Credit or adjust an account outside of a run.
    pub fn grant(
        &self,
        account_id: &str,
        amount: Credits,
        entry_type: LedgerEntryType,
        description: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        match entry_type {
            LedgerEntryType::Usage | LedgerEntryType::Refund => {
                return Err(LedgerError::ReservedEntryType(entry_type.as_str().to_string()));
            }
            LedgerEntryType::Grant | LedgerEntryType::Purchase if !amount.is_positive() => {
                return Err(LedgerError::NonPositiveAmount {
                    entry_type: entry_type.as_str().to_string(),
                    amount,
                });
            }
            _ => {}
        }
        self.ensure_account(account_id)?;

        let mut written = None;
        self.accounts.apply(account_id, None, |mut account, entry_key| {
            account.balance += amount;
            let entry = LedgerEntry {
                id: entry_key,
                account_id: account_id.to_string(),
                amount,
                entry_type,
                balance_after: account.balance,
                description: description.to_string(),
                reservation_id: None,
                metadata: Value::Object(Default::default()),
                created_at: Utc::now(),
            };
            written = Some(entry.clone());
            Ok((account, entry))
        })?;
        let entry = written.ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        info!(
            account_id,
            amount = %amount,
            entry_type = entry_type.as_str(),
            balance = %entry.balance_after,
            "Ledger entry written"
        );
        Ok(entry)
    }

    fn reserve_sync(&self, account_id: &str) -> Result<Admission, LedgerError> {
        let account = self.ensure_account(account_id)?;
        if !account.balance.is_positive() {
            debug!(account_id, balance = %account.balance, "Admission refused");
            return Ok(Admission {
                ok: false,
                message: Some(insufficient_credits_message(account.balance)),
                reservation_id: None,
                balance: account.balance,
            });
        }

        let reservation_id = uuid::Uuid::new_v4().to_string();
        self.reservations.insert(
            reservation_id.clone(),
            Reservation {
                account_id: account_id.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(Admission {
            ok: true,
            message: None,
            reservation_id: Some(reservation_id),
            balance: account.balance,
        })
    }

    fn commit_sync(
        &self,
        reservation_id: &str,
        actual_cost: Credits,
        metadata: Value,
    ) -> Result<Credits, LedgerError> {
        let marker = commit_marker(reservation_id);
        let Some(reservation) = self
            .reservations
            .get(reservation_id)
            .map(|entry| entry.value().clone())
        else {
            return self.balance_after_marker(reservation_id, &marker);
        };

        let description = match metadata.get("model").and_then(Value::as_str) {
            Some(model) => format!("Usage: {}", model),
            None => "Usage".to_string(),
        };
        let mut new_balance = None;
        let applied = self.accounts.apply(
            &reservation.account_id,
            Some(&marker),
            |mut account, entry_key| {
                let amount = -actual_cost.abs();
                account.balance += amount;
                new_balance = Some(account.balance);
                let entry = LedgerEntry {
                    id: entry_key,
                    account_id: reservation.account_id.clone(),
                    amount,
                    entry_type: LedgerEntryType::Usage,
                    balance_after: account.balance,
                    description,
                    reservation_id: Some(reservation_id.to_string()),
                    metadata,
                    created_at: Utc::now(),
                };
                Ok((account, entry))
            },
        );
        // A failed commit keeps the reservation so the caller can retry it
        // or release it with a refund.
        let applied = match applied {
            Ok(applied) => applied,
            Err(error) => {
                warn!(reservation_id, error = %error, "Usage commit failed");
                return Err(error.into());
            }
        };
        self.reservations.remove(reservation_id);

        match (applied, new_balance) {
            (LedgerApply::Applied { entry_key }, Some(balance)) => {
                debug!(
                    reservation_id,
                    entry_key = %entry_key,
                    cost = %actual_cost,
                    balance = %balance,
                    held_ms = (Utc::now() - reservation.created_at).num_milliseconds(),
                    "Usage committed"
                );
                Ok(balance)
            }
            _ => Ok(self.balance(&reservation.account_id)?),
        }
    }

    /// Balance of the account behind an already committed reservation.
    fn balance_after_marker(
        &self,
        reservation_id: &str,
        marker: &str,
    ) -> Result<Credits, LedgerError> {
        let entry = self
            .accounts
            .marker(marker)?
            .map(|entry_key| self.accounts.get_entry(&entry_key))
            .transpose()?
            .flatten()
            .ok_or_else(|| LedgerError::UnknownReservation(reservation_id.to_string()))?;
        self.balance(&entry.account_id)
    }

    fn refund_sync(&self, reservation_id: &str, reason: &str) -> Result<(), LedgerError> {
        let pending = self.reservations.remove(reservation_id);
        let committed_key = self.accounts.marker(&commit_marker(reservation_id))?;

        let Some(entry_key) = committed_key else {
            if pending.is_some() {
                info!(reservation_id, reason, "Reservation released without charge");
            } else {
                debug!(reservation_id, "Refund of unknown reservation ignored");
            }
            return Ok(());
        };

        let original = self
            .accounts
            .get_entry(&entry_key)?
            .ok_or_else(|| LedgerError::UnknownReservation(reservation_id.to_string()))?;
        let amount = original.amount.abs();
        let applied = self.accounts.apply(
            &original.account_id,
            Some(&refund_marker(reservation_id)),
            |mut account, refund_key| {
                account.balance += amount;
                let entry = LedgerEntry {
                    id: refund_key,
                    account_id: original.account_id.clone(),
                    amount,
                    entry_type: LedgerEntryType::Refund,
                    balance_after: account.balance,
                    description: format!("Refund of {}: {}", entry_key, reason),
                    reservation_id: Some(reservation_id.to_string()),
                    metadata: serde_json::json!({"refunded_entry": entry_key}),
                    created_at: Utc::now(),
                };
                Ok((account, entry))
            },
        )?;
        if let LedgerApply::Applied { .. } = applied {
            info!(reservation_id, amount = %amount, reason, "Committed usage refunded");
        }
        Ok(())
    }
}

#[async_trait]
impl CreditGate for CreditLedger {
    async fn get_balance(&self, account_id: &str) -> anyhow::Result<Credits> {
        Ok(self.balance(account_id)?)
    }

    async fn reserve(&self, account_id: &str) -> anyhow::Result<Admission> {
        Ok(self.reserve_sync(account_id)?)
    }

    async fn commit(
        &self,
        reservation_id: &str,
        actual_cost: Credits,
        metadata: Value,
    ) -> anyhow::Result<Credits> {
        Ok(self.commit_sync(reservation_id, actual_cost, metadata)?)
    }

    async fn refund(&self, reservation_id: &str, reason: &str) -> anyhow::Result<()> {
        Ok(self.refund_sync(reservation_id, reason)?)
    }
}
