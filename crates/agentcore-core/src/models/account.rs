//! Credit accounts and ledger entries.

use std::fmt;
use std::str::FromStr;

use agentcore_traits::Credits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Billing tier. Serialized as `free` or `tier_<n>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccountTier {
    #[default]
    Free,
    Paid(u8),
}

impl fmt::Display for AccountTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountTier::Free => f.write_str("free"),
            AccountTier::Paid(level) => write!(f, "tier_{level}"),
        }
    }
}

impl FromStr for AccountTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "free" {
            return Ok(AccountTier::Free);
        }
        value
            .strip_prefix("tier_")
            .and_then(|level| level.parse::<u8>().ok())
            .filter(|level| *level > 0)
            .map(AccountTier::Paid)
            .ok_or_else(|| format!("Unknown account tier: {value}"))
    }
}

impl TryFrom<String> for AccountTier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccountTier> for String {
    fn from(tier: AccountTier) -> Self {
        tier.to_string()
    }
}

/// Materialized view of an account's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub tier: AccountTier,
    /// Always the sum of the account's ledger amounts.
    pub balance: Credits,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: AccountTier::Free,
            balance: Credits::ZERO,
            subscription_id: None,
            locale: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryType {
    Grant,
    Purchase,
    Usage,
    Refund,
    Adjustment,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Grant => "grant",
            LedgerEntryType::Purchase => "purchase",
            LedgerEntryType::Usage => "usage",
            LedgerEntryType::Refund => "refund",
            LedgerEntryType::Adjustment => "adjustment",
        }
    }
}

impl FromStr for LedgerEntryType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "grant" => Ok(LedgerEntryType::Grant),
            "purchase" => Ok(LedgerEntryType::Purchase),
            "usage" => Ok(LedgerEntryType::Usage),
            "refund" => Ok(LedgerEntryType::Refund),
            "adjustment" => Ok(LedgerEntryType::Adjustment),
            other => Err(format!("Unknown ledger entry type: {other}")),
        }
    }
}

/// One append-only ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Storage key, `{account_id}:{sequence}`.
    pub id: String,
    pub account_id: String,
    /// Signed; usage is negative.
    pub amount: Credits,
    pub entry_type: LedgerEntryType,
    pub balance_after: Credits,
    pub description: String,
    #[serde(default)]
    pub reservation_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_serialization() {
        assert_eq!(serde_json::to_string(&AccountTier::Free).unwrap(), "\"free\"");
        assert_eq!(serde_json::to_string(&AccountTier::Paid(2)).unwrap(), "\"tier_2\"");
        let tier: AccountTier = serde_json::from_str("\"tier_3\"").unwrap();
        assert_eq!(tier, AccountTier::Paid(3));
        assert!(serde_json::from_str::<AccountTier>("\"tier_0\"").is_err());
        assert!(serde_json::from_str::<AccountTier>("\"gold\"").is_err());
    }

    #[test]
    fn test_entry_type_parse() {
        assert_eq!("usage".parse::<LedgerEntryType>().unwrap(), LedgerEntryType::Usage);
        assert!("bonus".parse::<LedgerEntryType>().is_err());
    }
}
