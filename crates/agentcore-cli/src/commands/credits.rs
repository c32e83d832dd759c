use std::sync::Arc;

use agentcore_core::{AgentCore, LedgerEntryType};
use agentcore_traits::Credits;
use anyhow::{Result, anyhow};
use colored::Colorize;
use comfy_table::Cell;
use serde_json::json;

use crate::cli::CreditsCommands;
use crate::commands::utils::format_timestamp;
use crate::output::table::{new_table, print_table};
use crate::output::{OutputFormat, json::print_json};

pub fn run(core: Arc<AgentCore>, command: CreditsCommands, format: OutputFormat) -> Result<()> {
    match command {
        CreditsCommands::Balance { account } => balance(&core, &account, format),
        CreditsCommands::Grant {
            account,
            amount,
            entry_type,
            description,
        } => grant(&core, &account, &amount, &entry_type, &description, format),
        CreditsCommands::History { account, limit } => history(&core, &account, limit, format),
        CreditsCommands::Accounts => accounts(&core, format),
    }
}

fn balance(core: &AgentCore, account_id: &str, format: OutputFormat) -> Result<()> {
    let account = core
        .ledger
        .account(account_id)?
        .ok_or_else(|| anyhow!("Account not found: {account_id}"))?;

    if format.is_json() {
        return print_json(&json!({
            "account_id": account.id,
            "tier": account.tier,
            "balance": account.balance.to_string(),
        }));
    }

    let balance = format!("${}", account.balance);
    let balance = if account.balance.is_positive() {
        balance.green()
    } else {
        balance.red()
    };
    println!("Account: {}", account.id);
    println!("Tier:    {}", account.tier);
    println!("Balance: {}", balance.bold());
    Ok(())
}

fn grant(
    core: &AgentCore,
    account_id: &str,
    amount: &str,
    entry_type: &str,
    description: &str,
    format: OutputFormat,
) -> Result<()> {
    let amount: Credits = amount.parse().map_err(|e: String| anyhow!(e))?;
    let entry_type: LedgerEntryType = entry_type.parse().map_err(|e: String| anyhow!(e))?;
    let entry = core.ledger.grant(account_id, amount, entry_type, description)?;

    if format.is_json() {
        return print_json(&entry);
    }
    println!(
        "{} {} ${} to {} (balance ${})",
        "Recorded".green().bold(),
        entry.entry_type.as_str(),
        entry.amount,
        account_id,
        entry.balance_after
    );
    Ok(())
}

fn history(
    core: &AgentCore,
    account_id: &str,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let mut entries = core.ledger.entries(account_id)?;
    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if format.is_json() {
        return print_json(&entries);
    }

    let mut table = new_table(&["Time", "Type", "Amount", "Balance", "Description"]);
    for entry in entries {
        table.add_row(vec![
            Cell::new(format_timestamp(Some(entry.created_at))),
            Cell::new(entry.entry_type.as_str()),
            Cell::new(format!("{}", entry.amount)),
            Cell::new(format!("{}", entry.balance_after)),
            Cell::new(entry.description),
        ]);
    }
    print_table(table)
}

fn accounts(core: &AgentCore, format: OutputFormat) -> Result<()> {
    let accounts = core.storage.accounts.list_accounts()?;

    if format.is_json() {
        return print_json(&accounts);
    }

    let mut table = new_table(&["Account", "Tier", "Balance", "Created"]);
    for account in accounts {
        table.add_row(vec![
            Cell::new(account.id),
            Cell::new(account.tier.to_string()),
            Cell::new(format!("{}", account.balance)),
            Cell::new(format_timestamp(Some(account.created_at))),
        ]);
    }
    print_table(table)
}
