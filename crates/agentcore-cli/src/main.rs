mod cli;
mod commands;
mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentcore_core::{AgentCore, CoreConfig};
use anyhow::Result;
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output on stdout stays clean.
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = CoreConfig::load_from_path(Path::new(path))?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => CoreConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.database_path = Some(PathBuf::from(db_path));
    }

    let core = Arc::new(AgentCore::open(config)?);
    commands::run(core, cli.command, cli.format).await
}
