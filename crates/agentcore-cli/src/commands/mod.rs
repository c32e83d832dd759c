pub mod credits;
pub mod run;
pub mod schedule;
pub mod utils;
pub mod worker;

use std::sync::Arc;

use agentcore_core::AgentCore;
use anyhow::Result;

use crate::cli::Commands;
use crate::output::OutputFormat;

pub async fn run(core: Arc<AgentCore>, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Worker => worker::run(core).await,
        Commands::Run(args) => run::run(core, args, format).await,
        Commands::Tail { run_id, since } => run::tail(core, &run_id, since, format).await,
        Commands::Stop { run_id, error } => run::stop(core, &run_id, error, format),
        Commands::Runs { thread_id } => run::list(core, &thread_id, format),
        Commands::Credits { command } => credits::run(core, command, format),
        Commands::Schedule { command } => schedule::run(core, command, format),
        // Handled in main before the core is opened.
        Commands::Completions { .. } => Ok(()),
    }
}
