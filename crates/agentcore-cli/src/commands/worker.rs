use std::sync::Arc;

use agentcore_core::AgentCore;
use anyhow::Result;
use colored::Colorize;
use tracing::info;

pub async fn run(core: Arc<AgentCore>) -> Result<()> {
    let llm = core.llm_client()?;
    let worker = core.start_worker(llm);

    println!(
        "{} worker {} (tick every {}s). Press Ctrl+C to stop.",
        "Started".green().bold(),
        core.instance_id(),
        core.config.scheduler.tick_secs
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down worker");
    worker.shutdown().await?;
    println!("{}", "Worker stopped".dimmed());
    Ok(())
}
