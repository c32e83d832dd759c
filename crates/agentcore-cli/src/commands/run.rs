use std::io::Write;
use std::sync::Arc;

use agentcore_ai::{AgentConfig, RunEvent, StatusType};
use agentcore_core::{AgentCore, BusEntry, RunRequest};
use anyhow::{Result, anyhow, bail};
use colored::Colorize;
use comfy_table::Cell;
use futures::StreamExt;
use serde_json::json;
use tracing::warn;

use crate::cli::RunArgs;
use crate::commands::utils::{format_timestamp, short_id};
use crate::output::table::{new_table, print_table};
use crate::output::{OutputFormat, json::print_json, json::print_json_line};

pub async fn run(core: Arc<AgentCore>, args: RunArgs, format: OutputFormat) -> Result<()> {
    let llm = core.llm_client()?;

    let thread_id = match args.thread {
        Some(id) => {
            core.storage
                .threads
                .get_thread(&id)?
                .ok_or_else(|| anyhow!("Thread not found: {id}"))?;
            id
        }
        None => core.create_thread(&args.account, None, args.agent.clone())?.id,
    };
    let model = args
        .model
        .unwrap_or_else(|| core.config.llm.default_model.clone());
    let mut request = RunRequest::new(&thread_id, model).with_prompt(&args.prompt);
    if args.agent.is_some() || args.system_prompt.is_some() {
        request = request.with_agent_config(AgentConfig {
            agent_id: args.agent,
            system_prompt: args.system_prompt,
            ..Default::default()
        });
    }
    if let Some(max_iterations) = args.max_iterations {
        request = request.with_max_iterations(max_iterations);
    }

    let runs = core.run_manager(llm);
    let handle = runs.start_run(request)?;
    if !format.is_json() {
        println!(
            "{} run {} on thread {}",
            "Started".green().bold(),
            handle.run_id,
            thread_id
        );
    }

    // Ctrl+C stops the run instead of abandoning it.
    let interrupt = {
        let runs = runs.clone();
        let run_id = handle.run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok()
                && let Err(error) = runs.stop_run(&run_id, None)
            {
                warn!(run_id, error = %error, "Failed to stop run");
            }
        })
    };

    follow(&core, &handle.run_id, 0, format).await?;
    let outcome = handle.join.await?;
    interrupt.abort();

    if format.is_json() {
        return print_json(&json!({
            "run_id": handle.run_id,
            "thread_id": thread_id,
            "status": outcome.status.as_str(),
            "error": outcome.error,
            "iterations": outcome.iterations,
            "cost": outcome.total_cost.to_string(),
        }));
    }

    println!();
    println!(
        "{} {} after {} iteration(s), cost ${}",
        "Run".bold(),
        outcome.status.as_str(),
        outcome.iterations,
        outcome.total_cost
    );
    if let Some(error) = outcome.error {
        println!("{} {}", "Error:".red().bold(), error);
    }
    Ok(())
}

pub async fn tail(core: Arc<AgentCore>, run_id: &str, since: u64, format: OutputFormat) -> Result<()> {
    if core.storage.agent_runs.get(run_id)?.is_none() && core.bus.response_count(run_id)? == 0 {
        bail!("Agent run not found: {run_id}");
    }
    follow(&core, run_id, since, format).await?;
    if !format.is_json() {
        println!();
    }
    Ok(())
}

pub fn stop(
    core: Arc<AgentCore>,
    run_id: &str,
    error: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let run = core.stop_run(run_id, error)?;

    if format.is_json() {
        return print_json(&run);
    }
    println!("Run {} is {}", run.id, run.status.as_str().bold());
    Ok(())
}

pub fn list(core: Arc<AgentCore>, thread_id: &str, format: OutputFormat) -> Result<()> {
    let runs = core.storage.agent_runs.list_for_thread(thread_id)?;

    if format.is_json() {
        return print_json(&runs);
    }

    let mut table = new_table(&["ID", "Status", "Model", "Started", "Completed", "Error"]);
    for run in runs {
        table.add_row(vec![
            Cell::new(short_id(&run.id)),
            Cell::new(run.status.as_str()),
            Cell::new(run.model.as_deref().unwrap_or("-")),
            Cell::new(format_timestamp(Some(run.started_at))),
            Cell::new(format_timestamp(run.completed_at)),
            Cell::new(run.error.as_deref().unwrap_or("")),
        ]);
    }
    print_table(table)
}

/// Print bus entries from `since` until the run's stream ends.
async fn follow(core: &AgentCore, run_id: &str, since: u64, format: OutputFormat) -> Result<()> {
    let stream = core.bus.subscribe(run_id, since);
    futures::pin_mut!(stream);

    while let Some(entry) = stream.next().await {
        let entry = entry?;
        if format.is_json() {
            print_json_line(&json!({"index": entry.index, "event": entry.event}))?;
        } else {
            render(&entry)?;
        }
    }
    Ok(())
}

fn render(entry: &BusEntry) -> Result<()> {
    match &entry.event {
        RunEvent::Assistant { content } => {
            print!("{content}");
            std::io::stdout().flush()?;
        }
        RunEvent::Tool {
            name,
            success,
            content,
            error,
            ..
        } => {
            let mark = if *success { "ok".green() } else { "failed".red() };
            println!("\n{} {} {}", "tool".cyan(), name.bold(), mark);
            match error {
                Some(error) => println!("  {}", error.red()),
                None if !content.is_empty() => println!("  {}", content.dimmed()),
                None => {}
            }
        }
        RunEvent::Status {
            status_type,
            tool,
            message,
            ..
        } => {
            let label = match status_type {
                StatusType::ToolStarted => "tool_started".cyan(),
                StatusType::Error => "error".red(),
                StatusType::Stopped => "stopped".yellow(),
                StatusType::Completed => "completed".green(),
                StatusType::MaxIterationsReached => "max_iterations_reached".yellow(),
            };
            let detail = tool.as_deref().or(message.as_deref()).unwrap_or("");
            println!("\n[{}] {}", label, detail);
        }
        RunEvent::Usage {
            prompt_tokens,
            completion_tokens,
            model,
        } => {
            println!(
                "\n{}",
                format!("usage {model}: {prompt_tokens} in / {completion_tokens} out").dimmed()
            );
        }
    }
    Ok(())
}
