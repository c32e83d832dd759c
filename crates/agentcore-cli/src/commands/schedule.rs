use std::sync::Arc;

use agentcore_core::{AgentCore, Schedule, ScheduledTask};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use colored::Colorize;
use comfy_table::Cell;

use crate::cli::{Frequency, ScheduleAddArgs, ScheduleCommands};
use crate::commands::utils::{format_timestamp, parse_time_of_day, parse_weekday, short_id};
use crate::output::table::{new_table, print_table};
use crate::output::{OutputFormat, json::print_json};

pub fn run(core: Arc<AgentCore>, command: ScheduleCommands, format: OutputFormat) -> Result<()> {
    match command {
        ScheduleCommands::List { account } => list(&core, account.as_deref(), format),
        ScheduleCommands::Add(args) => add(&core, args, format),
        ScheduleCommands::Pause { id } => pause(&core, &id, format),
        ScheduleCommands::Resume { id } => resume(&core, &id, format),
        ScheduleCommands::Delete { id } => delete(&core, &id, format),
    }
}

fn list(core: &AgentCore, account: Option<&str>, format: OutputFormat) -> Result<()> {
    let tasks = match account {
        Some(account) => core.storage.scheduled_tasks.list_for_account(account)?,
        None => core.storage.scheduled_tasks.list()?,
    };

    if format.is_json() {
        return print_json(&tasks);
    }

    let mut table = new_table(&["ID", "Account", "Agent", "Schedule", "Next Run", "Last Run", "Active"]);
    for task in tasks {
        let active = if task.is_active {
            "yes".green()
        } else {
            "paused".yellow()
        };
        table.add_row(vec![
            Cell::new(short_id(&task.id)),
            Cell::new(&task.account_id),
            Cell::new(&task.agent_id),
            Cell::new(task.schedule.describe()),
            Cell::new(format_timestamp(Some(task.next_run_at))),
            Cell::new(format_timestamp(task.last_run_at)),
            Cell::new(active.to_string()),
        ]);
    }
    print_table(table)
}

fn add(core: &AgentCore, args: ScheduleAddArgs, format: OutputFormat) -> Result<()> {
    let schedule = build_schedule(&args)?;
    core.ledger.ensure_account(&args.account)?;

    let mut task = ScheduledTask::new(&args.account, &args.agent, schedule, Utc::now())?;
    if let Some(prompt) = args.prompt {
        task = task.with_prompt(prompt);
    }
    if let Some(thread_id) = args.thread {
        core.storage
            .threads
            .get_thread(&thread_id)?
            .ok_or_else(|| anyhow!("Thread not found: {thread_id}"))?;
        task = task.with_thread(thread_id);
    }
    task.model = args.model;
    core.storage.scheduled_tasks.put(&task)?;

    if format.is_json() {
        return print_json(&task);
    }
    println!(
        "{} task {} ({}), next run {}",
        "Created".green().bold(),
        task.id,
        task.schedule.describe(),
        format_timestamp(Some(task.next_run_at))
    );
    Ok(())
}

fn build_schedule(args: &ScheduleAddArgs) -> Result<Schedule> {
    let time_of_day = || -> Result<_> {
        let at = args
            .at
            .as_deref()
            .context("--at HH:MM is required for this schedule")?;
        parse_time_of_day(at)
    };

    let schedule = match args.every {
        Frequency::Hourly => Schedule::Hourly {
            minute_of_hour: args.minute,
        },
        Frequency::Daily => Schedule::Daily {
            time_of_day: time_of_day()?,
        },
        Frequency::Weekly => Schedule::Weekly {
            time_of_day: time_of_day()?,
            days_of_week: args
                .days
                .iter()
                .map(|day| parse_weekday(day))
                .collect::<Result<Vec<_>>>()?,
        },
        Frequency::Monthly => Schedule::Monthly {
            time_of_day: time_of_day()?,
            day_of_month: args
                .day_of_month
                .context("--day-of-month is required for monthly schedules")?,
        },
    };
    schedule.validate()?;
    Ok(schedule)
}

fn pause(core: &AgentCore, id: &str, format: OutputFormat) -> Result<()> {
    let task = core
        .storage
        .scheduled_tasks
        .update(id, |task| {
            task.pause();
            Ok(())
        })?
        .ok_or_else(|| anyhow!("Scheduled task not found: {id}"))?;
    report(&task, "Paused", format)
}

fn resume(core: &AgentCore, id: &str, format: OutputFormat) -> Result<()> {
    let now = Utc::now();
    let task = core
        .storage
        .scheduled_tasks
        .update(id, |task| Ok(task.resume(now)?))?
        .ok_or_else(|| anyhow!("Scheduled task not found: {id}"))?;
    report(&task, "Resumed", format)
}

fn delete(core: &AgentCore, id: &str, format: OutputFormat) -> Result<()> {
    let deleted = core.storage.scheduled_tasks.delete(id)?;
    if !deleted {
        return Err(anyhow!("Scheduled task not found: {id}"));
    }
    if format.is_json() {
        return print_json(&serde_json::json!({ "id": id, "deleted": true }));
    }
    println!("{} task {}", "Deleted".green().bold(), id);
    Ok(())
}

fn report(task: &ScheduledTask, verb: &str, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        return print_json(task);
    }
    println!(
        "{} task {}, next run {}",
        verb.green().bold(),
        task.id,
        format_timestamp(Some(task.next_run_at))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn args(every: Frequency) -> ScheduleAddArgs {
        ScheduleAddArgs {
            account: "acct".into(),
            agent: "agent".into(),
            prompt: None,
            every,
            at: Some("09:30".into()),
            minute: 0,
            days: vec![],
            day_of_month: None,
            thread: None,
            model: None,
        }
    }

    #[test]
    fn test_build_weekly_schedule() {
        let mut weekly = args(Frequency::Weekly);
        weekly.days = vec!["mon".into(), "3".into()];
        assert_eq!(
            build_schedule(&weekly).unwrap(),
            Schedule::Weekly {
                time_of_day: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                days_of_week: vec![1, 3],
            }
        );
    }

    #[test]
    fn test_build_schedule_rejects_missing_fields() {
        assert!(build_schedule(&args(Frequency::Weekly)).is_err());
        assert!(build_schedule(&args(Frequency::Monthly)).is_err());

        let mut daily = args(Frequency::Daily);
        daily.at = None;
        assert!(build_schedule(&daily).is_err());

        let mut hourly = args(Frequency::Hourly);
        hourly.minute = 60;
        assert!(build_schedule(&hourly).is_err());
    }
}
