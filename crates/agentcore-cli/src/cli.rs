use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "agentcore")]
#[command(version, about = "AgentCore - metered agent runs, streams and schedules")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (defaults to ~/.local/share/agentcore/agentcore.db)
    #[arg(long, global = true, env = "AGENTCORE_DB_PATH")]
    pub db_path: Option<String>,

    /// Config file (defaults to ~/.config/agentcore/config.toml)
    #[arg(long, global = true, env = "AGENTCORE_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Run the scheduler and bus sweeper until interrupted
    Worker,

    /// Append a prompt to a thread and run the agent on it
    Run(RunArgs),

    /// Replay and follow the event stream of a run
    Tail {
        run_id: String,

        /// Start from this response index
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Stop a running agent run
    Stop {
        run_id: String,

        /// Record the run as failed with this message
        #[arg(long)]
        error: Option<String>,
    },

    /// Show runs of a thread
    Runs { thread_id: String },

    /// Credit accounts and ledger
    Credits {
        #[command(subcommand)]
        command: CreditsCommands,
    },

    /// Scheduled tasks
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Prompt appended as a user message
    pub prompt: String,

    /// Account that pays for the run
    #[arg(long, default_value = "default")]
    pub account: String,

    /// Existing thread to continue (a new thread is created when absent)
    #[arg(long)]
    pub thread: Option<String>,

    /// Model name or alias (defaults to the configured model)
    #[arg(long)]
    pub model: Option<String>,

    /// Agent identifier stored on the thread
    #[arg(long)]
    pub agent: Option<String>,

    /// System prompt of the agent
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Maximum reasoning iterations
    #[arg(long)]
    pub max_iterations: Option<usize>,
}

#[derive(Subcommand)]
pub enum CreditsCommands {
    /// Show the balance of an account
    Balance { account: String },

    /// Add credits to an account
    Grant {
        account: String,

        /// Dollar amount, e.g. 5 or 0.25 (adjustments may be negative)
        #[arg(allow_hyphen_values = true)]
        amount: String,

        /// Entry type: grant, purchase or adjustment
        #[arg(long = "type", default_value = "grant")]
        entry_type: String,

        #[arg(long, default_value = "Manual grant")]
        description: String,
    },

    /// List ledger entries of an account
    History {
        account: String,

        /// Show only the most recent entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List accounts
    Accounts,
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// List scheduled tasks
    List {
        /// Only tasks of this account
        #[arg(long)]
        account: Option<String>,
    },

    /// Create a scheduled task
    Add(ScheduleAddArgs),

    /// Pause a scheduled task
    Pause { id: String },

    /// Resume a paused task from the next slot
    Resume { id: String },

    /// Delete a scheduled task
    Delete { id: String },
}

#[derive(Args)]
pub struct ScheduleAddArgs {
    /// Account that owns the task
    #[arg(long)]
    pub account: String,

    /// Agent identifier
    #[arg(long)]
    pub agent: String,

    /// Prompt appended on each firing
    #[arg(long)]
    pub prompt: Option<String>,

    /// hourly, daily, weekly or monthly
    #[arg(long, value_enum)]
    pub every: Frequency,

    /// Time of day in UTC (HH:MM)
    #[arg(long)]
    pub at: Option<String>,

    /// Minute of the hour for hourly tasks
    #[arg(long, default_value_t = 0)]
    pub minute: u32,

    /// Weekdays for weekly tasks, e.g. mon,wed or 1,3
    #[arg(long, value_delimiter = ',')]
    pub days: Vec<String>,

    /// Day of the month for monthly tasks
    #[arg(long)]
    pub day_of_month: Option<u32>,

    /// Thread to append to (created on first firing when absent)
    #[arg(long)]
    pub thread: Option<String>,

    /// Model name or alias
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}
