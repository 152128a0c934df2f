//! CLI command definitions and subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// forged - task orchestration engine for LLM-planned work
#[derive(Parser)]
#[command(
    name = "forged",
    about = "Plans, decomposes, and executes AI task graphs under a budget",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Database and workspaces default to ./.forge/"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Create, list, and inspect projects
    Project {
        #[command(subcommand)]
        action: ProjectCommand,
    },

    /// Generate and decompose plans
    Plan {
        #[command(subcommand)]
        action: PlanCommand,
    },

    /// Inspect a project's tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },

    /// List and resolve outstanding checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommand,
    },

    /// Inspect spend against daily/monthly/project limits
    Budget {
        #[command(subcommand)]
        action: BudgetCommand,
    },

    /// Run the executor
    Executor {
        #[command(subcommand)]
        action: ExecutorCommand,
    },

    /// Print a project's event log
    Events {
        /// Project id
        project_id: String,

        /// Restrict to one task's events
        #[arg(long)]
        task_id: Option<String>,

        /// Most recent N events (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Create a new draft project
    New {
        /// Short project title
        title: String,

        /// Freeform requirements text (or use --requirements-file)
        #[arg(required_unless_present = "requirements_file")]
        requirements: Option<String>,

        /// Read requirements from a file instead of the command line
        #[arg(long, conflicts_with = "requirements")]
        requirements_file: Option<PathBuf>,
    },

    /// List known projects, optionally filtered by status
    List {
        /// Filter by status (draft, planning, ready, executing, paused, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one project's detail
    Show {
        project_id: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
pub enum PlanCommand {
    /// Generate a draft plan for a project with one LLM call
    Generate { project_id: String },

    /// Validate and decompose an approved-draft plan into tasks
    Decompose { project_id: String, plan_id: String },

    /// Show a plan's structure
    Show {
        plan_id: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// List a project's tasks, grouped by wave
    List {
        project_id: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List unresolved checkpoints for a project
    List { project_id: String },

    /// Resolve a checkpoint with a human decision
    Resolve {
        checkpoint_id: String,

        /// retry, skip, or fail
        action: CheckpointActionArg,

        /// Extra guidance folded into the retried task's context
        #[arg(long)]
        guidance: Option<String>,
    },
}

#[derive(Clone, Copy, Debug)]
pub enum CheckpointActionArg {
    Retry,
    Skip,
    Fail,
}

impl std::str::FromStr for CheckpointActionArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("unknown checkpoint action: {s}. use: retry, skip, or fail")),
        }
    }
}

#[derive(Subcommand)]
pub enum BudgetCommand {
    /// Current daily/monthly spend against configured limits
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Aggregate usage, optionally scoped to one project
    Usage {
        #[arg(long)]
        project: Option<String>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
pub enum ExecutorCommand {
    /// Move a project to executing and run the tick loop until it reaches
    /// a terminal state (or the optional timeout elapses)
    Run {
        project_id: String,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Run the tick loop over every executing project until interrupted
    Daemon,
}

/// Output format for list/show commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {s}. Use: text or json")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
