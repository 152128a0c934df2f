//! forged - composition root. Wires storage, budget, progress, resources,
//! agents, and the executor together, then dispatches the parsed CLI
//! command against them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};

use forge_orchestrator::budget::BudgetManager;
use forge_orchestrator::cli::{
    BudgetCommand, CheckpointActionArg, CheckpointCommand, Cli, Command, ExecutorCommand, OutputFormat, PlanCommand,
    ProjectCommand, TaskCommand,
};
use forge_orchestrator::config::Config;
use forge_orchestrator::decomposer;
use forge_orchestrator::domain::{Project, ProjectStatus};
use forge_orchestrator::lifecycle::{new_retry_after_map, CheckpointAction, Lifecycle};
use forge_orchestrator::planner::Planner;
use forge_orchestrator::progress::ProgressBus;
use forge_orchestrator::resource::ResourceMonitor;
use forge_orchestrator::store::{checkpoint_repo, plan_repo, project_repo, task_repo};
use forge_orchestrator::{llm, Executor, Store};

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    tracing::info!(provider = %config.llm.provider, model = %config.llm.model, "forged starting");

    let store = Arc::new(Store::init(&config.storage.db_path, config.storage.run_migrations)?);
    let budget = Arc::new(BudgetManager::new(store.clone(), config.budget.clone()));
    let progress = Arc::new(ProgressBus::new(store.clone()));
    let resources = Arc::new(ResourceMonitor::new(&config.llm));
    resources.check_all().await;

    let llm_client = llm::create_client(&config.llm).context("failed to create LLM client")?;
    let tools = Arc::new(forge_orchestrator::tools::ToolExecutor::standard());
    let workspace_root = PathBuf::from(&config.storage.workspace_root);
    let remote_agent = Arc::new(forge_orchestrator::agents::RemoteAgent::new(
        llm_client.clone(),
        tools,
        budget.clone(),
        workspace_root,
        config.llm.max_tokens,
    ));
    let local_agent = Arc::new(forge_orchestrator::agents::LocalAgent::from_config(&config.llm)?);
    let retry_after = new_retry_after_map();

    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        budget.clone(),
        progress.clone(),
        llm_client.clone(),
        remote_agent,
        local_agent,
        config.executor.clone(),
        retry_after.clone(),
    ));
    let planner = Planner::new(store.clone(), budget.clone(), llm_client.clone(), config.llm.model.clone());

    match cli.command {
        None => {
            println!("forged v{}", env!("CARGO_PKG_VERSION"));
            println!("  LLM: {} ({})", config.llm.provider, config.llm.model);
            println!("  Database: {}", config.storage.db_path);
            println!("Run `forged --help` for a list of commands.");
        }

        Some(Command::Project { action }) => match action {
            ProjectCommand::New { title, requirements, requirements_file } => {
                let requirements = match requirements_file {
                    Some(path) => std::fs::read_to_string(&path).context("failed to read requirements file")?,
                    None => requirements.unwrap_or_default(),
                };
                let project = Project::new(title, requirements);
                store.with_conn(|conn| project_repo::create_project(conn, &project))?;
                progress.push(&project.id, "project_created", "project created", None, serde_json::json!({}))?;
                println!("created project {}", project.id);
            }
            ProjectCommand::List { status, format } => {
                let status = status.as_deref().and_then(ProjectStatus::from_str);
                let projects = store.with_conn(|conn| project_repo::list_projects(conn, status))?;
                print_projects(&projects, &format);
            }
            ProjectCommand::Show { project_id, format } => {
                let project = store.with_conn(|conn| project_repo::get_project(conn, &project_id))?;
                print_project(&project, &format);
            }
        },

        Some(Command::Plan { action }) => match action {
            PlanCommand::Generate { project_id } => {
                let plan = planner.generate(&project_id).await?;
                println!("generated plan {} (v{}), {} task(s)", plan.id, plan.version, plan.output.flatten().len());
            }
            PlanCommand::Decompose { project_id, plan_id } => {
                let tasks = decomposer::decompose(&store, &project_id, &plan_id)?;
                println!("decomposed into {} task(s) across {} wave(s)", tasks.len(), tasks.iter().map(|t| t.wave).max().unwrap_or(0) + 1);
            }
            PlanCommand::Show { plan_id, format } => {
                let plan = store.with_conn(|conn| plan_repo::get_plan(conn, &plan_id))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan.output)?),
                    OutputFormat::Text => {
                        println!("plan {} (v{}, {})", plan.id, plan.version, plan.status.as_str());
                        println!("{}", plan.output.summary);
                        for (phase, task) in plan.output.flatten() {
                            let phase = phase.map(|p| format!("[{p}] ")).unwrap_or_default();
                            println!("  {phase}{} ({}/{})", task.title, task.task_type, task.complexity);
                        }
                    }
                }
            }
        },

        Some(Command::Task { action }) => match action {
            TaskCommand::List { project_id, format } => {
                let project = store.with_conn(|conn| project_repo::get_project(conn, &project_id))?;
                let plan = store.with_conn(|conn| plan_repo::latest_plan(conn, &project_id))?;
                let mut tasks = store.with_conn(|conn| task_repo::list_tasks_by_plan(conn, &plan.id))?;
                tasks.sort_by_key(|t| (t.wave, t.priority));
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
                    OutputFormat::Text => {
                        println!("{} ({})", project.title, project.status);
                        for task in &tasks {
                            println!("  wave {} [{}] {} - {}", task.wave, task.model_tier.as_str(), task.title, task.status);
                        }
                    }
                }
            }
        },

        Some(Command::Checkpoint { action }) => match action {
            CheckpointCommand::List { project_id } => {
                let checkpoints = store.with_conn(|conn| checkpoint_repo::unresolved_for_project(conn, &project_id))?;
                if checkpoints.is_empty() {
                    println!("no unresolved checkpoints");
                }
                for cp in checkpoints {
                    println!("{} [{}] task {}: {}", cp.id, cp.checkpoint_type.as_str(), cp.task_id, cp.question);
                }
            }
            CheckpointCommand::Resolve { checkpoint_id, action, guidance } => {
                let action = match action {
                    CheckpointActionArg::Retry => CheckpointAction::Retry,
                    CheckpointActionArg::Skip => CheckpointAction::Skip,
                    CheckpointActionArg::Fail => CheckpointAction::Fail,
                };
                lifecycle.resolve_checkpoint(&checkpoint_id, action, guidance.as_deref())?;
                println!("resolved checkpoint {checkpoint_id}");
            }
        },

        Some(Command::Budget { action }) => match action {
            BudgetCommand::Status { format } => {
                let status = budget.status().await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                    OutputFormat::Text => {
                        println!(
                            "daily:   ${:.2} / ${:.2}{}",
                            status.daily.spent_usd + status.daily.reserved_usd,
                            status.daily.limit_usd,
                            if status.daily.warning { "  (warning)" } else { "" }
                        );
                        println!(
                            "monthly: ${:.2} / ${:.2}{}",
                            status.monthly.spent_usd + status.monthly.reserved_usd,
                            status.monthly.limit_usd,
                            if status.monthly.warning { "  (warning)" } else { "" }
                        );
                    }
                }
            }
            BudgetCommand::Usage { project, format } => {
                let summary = budget.summary(project.as_deref())?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                    OutputFormat::Text => {
                        println!("total: ${:.4} across {} call(s)", summary.total_cost_usd, summary.api_call_count);
                        for (model, usage) in &summary.by_model {
                            println!("  {model}: ${:.4} ({} calls)", usage.cost_usd, usage.calls);
                        }
                    }
                }
            }
        },

        Some(Command::Executor { action }) => match action {
            ExecutorCommand::Run { project_id, timeout_secs } => {
                store.with_conn(|conn| project_repo::update_project_status(conn, &project_id, ProjectStatus::Executing))?;

                let executor = Arc::new(Executor::new(
                    store.clone(),
                    budget.clone(),
                    progress.clone(),
                    resources.clone(),
                    lifecycle.clone(),
                    config.executor.clone(),
                    retry_after.clone(),
                ));
                executor.start().await?;

                let deadline = timeout_secs.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
                loop {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let project = store.with_conn(|conn| project_repo::get_project(conn, &project_id))?;
                    if project.status.is_terminal() {
                        break;
                    }
                    if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                        tracing::warn!(project_id, "executor run: timed out waiting for terminal state");
                        break;
                    }
                }
                executor.stop(Duration::from_secs(config.executor.shutdown_grace_secs)).await;

                let project = store.with_conn(|conn| project_repo::get_project(conn, &project_id))?;
                println!("project {} is now {}", project.id, project.status);
            }

            ExecutorCommand::Daemon => {
                let background_resources = resources.clone();
                tokio::spawn(async move { background_resources.run_background(Duration::from_secs(30)).await });

                let executor = Arc::new(Executor::new(
                    store.clone(),
                    budget.clone(),
                    progress.clone(),
                    resources.clone(),
                    lifecycle.clone(),
                    config.executor.clone(),
                    retry_after.clone(),
                ));
                executor.start().await?;
                tracing::info!("executor daemon running, press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
                tracing::info!("shutting down");
                executor.stop(Duration::from_secs(config.executor.shutdown_grace_secs)).await;
            }
        },

        Some(Command::Events { project_id, task_id, limit }) => {
            let events = progress.get(&project_id, task_id.as_deref(), limit)?;
            for event in events {
                println!("[{}] {} {}", event.created_at.to_rfc3339(), event.event_type, event.message);
            }
        }
    }

    Ok(())
}

fn print_projects(projects: &[Project], format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(projects) {
                println!("{json}");
            }
        }
        OutputFormat::Text => {
            for project in projects {
                println!("{}  {}  {}", project.id, project.status, project.title);
            }
        }
    }
}

fn print_project(project: &Project, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(project) {
                println!("{json}");
            }
        }
        OutputFormat::Text => {
            println!("{} ({})", project.title, project.status);
            println!("id: {}", project.id);
            println!("requirements:\n{}", project.requirements);
        }
    }
}
