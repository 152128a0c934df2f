//! Orchestrator configuration types and loading.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration for the `forged` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Budget limits and warning threshold
    pub budget: BudgetConfig,

    /// Executor tick/concurrency/recovery settings
    pub executor: ExecutorConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, project-local
    /// `.forge.yml`, user config dir, built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".forge.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("forge").join("forge.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Model identifier used for planning and remote agent calls
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Base URL for the local inference backend (ollama-style HTTP API)
    #[serde(rename = "local-base-url")]
    pub local_base_url: String,

    /// Model name passed to the local inference backend
    #[serde(rename = "local-model")]
    pub local_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
            local_base_url: "http://localhost:11434".to_string(),
            local_model: "qwen2.5-coder:14b".to_string(),
        }
    }
}

/// Budget limits enforced by the Budget Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Daily spend limit in USD, across all projects
    #[serde(rename = "daily-limit-usd")]
    pub daily_limit_usd: f64,

    /// Monthly spend limit in USD, across all projects
    #[serde(rename = "monthly-limit-usd")]
    pub monthly_limit_usd: f64,

    /// Default per-project spend limit in USD
    #[serde(rename = "project-limit-usd")]
    pub project_limit_usd: f64,

    /// Fraction of a limit at which `is_warning` trips
    #[serde(rename = "warning-threshold")]
    pub warning_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 50.0,
            monthly_limit_usd: 500.0,
            project_limit_usd: 25.0,
            warning_threshold: 0.8,
        }
    }
}

/// Executor concurrency, polling cadence, and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum tasks dispatched concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: u32,

    /// Tick interval in milliseconds
    #[serde(rename = "tick-interval-ms")]
    pub tick_interval_ms: u64,

    /// Default maximum retries per task before checkpointing/failing
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Age (seconds) after which a `running`/`queued` task is considered stale on startup
    #[serde(rename = "stale-task-threshold-secs")]
    pub stale_task_threshold_secs: u64,

    /// Grace period (seconds) given to in-flight tasks on shutdown
    #[serde(rename = "shutdown-grace-secs")]
    pub shutdown_grace_secs: u64,

    /// Pause the project for human review at each wave boundary
    #[serde(rename = "wave-checkpoints-enabled")]
    pub wave_checkpoints_enabled: bool,

    /// Raise a Checkpoint instead of failing outright once retries are exhausted
    #[serde(rename = "checkpointing-enabled")]
    pub checkpointing_enabled: bool,

    /// Run a cheap-model verification pass over paid-tier task output
    #[serde(rename = "verification-enabled")]
    pub verification_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            tick_interval_ms: 2_000,
            max_retries: 3,
            stale_task_threshold_secs: 300,
            shutdown_grace_secs: 30,
            wave_checkpoints_enabled: false,
            checkpointing_enabled: true,
            verification_enabled: true,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: String,

    /// Run pending migrations on startup
    #[serde(rename = "run-migrations")]
    pub run_migrations: bool,

    /// Root directory under which each project gets its own workspace
    /// subdirectory for tool-sandboxed file access
    #[serde(rename = "workspace-root")]
    pub workspace_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: ".forge/forge.db".to_string(),
            run_migrations: true,
            workspace_root: ".forge/workspaces".to_string(),
        }
    }
}
