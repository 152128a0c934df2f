//! Task Lifecycle: the per-task state machine driven once the Executor has
//! claimed a task into `queued`. Owns the retry-after map (dispatch gating
//! for transient failures) and drives every terminal transition - normal
//! completion plus optional verification, transient-error backoff, permanent
//! failure, checkpoint creation, context forwarding, and checkpoint
//! resolution. Grounded on the Executor/Lifecycle split in the source
//! scheduler, generalized from its single-event-loop retry bookkeeping to a
//! mutex-guarded map shared across concurrently dispatched task drivers.

mod verifier;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::agents::{LocalAgent, RemoteAgent};
use crate::budget::BudgetManager;
use crate::config::ExecutorConfig;
use crate::domain::{Attempt, Checkpoint, CheckpointType, ContextEntry, Task, TaskStatus};
use crate::error::Result;
use crate::llm::{LlmClient, LlmError};
use crate::progress::ProgressBus;
use crate::store::{checkpoint_repo, event_repo, task_repo, Store};

/// Shared dispatch-gating state: task id -> earliest retry time. Written by
/// the Lifecycle on a transient failure, read by the Executor's per-tick
/// dispatch loop before it claims a `pending` task.
pub type RetryAfterMap = Arc<Mutex<HashMap<String, DateTime<Utc>>>>;

pub fn new_retry_after_map() -> RetryAfterMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// How many characters of a completed task's output survive into a
/// successor's `dependency_output` context entry.
const DEPENDENCY_OUTPUT_TRUNCATE: usize = 2000;

/// Human action taken on an unresolved checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAction {
    Retry,
    Skip,
    Fail,
}

pub struct Lifecycle {
    store: Arc<Store>,
    budget: Arc<BudgetManager>,
    progress: Arc<ProgressBus>,
    llm: Arc<dyn LlmClient>,
    remote_agent: Arc<RemoteAgent>,
    local_agent: Arc<LocalAgent>,
    config: ExecutorConfig,
    retry_after: RetryAfterMap,
}

impl Lifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        budget: Arc<BudgetManager>,
        progress: Arc<ProgressBus>,
        llm: Arc<dyn LlmClient>,
        remote_agent: Arc<RemoteAgent>,
        local_agent: Arc<LocalAgent>,
        config: ExecutorConfig,
        retry_after: RetryAfterMap,
    ) -> Self {
        Self { store, budget, progress, llm, remote_agent, local_agent, config, retry_after }
    }

    /// Drive a single claimed (`queued`) task to its next terminal or
    /// retry-pending state. `reserved_cost` is the amount the Executor
    /// already reserved against the budget before dispatch; this call is
    /// responsible for either recording real spend (releasing the estimate
    /// as a side effect) or releasing it outright on failure. Any
    /// unexpected error is logged rather than propagated - a failure in the
    /// Lifecycle itself must not take down the tick loop that spawned it.
    pub async fn run_task(&self, task_id: &str, reserved_cost: f64) {
        if let Err(e) = self.run_task_inner(task_id, reserved_cost).await {
            tracing::error!(task_id, error = %e, "lifecycle: error driving task");
        }
    }

    async fn run_task_inner(&self, task_id: &str, reserved_cost: f64) -> Result<()> {
        if !self.store.with_conn(|conn| task_repo::start_running(conn, task_id))? {
            tracing::warn!(task_id, "lifecycle: task was not queued, skipping");
            return Ok(());
        }
        let task = self.store.with_conn(|conn| task_repo::get_task(conn, task_id))?;
        self.progress.push(
            &task.project_id,
            "task_started",
            &format!("running: {}", task.title),
            Some(&task.id),
            serde_json::json!({}),
        )?;

        let paid = task.model_tier.is_paid();
        let result = if paid { self.remote_agent.run(&task, reserved_cost).await } else { self.local_agent.run(&task).await };

        match result {
            Ok(output) => self.handle_completion(&task, output, paid).await,
            Err(e) => {
                if paid {
                    self.budget.release(reserved_cost).await;
                    self.budget.release_project(&task.project_id, reserved_cost).await;
                }
                if e.is_retryable() {
                    self.handle_transient_error(&task, &e)
                } else {
                    self.handle_permanent_error(&task, e.to_string())
                }
            }
        }
    }

    async fn handle_completion(&self, task: &Task, output: crate::agents::AgentOutput, paid: bool) -> Result<()> {
        self.store.with_conn(|conn| {
            task_repo::record_output(
                conn,
                &task.id,
                output.output.as_deref(),
                &output.artifacts,
                output.prompt_tokens,
                output.completion_tokens,
                output.cost_usd,
                &output.model_used,
            )
        })?;

        if paid {
            self.budget
                .record(output.cost_usd, output.prompt_tokens, output.completion_tokens, "anthropic", &output.model_used, "execute", &task.project_id, Some(&task.id))
                .await?;
        }

        let output_text = output.output.unwrap_or_default();

        if paid && self.config.verification_enabled {
            match verifier::verify(self.llm.as_ref(), task, &output_text).await {
                Ok(verifier::VerificationOutcome::Passed) => {}
                Ok(verifier::VerificationOutcome::GapsFound { feedback }) if task.retry_count < self.config.max_retries => {
                    self.store.with_conn(|conn| {
                        task_repo::push_context(conn, &task.id, &ContextEntry::new("verification_feedback", feedback.clone()))?;
                        task_repo::increment_retry(conn, &task.id)?;
                        task_repo::set_status(conn, &task.id, TaskStatus::Pending)
                    })?;
                    self.progress.push(
                        &task.project_id,
                        "task_retry",
                        "verification found gaps, retrying",
                        Some(&task.id),
                        serde_json::json!({"feedback": feedback}),
                    )?;
                    return Ok(());
                }
                Ok(verifier::VerificationOutcome::GapsFound { feedback }) => {
                    self.store.with_conn(|conn| task_repo::set_status(conn, &task.id, TaskStatus::NeedsReview))?;
                    self.progress.push(
                        &task.project_id,
                        "task_needs_review",
                        "verification found gaps with no retries remaining",
                        Some(&task.id),
                        serde_json::json!({"feedback": feedback}),
                    )?;
                    return Ok(());
                }
                Ok(verifier::VerificationOutcome::HumanNeeded { feedback }) => {
                    self.store.with_conn(|conn| task_repo::set_status(conn, &task.id, TaskStatus::NeedsReview))?;
                    self.progress.push(
                        &task.project_id,
                        "task_needs_review",
                        "verifier flagged for human review",
                        Some(&task.id),
                        serde_json::json!({"feedback": feedback}),
                    )?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "verifier call failed, coercing to skipped");
                }
            }
        }

        self.store.with_conn(|conn| task_repo::set_status(conn, &task.id, TaskStatus::Completed))?;
        self.progress.push(&task.project_id, "task_complete", "task completed", Some(&task.id), serde_json::json!({}))?;
        self.forward_context(task, &output_text)?;
        Ok(())
    }

    /// Append a `dependency_output` context entry to every direct successor,
    /// so a downstream task sees this one's result without re-prompting the
    /// planner.
    fn forward_context(&self, task: &Task, output_text: &str) -> Result<()> {
        let dependents = self.store.with_conn(|conn| task_repo::dependents_of(conn, &task.id))?;
        if dependents.is_empty() {
            return Ok(());
        }

        let payload = serde_json::json!({
            "source_task_id": task.id,
            "title": task.title,
            "output": truncate(output_text, DEPENDENCY_OUTPUT_TRUNCATE),
        })
        .to_string();
        let entry = ContextEntry::new("dependency_output", payload);

        self.store.with_conn(|conn| {
            for dep_id in &dependents {
                task_repo::push_context(conn, dep_id, &entry)?;
            }
            Ok(())
        })
    }

    fn handle_permanent_error(&self, task: &Task, message: String) -> Result<()> {
        self.store.with_conn(|conn| {
            task_repo::set_error(conn, &task.id, &message)?;
            task_repo::set_status(conn, &task.id, TaskStatus::Failed)
        })?;
        self.progress.push(&task.project_id, "task_failed", &message, Some(&task.id), serde_json::json!({}))?;
        Ok(())
    }

    fn handle_transient_error(&self, task: &Task, err: &LlmError) -> Result<()> {
        let message = err.to_string();
        self.progress.push(
            &task.project_id,
            "task_retry_attempt",
            &message,
            Some(&task.id),
            serde_json::json!({"retry_count": task.retry_count, "error": message}),
        )?;

        if task.retry_count < self.config.max_retries {
            let delay = backoff_delay(task.retry_count);
            let retry_at = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
            self.retry_after.lock().expect("retry-after mutex poisoned").insert(task.id.clone(), retry_at);

            self.store.with_conn(|conn| {
                task_repo::increment_retry(conn, &task.id)?;
                task_repo::set_error(conn, &task.id, &message)?;
                task_repo::set_status(conn, &task.id, TaskStatus::Pending)
            })?;
            return Ok(());
        }

        self.retry_after.lock().expect("retry-after mutex poisoned").remove(&task.id);

        if self.config.checkpointing_enabled {
            let attempts = self.gather_attempts(&task.id)?;
            let mut checkpoint = Checkpoint::new(
                &task.project_id,
                &task.id,
                CheckpointType::RetryExhausted,
                format!("{} failed attempt(s), most recently: {message}", attempts.len().max(1)),
                "Retry, skip, or fail this task?",
            );
            checkpoint.attempts = attempts;
            self.store.with_conn(|conn| {
                checkpoint_repo::create_checkpoint(conn, &checkpoint)?;
                task_repo::set_status(conn, &task.id, TaskStatus::NeedsReview)
            })?;
            self.progress.push(
                &task.project_id,
                "checkpoint_raised",
                "retries exhausted, human input needed",
                Some(&task.id),
                serde_json::json!({"checkpoint_id": checkpoint.id}),
            )?;
        } else {
            self.store.with_conn(|conn| {
                task_repo::set_error(conn, &task.id, &message)?;
                task_repo::set_status(conn, &task.id, TaskStatus::Failed)
            })?;
            self.progress.push(&task.project_id, "task_failed", "retries exhausted", Some(&task.id), serde_json::json!({}))?;
        }
        Ok(())
    }

    fn gather_attempts(&self, task_id: &str) -> Result<Vec<Attempt>> {
        let events = self.store.with_conn(|conn| event_repo::list_for_task(conn, task_id))?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_type == "task_retry_attempt")
            .map(|e| Attempt {
                retry_count: e.data.get("retry_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                error: e.data.get("error").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                at: e.created_at,
            })
            .collect())
    }

    /// Resolve an unresolved checkpoint: `retry` resets the task to
    /// `pending` (clearing output/error/retry_count) and appends a
    /// `checkpoint_guidance` context entry if guidance was given; `skip`
    /// cancels the task; `fail` fails it outright.
    pub fn resolve_checkpoint(&self, checkpoint_id: &str, action: CheckpointAction, guidance: Option<&str>) -> Result<()> {
        let checkpoint = self.store.with_conn(|conn| checkpoint_repo::get_checkpoint(conn, checkpoint_id))?;

        let response = match action {
            CheckpointAction::Retry => guidance.map(|g| format!("retry: {g}")).unwrap_or_else(|| "retry".to_string()),
            CheckpointAction::Skip => "skip".to_string(),
            CheckpointAction::Fail => "fail".to_string(),
        };

        self.store.with_conn(|conn| {
            checkpoint_repo::resolve_checkpoint(conn, checkpoint_id, &response)?;
            match action {
                CheckpointAction::Retry => {
                    task_repo::reset_for_retry(conn, &checkpoint.task_id)?;
                    if let Some(guidance) = guidance {
                        task_repo::push_context(conn, &checkpoint.task_id, &ContextEntry::new("checkpoint_guidance", guidance.to_string()))?;
                    }
                    Ok(())
                }
                CheckpointAction::Skip => task_repo::set_status(conn, &checkpoint.task_id, TaskStatus::Cancelled),
                CheckpointAction::Fail => task_repo::set_status(conn, &checkpoint.task_id, TaskStatus::Failed),
            }
        })?;

        self.retry_after.lock().expect("retry-after mutex poisoned").remove(&checkpoint.task_id);

        self.progress.push(
            &checkpoint.project_id,
            "checkpoint_resolved",
            "checkpoint resolved",
            Some(&checkpoint.task_id),
            serde_json::json!({"action": format!("{action:?}")}),
        )?;
        Ok(())
    }
}

/// `min(5 * 2^retry_count + uniform(0,2), 120)` seconds, where `retry_count`
/// is the count *before* this attempt's increment.
fn backoff_delay(retry_count: u32) -> f64 {
    let base = 5.0 * 2f64.powi(retry_count as i32);
    let jitter: f64 = rand::rng().random_range(0.0..2.0);
    (base + jitter).min(120.0)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{LocalAgent, RemoteAgent};
    use crate::config::BudgetConfig;
    use crate::domain::{ModelTier, Plan, PlanOutput, Project};
    use crate::llm::{CompletionResponse, StopReason, StreamChunk, TokenUsage};
    use crate::store::{plan_repo, project_repo};
    use crate::tools::ToolExecutor;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        responses: Mutex<Vec<std::result::Result<&'static str, LlmError>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            match responses.remove(0) {
                Ok(text) => Ok(CompletionResponse {
                    content: Some(text.to_string()),
                    tool_calls: vec![],
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage { input_tokens: 100, output_tokens: 20, ..Default::default() },
                }),
                Err(e) => Err(e),
            }
        }

        async fn stream(&self, request: CompletionRequest, _chunk_tx: mpsc::Sender<StreamChunk>) -> std::result::Result<CompletionResponse, LlmError> {
            self.complete(request).await
        }
    }

    use crate::llm::CompletionRequest;

    struct Fixture {
        store: Arc<Store>,
        progress: Arc<ProgressBus>,
        project: Project,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = Project::new("Widget app", "build a widget");
        store.with_conn(|conn| project_repo::create_project(conn, &project)).unwrap();
        let progress = Arc::new(ProgressBus::new(store.clone()));
        Fixture { store, progress, project }
    }

    fn lifecycle(fixture: &Fixture, llm: Arc<dyn LlmClient>, config: ExecutorConfig, retry_after: RetryAfterMap) -> Lifecycle {
        let budget = Arc::new(BudgetManager::new(
            fixture.store.clone(),
            BudgetConfig { daily_limit_usd: 1000.0, monthly_limit_usd: 1000.0, project_limit_usd: 1000.0, warning_threshold: 0.8 },
        ));
        let tools = Arc::new(ToolExecutor::empty());
        let remote_agent = Arc::new(RemoteAgent::new(llm.clone(), tools, budget.clone(), PathBuf::from("/tmp/forge-lifecycle-test"), 4096));
        let local_agent = Arc::new(LocalAgent::from_config(&crate::config::LlmConfig::default()).unwrap());
        Lifecycle::new(fixture.store.clone(), budget, fixture.progress.clone(), llm, remote_agent, local_agent, config, retry_after)
    }

    fn make_task(fixture: &Fixture, title: &str) -> Task {
        let plan = Plan::new(fixture.project.id.clone(), 1, PlanOutput::default(), 1);
        fixture.store.with_conn(|conn| plan_repo::create_plan(conn, &plan)).unwrap();
        let task = Task::new(&fixture.project.id, &plan.id, title, "do the thing", "code", ModelTier::Haiku, 1);
        fixture.store.with_conn(|conn| task_repo::create_task(conn, &task)).unwrap();
        fixture.store.with_conn(|conn| task_repo::claim_pending_to_queued(conn, &task.id)).unwrap();
        task
    }

    #[tokio::test]
    async fn s2_transient_error_schedules_backoff_retry() {
        let fixture = fixture();
        let task = make_task(&fixture, "Flaky task");
        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm { responses: Mutex::new(vec![Err(LlmError::ApiError { status: 500, message: "boom".into() })]), calls: AtomicUsize::new(0) });
        let config = ExecutorConfig { max_retries: 3, verification_enabled: false, ..ExecutorConfig::default() };
        let retry_after = new_retry_after_map();
        let lc = lifecycle(&fixture, llm, config, retry_after.clone());

        let before = Utc::now();
        lc.run_task(&task.id, 0.01).await;

        let reloaded = fixture.store.with_conn(|conn| task_repo::get_task(conn, &task.id)).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert_eq!(reloaded.retry_count, 1);

        let map = retry_after.lock().unwrap();
        let scheduled = *map.get(&task.id).expect("retry-after entry present");
        let delta = (scheduled - before).num_milliseconds() as f64 / 1000.0;
        assert!((5.0..=7.5).contains(&delta), "expected ~5-7s backoff, got {delta}");
    }

    #[tokio::test]
    async fn s5_checkpoint_retry_resets_task_and_records_guidance() {
        let fixture = fixture();
        let task = make_task(&fixture, "Hard task");
        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm { responses: Mutex::new(vec![Err(LlmError::ApiError { status: 500, message: "still down".into() })]), calls: AtomicUsize::new(0) });
        // max_retries = 0 so the very first failure exhausts retries immediately.
        let config = ExecutorConfig { max_retries: 0, checkpointing_enabled: true, verification_enabled: false, ..ExecutorConfig::default() };
        let retry_after = new_retry_after_map();
        let lc = lifecycle(&fixture, llm, config, retry_after);

        lc.run_task(&task.id, 0.01).await;

        let reloaded = fixture.store.with_conn(|conn| task_repo::get_task(conn, &task.id)).unwrap();
        assert_eq!(reloaded.status, TaskStatus::NeedsReview);

        let checkpoint = fixture.store.with_conn(|conn| checkpoint_repo::unresolved_for_task(conn, &task.id)).unwrap().expect("checkpoint raised");
        assert_eq!(checkpoint.checkpoint_type, CheckpointType::RetryExhausted);
        assert!(!checkpoint.attempts.is_empty());

        lc.resolve_checkpoint(&checkpoint.id, CheckpointAction::Retry, Some("try X")).unwrap();

        let resolved = fixture.store.with_conn(|conn| checkpoint_repo::get_checkpoint(conn, &checkpoint.id)).unwrap();
        assert!(resolved.is_resolved());

        let reloaded = fixture.store.with_conn(|conn| task_repo::get_task(conn, &task.id)).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert_eq!(reloaded.retry_count, 0);
        assert!(reloaded.error.is_none());
        let guidance_entry = reloaded.context.iter().find(|e| e.kind == "checkpoint_guidance").expect("guidance entry present");
        assert!(guidance_entry.content.contains("try X"));
    }

    #[tokio::test]
    async fn s6_context_forwarding_appends_dependency_output() {
        let fixture = fixture();
        let a = make_task(&fixture, "A");
        let plan_id = a.plan_id.clone();
        let mut b = Task::new(&fixture.project.id, &plan_id, "B", "depends on A", "code", ModelTier::Haiku, 1);
        b.wave = 1;
        fixture.store.with_conn(|conn| task_repo::create_task(conn, &b)).unwrap();
        fixture.store.with_conn(|conn| task_repo::add_dependency(conn, &b.id, &a.id)).unwrap();

        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm { responses: Mutex::new(vec![Ok("hello")]), calls: AtomicUsize::new(0) });
        let config = ExecutorConfig { verification_enabled: false, ..ExecutorConfig::default() };
        let lc = lifecycle(&fixture, llm, config, new_retry_after_map());

        lc.run_task(&a.id, 0.01).await;

        let reloaded_a = fixture.store.with_conn(|conn| task_repo::get_task(conn, &a.id)).unwrap();
        assert_eq!(reloaded_a.status, TaskStatus::Completed);
        assert_eq!(reloaded_a.output_text.as_deref(), Some("hello"));

        let reloaded_b = fixture.store.with_conn(|conn| task_repo::get_task(conn, &b.id)).unwrap();
        let forwarded = reloaded_b.context.iter().find(|e| e.kind == "dependency_output").expect("dependency_output entry present");
        assert!(forwarded.content.contains(&a.id));
        assert!(forwarded.content.contains("hello"));
    }

    #[tokio::test]
    async fn permanent_error_fails_task_without_retry() {
        let fixture = fixture();
        let task = make_task(&fixture, "Bad request task");
        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm { responses: Mutex::new(vec![Err(LlmError::ApiError { status: 400, message: "bad request".into() })]), calls: AtomicUsize::new(0) });
        let config = ExecutorConfig { verification_enabled: false, ..ExecutorConfig::default() };
        let lc = lifecycle(&fixture, llm, config, new_retry_after_map());

        lc.run_task(&task.id, 0.01).await;

        let reloaded = fixture.store.with_conn(|conn| task_repo::get_task(conn, &task.id)).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Failed);
        assert!(reloaded.error.as_deref().unwrap().contains("bad request"));
    }
}
