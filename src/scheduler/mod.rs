//! The Executor: the tick loop that discovers ready tasks in a project's
//! current wave, claims them atomically, and dispatches them to the
//! [`Lifecycle`](crate::lifecycle::Lifecycle) under a concurrency bound.
//! Grounded on the LoopManager's poll-and-spawn/semaphore/graceful-shutdown
//! shape, generalized from "one loop per spec" to "one wave-gated scheduler
//! per executing project".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::budget::{pricing, BudgetManager};
use crate::config::ExecutorConfig;
use crate::domain::{ModelTier, Project, ProjectStatus, Task, TaskStatus};
use crate::error::Result;
use crate::lifecycle::{Lifecycle, RetryAfterMap};
use crate::progress::ProgressBus;
use crate::resource::{resource_for_tier, ResourceMonitor};
use crate::store::{project_repo, task_repo, Store};

/// Rough token budget used to size a pre-dispatch reservation; trued up
/// against actual usage once the Lifecycle records real spend.
const EST_TASK_INPUT_TOKENS: i64 = 4_000;
const EST_TASK_OUTPUT_TOKENS: i64 = 4_000;

/// Trial reservation used purely to probe whether a project's budget has
/// any headroom left this tick; always released immediately after.
const BUDGET_PROBE_EPSILON: f64 = 0.0001;

/// How often the dispatch-drain loop in `stop` polls the in-flight set.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Executor {
    store: Arc<Store>,
    budget: Arc<BudgetManager>,
    progress: Arc<ProgressBus>,
    resources: Arc<ResourceMonitor>,
    lifecycle: Arc<Lifecycle>,
    config: ExecutorConfig,
    retry_after: RetryAfterMap,
    semaphore: Arc<Semaphore>,
    /// Task ids currently dispatched to a Lifecycle driver, keyed to their
    /// spawned handle. Prevents double dispatch and lets `stop` wait for
    /// (then abort) in-flight work.
    dispatched: Mutex<HashMap<String, JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    started: AtomicBool,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        budget: Arc<BudgetManager>,
        progress: Arc<ProgressBus>,
        resources: Arc<ResourceMonitor>,
        lifecycle: Arc<Lifecycle>,
        config: ExecutorConfig,
        retry_after: RetryAfterMap,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks as usize));
        Self {
            store,
            budget,
            progress,
            resources,
            lifecycle,
            config,
            retry_after,
            semaphore,
            dispatched: Mutex::new(HashMap::new()),
            ticker: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Recover tasks stale from a previous process lifetime, then spawn the
    /// periodic tick loop. A no-op if already started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let recovered = self.store.with_conn(|conn| task_repo::recover_stale_tasks(conn, self.config.stale_task_threshold_secs))?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "executor: recovered stale tasks on start");
        }

        let (tx, rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().expect("executor shutdown-tx mutex poisoned") = Some(tx);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_ticker(rx).await });
        *self.ticker.lock().expect("executor ticker mutex poisoned") = Some(handle);
        Ok(())
    }

    async fn run_ticker(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "executor: tick failed, continuing next period");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("executor: ticker received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Stop the ticker, wait up to `grace` for in-flight tasks to finish on
    /// their own, then abort anything still running and reset it to
    /// `pending`. Clears all in-memory tracking state (dispatch set,
    /// retry-after map).
    pub async fn stop(&self, grace: Duration) {
        if let Some(tx) = self.shutdown_tx.lock().expect("executor shutdown-tx mutex poisoned").take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.ticker.lock().expect("executor ticker mutex poisoned").take() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.dispatched.lock().expect("executor dispatch mutex poisoned").iter().filter(|(_, h)| !h.is_finished()).count();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let stragglers: Vec<(String, JoinHandle<()>)> =
            self.dispatched.lock().expect("executor dispatch mutex poisoned").drain().collect();
        for (task_id, handle) in stragglers {
            if !handle.is_finished() {
                handle.abort();
                if let Err(e) = self.store.with_conn(|conn| task_repo::interrupt_for_shutdown(conn, &task_id)) {
                    tracing::error!(task_id = %task_id, error = %e, "executor: failed to reset task during shutdown");
                }
            }
        }

        self.retry_after.lock().expect("retry-after mutex poisoned").clear();
        self.started.store(false, Ordering::SeqCst);
    }

    /// One cycle of the scheduler: examine every `executing` project and
    /// advance it by at most one dispatch round. A failure on one project
    /// is logged and does not prevent the others from being examined this
    /// tick.
    async fn tick(&self) -> Result<()> {
        let projects = self.store.with_conn(project_repo::executing_projects)?;
        for project in projects {
            if let Err(e) = self.tick_project(&project).await {
                tracing::error!(project_id = %project.id, error = %e, "executor: tick failed for project");
            }
        }
        Ok(())
    }

    async fn tick_project(&self, project: &Project) -> Result<()> {
        if !self.budget.reserve(BUDGET_PROBE_EPSILON).await? {
            self.store.with_conn(|conn| project_repo::update_project_status(conn, &project.id, ProjectStatus::Paused))?;
            self.progress.push(&project.id, "budget_warning", "budget exhausted, pausing project", None, json!({}))?;
            return Ok(());
        }
        self.budget.release(BUDGET_PROBE_EPSILON).await;

        self.store.with_conn(|conn| task_repo::unblock_ready(conn, &project.id))?;

        let current_wave = self.store.with_conn(|conn| task_repo::current_wave(conn, &project.id))?;

        if let Some(wave) = current_wave {
            let ready = self.store.with_conn(|conn| task_repo::ready_tasks(conn, &project.id, wave))?;
            for task in ready {
                self.maybe_dispatch(project, task).await?;
            }

            if self.config.wave_checkpoints_enabled {
                let remaining = self.store.with_conn(|conn| task_repo::non_terminal_count_at_wave(conn, &project.id, wave))?;
                let max_wave = self.store.with_conn(|conn| task_repo::max_wave(conn, &project.id))?;
                if remaining == 0 && wave < max_wave {
                    self.store.with_conn(|conn| project_repo::update_project_status(conn, &project.id, ProjectStatus::Paused))?;
                    self.progress.push(
                        &project.id,
                        "wave_checkpoint",
                        &format!("wave {wave} complete, paused for review"),
                        None,
                        json!({"wave": wave}),
                    )?;
                    return Ok(());
                }
            }
        }

        if self.store.with_conn(|conn| task_repo::all_terminal(conn, &project.id))? {
            let failed = self.store.with_conn(|conn| task_repo::has_failed_tasks(conn, &project.id))?;
            let status = if failed { ProjectStatus::Failed } else { ProjectStatus::Completed };
            self.store.with_conn(|conn| project_repo::update_project_status(conn, &project.id, status))?;
            let event_type = if failed { "project_failed" } else { "project_complete" };
            self.progress.push(&project.id, event_type, "project reached a terminal state", None, json!({}))?;
            return Ok(());
        }

        if self.store.with_conn(|conn| task_repo::has_dead_blocked_tasks(conn, &project.id))? {
            self.store.with_conn(|conn| project_repo::update_project_status(conn, &project.id, ProjectStatus::Failed))?;
            self.progress.push(
                &project.id,
                "project_failed",
                "project cannot progress: blocked tasks with no path to completion",
                None,
                json!({}),
            )?;
        }

        Ok(())
    }

    /// Attempt to dispatch one ready task. Any skip (resource offline,
    /// budget refused, backoff pending, no concurrency slot, lost the claim
    /// race) leaves the task `pending` for a later tick to retry.
    async fn maybe_dispatch(&self, project: &Project, task: Task) -> Result<()> {
        if let Some(&retry_at) = self.retry_after.lock().expect("retry-after mutex poisoned").get(&task.id) {
            if retry_at > chrono::Utc::now() {
                return Ok(());
            }
        }

        if !self.resources.is_available(resource_for_tier(task.model_tier)) {
            return Ok(());
        }

        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Ok(());
        };

        let paid = task.model_tier.is_paid();
        let cost = estimated_cost(task.model_tier);

        if paid {
            if !self.budget.reserve(cost).await? {
                return Ok(());
            }
            if !self.budget.can_spend_project(&project.id, cost)? || !self.budget.reserve_project(&project.id, cost).await? {
                self.budget.release(cost).await;
                return Ok(());
            }
        }

        if self.dispatched.lock().expect("executor dispatch mutex poisoned").contains_key(&task.id) {
            self.release_reservation(&project.id, paid, cost).await;
            return Ok(());
        }

        let claimed = self.store.with_conn(|conn| task_repo::claim_pending_to_queued(conn, &task.id))?;
        if !claimed {
            // Another tick already claimed this task between our read and our CAS attempt.
            self.release_reservation(&project.id, paid, cost).await;
            return Ok(());
        }

        let lifecycle = self.lifecycle.clone();
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            lifecycle.run_task(&task_id, cost).await;
        });

        let task_id = task.id.clone();
        self.dispatched.lock().expect("executor dispatch mutex poisoned").insert(task_id.clone(), handle);
        self.reap_finished(&task_id);
        Ok(())
    }

    async fn release_reservation(&self, project_id: &str, paid: bool, cost: f64) {
        if paid {
            self.budget.release(cost).await;
            self.budget.release_project(project_id, cost).await;
        }
    }

    /// Opportunistically prune the dispatch set of handles that already
    /// finished, so it doesn't grow unbounded across many ticks. Run after
    /// every successful dispatch rather than on a separate timer - the
    /// event loop has no background reaper, by design (see spec's
    /// shared-resource policy: dispatch-tracking is touched only from the
    /// event loop).
    fn reap_finished(&self, just_inserted: &str) {
        let mut dispatched = self.dispatched.lock().expect("executor dispatch mutex poisoned");
        dispatched.retain(|id, handle| id == just_inserted || !handle.is_finished());
    }

    /// Number of tasks currently tracked as in-flight. Exposed for tests and
    /// admin/diagnostic surfaces.
    pub fn in_flight_count(&self) -> usize {
        self.dispatched.lock().expect("executor dispatch mutex poisoned").len()
    }
}

fn estimated_cost(tier: ModelTier) -> f64 {
    pricing::estimate_task_cost(tier, EST_TASK_INPUT_TOKENS, EST_TASK_OUTPUT_TOKENS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{LocalAgent, RemoteAgent};
    use crate::config::{BudgetConfig, LlmConfig};
    use crate::domain::{Plan, PlanOutput, TaskStatus};
    use crate::lifecycle::new_retry_after_map;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, StopReason, StreamChunk, TokenUsage};
    use crate::store::{plan_repo, project_repo};
    use crate::tools::ToolExecutor;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::sync::mpsc as tmpsc;

    struct AlwaysOkLlm;

    #[async_trait]
    impl LlmClient for AlwaysOkLlm {
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: Some("done".to_string()),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage { input_tokens: 50, output_tokens: 10, ..Default::default() },
            })
        }

        async fn stream(
            &self,
            request: CompletionRequest,
            _chunk_tx: tmpsc::Sender<StreamChunk>,
        ) -> std::result::Result<CompletionResponse, LlmError> {
            self.complete(request).await
        }
    }

    fn harness() -> (Arc<Executor>, Arc<Store>, Project) {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = Project::new("Widget app", "build a widget");
        let mut executing = project.clone();
        executing.status = ProjectStatus::Executing;
        store.with_conn(|conn| project_repo::create_project(conn, &executing)).unwrap();

        let budget = Arc::new(BudgetManager::new(
            store.clone(),
            BudgetConfig { daily_limit_usd: 1000.0, monthly_limit_usd: 1000.0, project_limit_usd: 1000.0, warning_threshold: 0.8 },
        ));
        let progress = Arc::new(ProgressBus::new(store.clone()));
        let resources = Arc::new(ResourceMonitor::new(&LlmConfig::default()));
        resources.force_status(crate::resource::LOCAL, crate::resource::Status::Online);
        resources.force_status(crate::resource::REMOTE, crate::resource::Status::Online);
        let llm: Arc<dyn LlmClient> = Arc::new(AlwaysOkLlm);
        let tools = Arc::new(ToolExecutor::empty());
        let remote_agent = Arc::new(RemoteAgent::new(llm.clone(), tools, budget.clone(), PathBuf::from("/tmp/forge-executor-test"), 4096));
        let local_agent = Arc::new(LocalAgent::from_config(&LlmConfig::default()).unwrap());
        let exec_config = ExecutorConfig { tick_interval_ms: 20, verification_enabled: false, ..ExecutorConfig::default() };
        let retry_after = new_retry_after_map();
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            budget.clone(),
            progress.clone(),
            llm,
            remote_agent,
            local_agent,
            exec_config.clone(),
            retry_after.clone(),
        ));

        let executor = Arc::new(Executor::new(store.clone(), budget, progress, resources, lifecycle, exec_config, retry_after));
        (executor, store, executing)
    }

    fn make_plan_with_task(store: &Store, project: &Project, title: &str, tier: ModelTier) -> Task {
        let plan = Plan::new(project.id.clone(), 1, PlanOutput::default(), 1);
        store.with_conn(|conn| plan_repo::create_plan(conn, &plan)).unwrap();
        let task = Task::new(&project.id, &plan.id, title, "do it", "code", tier, 1);
        store.with_conn(|conn| task_repo::create_task(conn, &task)).unwrap();
        task
    }

    #[tokio::test]
    async fn s1_diamond_dag_advances_through_waves_to_completion() {
        let (executor, store, project) = harness();
        let plan = Plan::new(project.id.clone(), 1, PlanOutput::default(), 1);
        store.with_conn(|conn| plan_repo::create_plan(conn, &plan)).unwrap();

        let mut a = Task::new(&project.id, &plan.id, "A", "d", "code", ModelTier::Ollama, 1);
        let mut b = Task::new(&project.id, &plan.id, "B", "d", "code", ModelTier::Ollama, 1);
        let mut c = Task::new(&project.id, &plan.id, "C", "d", "code", ModelTier::Ollama, 1);
        let mut d = Task::new(&project.id, &plan.id, "D", "d", "code", ModelTier::Ollama, 1);
        b.wave = 1;
        c.wave = 1;
        d.wave = 2;
        store
            .with_conn(|conn| {
                task_repo::create_task(conn, &a)?;
                task_repo::create_task(conn, &b)?;
                task_repo::create_task(conn, &c)?;
                task_repo::create_task(conn, &d)?;
                task_repo::add_dependency(conn, &b.id, &a.id)?;
                task_repo::add_dependency(conn, &c.id, &a.id)?;
                task_repo::add_dependency(conn, &d.id, &b.id)?;
                task_repo::add_dependency(conn, &d.id, &c.id)?;
                task_repo::mark_blocked(conn, &project.id)
            })
            .unwrap();
        a.wave = 0;

        for _ in 0..8 {
            executor.tick().await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            let proj = store.with_conn(|conn| project_repo::get_project(conn, &project.id)).unwrap();
            if proj.status.is_terminal() {
                break;
            }
        }

        let final_project = store.with_conn(|conn| project_repo::get_project(conn, &project.id)).unwrap();
        assert_eq!(final_project.status, ProjectStatus::Completed);

        for id in [&a.id, &b.id, &c.id, &d.id] {
            let t = store.with_conn(|conn| task_repo::get_task(conn, id)).unwrap();
            assert_eq!(t.status, TaskStatus::Completed, "task {} should be completed", t.title);
        }
    }

    #[tokio::test]
    async fn dead_blocked_project_is_marked_failed() {
        let (executor, store, project) = harness();
        let plan = Plan::new(project.id.clone(), 1, PlanOutput::default(), 1);
        store.with_conn(|conn| plan_repo::create_plan(conn, &plan)).unwrap();

        let a = Task::new(&project.id, &plan.id, "A", "d", "code", ModelTier::Ollama, 1);
        let mut b = Task::new(&project.id, &plan.id, "B", "d", "code", ModelTier::Ollama, 1);
        b.wave = 1;
        store
            .with_conn(|conn| {
                task_repo::create_task(conn, &a)?;
                task_repo::create_task(conn, &b)?;
                task_repo::add_dependency(conn, &b.id, &a.id)?;
                task_repo::mark_blocked(conn, &project.id)?;
                task_repo::set_status(conn, &a.id, TaskStatus::Failed)
            })
            .unwrap();

        executor.tick().await.unwrap();

        let final_project = store.with_conn(|conn| project_repo::get_project(conn, &project.id)).unwrap();
        assert_eq!(final_project.status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn claimed_task_is_skipped_by_a_second_tick() {
        let (executor, store, project) = harness();
        let task = make_plan_with_task(&store, &project, "Solo", ModelTier::Ollama);

        // Pre-claim as if a previous tick already grabbed it.
        store.with_conn(|conn| task_repo::claim_pending_to_queued(conn, &task.id)).unwrap();

        executor.tick().await.unwrap();

        // The task is already `queued`, not `pending`, so `ready_tasks` never
        // surfaces it and no second Lifecycle driver is spawned.
        assert_eq!(executor.in_flight_count(), 0);
        let reloaded = store.with_conn(|conn| task_repo::get_task(conn, &task.id)).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn start_and_stop_resets_interrupted_tasks() {
        let (executor, store, project) = harness();
        let _task = make_plan_with_task(&store, &project, "Slow", ModelTier::Ollama);

        executor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.stop(Duration::from_millis(50)).await;

        // Whatever state the task ended up in, the executor must not still
        // consider it in-flight, and no panics/hangs should occur on stop.
        assert_eq!(executor.in_flight_count(), 0);
        let _ = project;
    }
}
