//! One-shot LLM planning: turns a project's requirements into a structured
//! [`PlanOutput`], reserving and recording budget around a single completion
//! call. Grounded on the planner service's preamble/rigor-suffix prompt
//! scheme and balanced-brace JSON recovery.

mod prompt;

use std::sync::Arc;

use crate::budget::BudgetManager;
use crate::domain::{Plan, PlanOutput, PlanStatus, Project, ProjectStatus};
use crate::error::{OrchError, Result};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::store::{plan_repo, project_repo, Store};

pub use prompt::PlanningRigor;

/// Rough token budget used to size the pre-call reservation; the real
/// reservation is trued up against actual usage once the response returns.
const EST_INPUT_TOKENS: i64 = 2_000;
const EST_OUTPUT_TOKENS: i64 = 2_000;

pub struct Planner {
    store: Arc<Store>,
    budget: Arc<BudgetManager>,
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl Planner {
    pub fn new(store: Arc<Store>, budget: Arc<BudgetManager>, llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self { store, budget, llm, model: model.into() }
    }

    /// Generate and persist a new draft plan for `project_id`. On any
    /// failure the project status is restored to `draft` and the budget
    /// reservation is released; the project is left in `planning` only for
    /// the duration of the in-flight call.
    pub async fn generate(&self, project_id: &str) -> Result<Plan> {
        let project = self.store.with_conn(|conn| project_repo::get_project(conn, project_id))?;
        let rigor = PlanningRigor::from_project_config(&project.config);

        let estimated_cost = crate::budget::pricing::calculate_cost(&self.model, EST_INPUT_TOKENS, EST_OUTPUT_TOKENS);
        if !self.budget.reserve(estimated_cost).await? {
            return Err(OrchError::budget_exhausted("budget limit reached, cannot generate plan"));
        }

        self.store.with_conn(|conn| project_repo::update_project_status(conn, project_id, ProjectStatus::Planning))?;

        match self.call_and_parse(&project, rigor).await {
            Ok((output, prompt_tokens, completion_tokens, cost_usd)) => {
                let plan = self.store.with_tx(|tx| {
                    plan_repo::supersede_drafts(tx, project_id)?;
                    let version = plan_repo::latest_plan(tx, project_id).map(|p| p.version + 1).unwrap_or(1);
                    let mut plan = Plan::new(project_id, version, output, rigor as u8);
                    plan.cost_usd = cost_usd;
                    plan_repo::create_plan(tx, &plan)?;
                    Ok(plan)
                })?;

                self.budget
                    .record(cost_usd, prompt_tokens, completion_tokens, "anthropic", &self.model, "planning", project_id, None)
                    .await?;
                self.store.with_conn(|conn| project_repo::update_project_status(conn, project_id, ProjectStatus::Draft))?;
                Ok(plan)
            }
            Err(e) => {
                self.store.with_conn(|conn| project_repo::update_project_status(conn, project_id, ProjectStatus::Draft))?;
                self.budget.release(estimated_cost).await;
                Err(e)
            }
        }
    }

    async fn call_and_parse(&self, project: &Project, rigor: PlanningRigor) -> Result<(PlanOutput, i64, i64, f64)> {
        let system_prompt = prompt::system_prompt(rigor);
        let user_message = prompt::render_requirements(&project.title, &project.requirements);

        let request = CompletionRequest {
            system_prompt,
            messages: vec![Message::user(user_message)],
            tools: vec![],
            max_tokens: rigor.max_output_tokens(),
            model: None,
        };

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| OrchError::plan_parse(format!("planning call failed: {e}")))?;

        let text = response.content.ok_or_else(|| OrchError::plan_parse("empty response from planner"))?;
        let prompt_tokens = response.usage.input_tokens as i64;
        let completion_tokens = response.usage.output_tokens as i64;
        let cost_usd = crate::budget::pricing::calculate_cost(&self.model, prompt_tokens, completion_tokens);

        let output = prompt::parse_plan_json(&text).ok_or_else(|| OrchError::plan_parse("failed to parse plan JSON from response"))?;
        Ok((output, prompt_tokens, completion_tokens, cost_usd))
    }
}

/// Move a plan's status directly (e.g. a user rejecting a draft without
/// approving it). Approval itself happens through the Decomposer, which
/// marks the plan `approved` as part of writing tasks.
pub fn set_plan_status(store: &Store, plan_id: &str, status: PlanStatus) -> Result<()> {
    store.with_conn(|conn| plan_repo::set_plan_status(conn, plan_id, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::llm::{CompletionResponse, LlmError, StopReason, StreamChunk, TokenUsage};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct StubLlm {
        response_text: String,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: Some(self.response_text.clone()),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage { input_tokens: 500, output_tokens: 300, ..Default::default() },
            })
        }

        async fn stream(
            &self,
            request: CompletionRequest,
            _chunk_tx: mpsc::Sender<StreamChunk>,
        ) -> std::result::Result<CompletionResponse, LlmError> {
            self.complete(request).await
        }
    }

    fn setup(response_text: &str) -> (Arc<Store>, Planner, Project) {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = Project::new("Widget app", "R1: build a widget\nR2: ship it");
        store.with_conn(|conn| project_repo::create_project(conn, &project)).unwrap();

        let budget = Arc::new(BudgetManager::new(
            store.clone(),
            BudgetConfig { daily_limit_usd: 100.0, monthly_limit_usd: 1000.0, project_limit_usd: 50.0, warning_threshold: 0.8 },
        ));
        let llm: Arc<dyn LlmClient> = Arc::new(StubLlm { response_text: response_text.to_string() });
        let planner = Planner::new(store.clone(), budget, llm, "claude-sonnet-4-6".to_string());
        (store, planner, project)
    }

    #[tokio::test]
    async fn generate_parses_flat_task_list_and_persists_draft() {
        let (store, planner, project) = setup(
            r#"{"summary": "build it", "tasks": [{"title": "Do the thing", "description": "d", "task_type": "code", "complexity": "simple", "depends_on": [], "requirement_ids": ["R1"]}]}"#,
        );

        let plan = planner.generate(&project.id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Draft);
        assert_eq!(plan.output.tasks.len(), 1);

        let fetched_project = store.with_conn(|conn| project_repo::get_project(conn, &project.id)).unwrap();
        assert_eq!(fetched_project.status, ProjectStatus::Draft);
    }

    #[tokio::test]
    async fn generate_recovers_json_wrapped_in_prose() {
        let (_, planner, project) = setup(
            r#"Sure, here is the plan:
            ```json
            {"summary": "s", "tasks": [{"title": "t", "description": "d", "task_type": "code", "complexity": "simple"}]}
            ```
            Let me know if you'd like changes."#,
        );

        let plan = planner.generate(&project.id).await.unwrap();
        assert_eq!(plan.output.summary, "s");
    }

    #[tokio::test]
    async fn generate_fails_plan_parse_on_unparseable_response() {
        let (store, planner, project) = setup("not json at all");
        let err = planner.generate(&project.id).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::PlanParse);

        let fetched_project = store.with_conn(|conn| project_repo::get_project(conn, &project.id)).unwrap();
        assert_eq!(fetched_project.status, ProjectStatus::Draft);
    }

    #[tokio::test]
    async fn generate_supersedes_previous_draft() {
        let (store, planner, project) = setup(r#"{"summary": "v1", "tasks": [{"title": "t", "description": "d", "task_type": "code", "complexity": "simple"}]}"#);
        let plan_v1 = planner.generate(&project.id).await.unwrap();

        let plan_v2 = planner.generate(&project.id).await.unwrap();
        assert_eq!(plan_v2.version, plan_v1.version + 1);

        let fetched_v1 = store.with_conn(|conn| plan_repo::get_plan(conn, &plan_v1.id)).unwrap();
        assert_eq!(fetched_v1.status, PlanStatus::Superseded);
    }
}
