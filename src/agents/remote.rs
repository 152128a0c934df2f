//! Multi-round tool-use agent for paid model tiers. Each round calls the
//! remote LLM with the accumulated conversation and the task's tool
//! schemas, executes any requested tools, and feeds the results back until
//! the model stops asking for tools, the round budget is exhausted, or a
//! mid-loop spend check trips. Grounded on `llm::anthropic::AnthropicClient`'s
//! request/response shape.

use std::path::PathBuf;
use std::sync::Arc;

use crate::budget::{pricing, BudgetManager};
use crate::domain::Task;
use crate::llm::{CompletionRequest, ContentBlock, LlmClient, LlmError, Message};
use crate::tools::{ToolContext, ToolExecutor};

use super::{render_system_prompt, AgentOutput};

/// Upper bound on tool-use rounds per task invocation, independent of
/// `max_retries` (a round is one LLM call within a single attempt).
const DEFAULT_MAX_ROUNDS: usize = 12;

pub struct RemoteAgent {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    budget: Arc<BudgetManager>,
    workspace_root: PathBuf,
    max_rounds: usize,
    max_tokens: u32,
}

impl RemoteAgent {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>, budget: Arc<BudgetManager>, workspace_root: PathBuf, max_tokens: u32) -> Self {
        Self { llm, tools, budget, workspace_root, max_rounds: DEFAULT_MAX_ROUNDS, max_tokens }
    }

    /// Run `task` to completion or partial completion. `estimated_reservation`
    /// is the cost the caller already reserved against the budget; once
    /// actual spend this call exceeds that estimate and the global budget is
    /// in warning territory, the loop stops and returns whatever text has
    /// accumulated so far rather than erroring.
    pub async fn run(&self, task: &Task, estimated_reservation: f64) -> Result<AgentOutput, LlmError> {
        let model = pricing::model_id_for_tier(task.model_tier)
            .ok_or_else(|| LlmError::InvalidResponse(format!("task {} has no paid model tier", task.id)))?;

        let system_prompt = render_system_prompt(task);
        let tool_defs = self.tools.definitions_for(&task.tools);
        let ctx = ToolContext::new(self.workspace_root.join(&task.project_id), task.id.clone());

        let mut messages = vec![Message::user(task.description.clone())];
        let mut output = AgentOutput { model_used: model.to_string(), ..Default::default() };

        for _round in 0..self.max_rounds {
            let request = CompletionRequest {
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: tool_defs.clone(),
                max_tokens: self.max_tokens,
                model: Some(model.to_string()),
            };

            let response = self.llm.complete(request).await?;

            output.prompt_tokens += response.usage.input_tokens as i64;
            output.completion_tokens += response.usage.output_tokens as i64;
            output.cost_usd += pricing::calculate_cost(model, response.usage.input_tokens as i64, response.usage.output_tokens as i64);
            if let Some(text) = &response.content {
                output.output = Some(text.clone());
            }

            if response.tool_calls.is_empty() {
                break;
            }

            let budget_exhausted = output.cost_usd > estimated_reservation && self.budget.is_warning().await.unwrap_or(false);
            if budget_exhausted {
                break;
            }

            let mut assistant_blocks = Vec::new();
            if let Some(text) = &response.content {
                assistant_blocks.push(ContentBlock::text(text.clone()));
            }
            for call in &response.tool_calls {
                assistant_blocks.push(ContentBlock::ToolUse { id: call.id.clone(), name: call.name.clone(), input: call.input.clone() });
            }
            messages.push(Message::assistant_blocks(assistant_blocks));

            let results = self.tools.execute_all(&response.tool_calls, &ctx).await;
            let result_blocks = results
                .into_iter()
                .map(|(id, result)| ContentBlock::tool_result(id, result.content, result.is_error))
                .collect();
            messages.push(Message::user_blocks(result_blocks));
        }

        Ok(output)
    }
}
