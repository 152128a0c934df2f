//! One-shot runner for the free local inference tier: a single POST to an
//! ollama-style `/api/generate` endpoint, no tool loop, zero cost. Grounded
//! on `resource::ResourceMonitor`'s `{local_base_url}/api/tags` convention
//! for the same backend.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::config::LlmConfig;
use crate::domain::Task;
use crate::llm::LlmError;

use super::{render_system_prompt, AgentOutput};

pub struct LocalAgent {
    http: Client,
    base_url: String,
    model: String,
}

impl LocalAgent {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;
        Ok(Self { http, base_url: config.local_base_url.trim_end_matches('/').to_string(), model: config.local_model.clone() })
    }

    pub async fn run(&self, task: &Task) -> Result<AgentOutput, LlmError> {
        let system_prompt = render_system_prompt(task);
        let url = format!("{}/api/generate", self.base_url);

        let body = serde_json::json!({
            "model": self.model,
            "system": system_prompt,
            "prompt": task.description,
            "stream": false,
        });

        let response = self.http.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, message: text });
        }

        let parsed: OllamaGenerateResponse = response.json().await?;

        Ok(AgentOutput {
            output: Some(parsed.response),
            artifacts: Vec::new(),
            prompt_tokens: parsed.prompt_eval_count as i64,
            completion_tokens: parsed.eval_count as i64,
            cost_usd: 0.0,
            model_used: self.model.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}
