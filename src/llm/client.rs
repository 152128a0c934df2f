//! The provider-agnostic completion interface every LLM backend implements.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, LlmError, StreamChunk};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a single completion request to exhaustion, returning the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Run a completion request, forwarding incremental chunks on `chunk_tx` as
    /// they arrive, and returning the same aggregated response `complete` would.
    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;
}
