//! LLM provider abstraction
//!
//! Provides a common interface over chat-completion style model endpoints.

mod error;
mod openai;
mod registry;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use openai::OpenAIService;
pub use registry::{LlmConfig, ModelRegistry};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender for incremental text chunks produced while a response streams in.
pub type ChunkSender = mpsc::UnboundedSender<String>;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Make a completion request, forwarding text chunks as they arrive.
    ///
    /// Providers without native streaming deliver the whole text as a single
    /// chunk once the response is complete.
    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        chunks: ChunkSender,
    ) -> Result<LlmResponse, LlmError> {
        let response = self.complete(request).await?;
        let text = response.text();
        if !text.is_empty() {
            let _ = chunks.send(text);
        }
        Ok(response)
    }

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }

    fn log_result(&self, result: &Result<LlmResponse, LlmError>, started: std::time::Instant) {
        let duration = started.elapsed();
        match result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    tool_calls = response.tool_uses().len(),
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    kind = ?e.kind,
                    retryable = e.kind.is_retryable(),
                    "LLM request failed"
                );
            }
        }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(request).await;
        self.log_result(&result, start);
        result
    }

    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        chunks: ChunkSender,
    ) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete_streaming(request, chunks).await;
        self.log_result(&result, start);
        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
