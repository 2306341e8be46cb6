//! Trait abstractions for runtime I/O
//!
//! These traits enable testing executions with mock implementations.

use crate::db::{Conversation, ConversationType, Database, Message, Role};
use crate::llm::{ChunkSender, LlmError, LlmRequest, LlmResponse, ModelRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Append-only per-conversation message log
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Return the conversation, creating it (with this id when given) if missing
    async fn ensure_conversation(
        &self,
        id: Option<&str>,
        conv_type: ConversationType,
    ) -> Result<Conversation, String>;

    /// Create a new conversation
    async fn create_conversation(
        &self,
        id: Option<&str>,
        title: &str,
        conv_type: ConversationType,
    ) -> Result<Conversation, String>;

    /// Append a message
    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<Message, String>;

    /// The most recent `limit` messages, oldest first
    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, String>;
}

/// Client for making LLM requests
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete an LLM request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Complete an LLM request, sending text chunks as they are produced
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

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: HistoryStore + ?Sized> HistoryStore for Arc<T> {
    async fn ensure_conversation(
        &self,
        id: Option<&str>,
        conv_type: ConversationType,
    ) -> Result<Conversation, String> {
        (**self).ensure_conversation(id, conv_type).await
    }

    async fn create_conversation(
        &self,
        id: Option<&str>,
        title: &str,
        conv_type: ConversationType,
    ) -> Result<Conversation, String> {
        (**self).create_conversation(id, title, conv_type).await
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<Message, String> {
        (**self)
            .add_message(conversation_id, role, content, tool_call_id)
            .await
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        (**self).get_recent_messages(conversation_id, limit).await
    }
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        chunks: ChunkSender,
    ) -> Result<LlmResponse, LlmError> {
        (**self).complete_streaming(request, chunks).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a `HistoryStore`
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl HistoryStore for DatabaseStorage {
    async fn ensure_conversation(
        &self,
        id: Option<&str>,
        conv_type: ConversationType,
    ) -> Result<Conversation, String> {
        self.db
            .ensure_conversation(id, conv_type)
            .map_err(|e| e.to_string())
    }

    async fn create_conversation(
        &self,
        id: Option<&str>,
        title: &str,
        conv_type: ConversationType,
    ) -> Result<Conversation, String> {
        self.db
            .create_conversation(id, title, conv_type)
            .map_err(|e| e.to_string())
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<Message, String> {
        self.db
            .add_message(conversation_id, role, content, tool_call_id)
            .map_err(|e| e.to_string())
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        self.db
            .get_recent_messages(conversation_id, limit)
            .map_err(|e| e.to_string())
    }
}

/// Adapter to use `ModelRegistry` as `LlmClient`
pub struct RegistryLlmClient {
    registry: Arc<ModelRegistry>,
    model_id: String,
}

impl RegistryLlmClient {
    pub fn new(registry: Arc<ModelRegistry>, model_id: String) -> Self {
        Self { registry, model_id }
    }

    fn service(&self) -> Result<Arc<dyn crate::llm::LlmService>, LlmError> {
        self.registry
            .get(&self.model_id)
            .or_else(|| self.registry.default())
            .ok_or_else(|| {
                LlmError::auth(format!(
                    "Model '{}' is not configured; set OPENAI_API_KEY",
                    self.model_id
                ))
            })
    }
}

#[async_trait]
impl LlmClient for RegistryLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.service()?.complete(request).await
    }

    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        chunks: ChunkSender,
    ) -> Result<LlmResponse, LlmError> {
        self.service()?.complete_streaming(request, chunks).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
