//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use super::StreamEvent;
use crate::db::{Conversation, ConversationType, Message, Role, DEFAULT_TITLE};
use crate::llm::{ChunkSender, ContentBlock, LlmError, LlmRequest, LlmResponse, Usage};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.next(request)
    }

    /// Streams the text of the queued response word by word.
    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        chunks: ChunkSender,
    ) -> Result<LlmResponse, LlmError> {
        let response = self.next(request)?;
        for piece in response.text().split_inclusive(' ') {
            let _ = chunks.send(piece.to_string());
        }
        Ok(response)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Response carrying one tool call and no text
pub fn tool_call_response(id: &str, name: &str, input: Value) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::tool_use(id, name, input)],
        end_turn: false,
        usage: Usage::default(),
    }
}

// ============================================================================
// Delayed Mock LLM Client (for cancellation testing)
// ============================================================================

/// Mock LLM client with configurable delay (for testing cancellation)
pub struct DelayedMockLlmClient {
    inner: MockLlmClient,
    delay: Duration,
    /// Notified when request starts (for test synchronization)
    pub request_started: Arc<Notify>,
}

impl DelayedMockLlmClient {
    pub fn new(model_id: impl Into<String>, delay: Duration) -> Self {
        Self {
            inner: MockLlmClient::new(model_id),
            delay,
            request_started: Arc::new(Notify::new()),
        }
    }

    pub fn queue_response(&self, response: LlmResponse) {
        self.inner.queue_response(response);
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.inner.recorded_requests()
    }
}

#[async_trait]
impl LlmClient for DelayedMockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.request_started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.next(request)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

// ============================================================================
// Mock Tool
// ============================================================================

enum MockBehavior {
    Output(ToolOutput),
    Fail(Box<dyn Fn() -> ToolError + Send + Sync>),
    Panic,
    /// Waits for `release` (or cancellation) before answering
    Blocking {
        output: ToolOutput,
        release: Arc<Notify>,
    },
}

/// Tool with scripted behavior that records its inputs
pub struct MockTool {
    name: String,
    behavior: MockBehavior,
    inputs: Mutex<Vec<Value>>,
    /// Notified each time the tool is invoked
    pub started: Arc<Notify>,
}

impl MockTool {
    fn with_behavior(name: &str, behavior: MockBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            inputs: Mutex::new(Vec::new()),
            started: Arc::new(Notify::new()),
        }
    }

    pub fn new(name: &str, output: ToolOutput) -> Self {
        Self::with_behavior(name, MockBehavior::Output(output))
    }

    pub fn failing(name: &str, error: impl Fn() -> ToolError + Send + Sync + 'static) -> Self {
        Self::with_behavior(name, MockBehavior::Fail(Box::new(error)))
    }

    pub fn panicking(name: &str) -> Self {
        Self::with_behavior(name, MockBehavior::Panic)
    }

    /// Tool that answers `output` only after `release` is notified
    pub fn blocking(name: &str, output: ToolOutput, release: Arc<Notify>) -> Self {
        Self::with_behavior(name, MockBehavior::Blocking { output, release })
    }

    pub fn call_count(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }

    pub fn recorded_inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Mock {}", self.name)
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn invoke(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        self.inputs.lock().unwrap().push(input);
        self.started.notify_one();
        match &self.behavior {
            MockBehavior::Output(output) => Ok(output.clone()),
            MockBehavior::Fail(error) => Err(error()),
            MockBehavior::Panic => panic!("mock tool {} panicked", self.name),
            MockBehavior::Blocking { output, release } => {
                tokio::select! {
                    () = release.notified() => Ok(output.clone()),
                    () = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
                }
            }
        }
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory storage for testing
#[derive(Default)]
pub struct InMemoryStorage {
    conversations: Mutex<HashMap<String, Conversation>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    next_msg_id: Mutex<i64>,
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `add_message` fail from now on
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Get all messages for a conversation
    pub fn all_messages(&self, conv_id: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .get(conv_id)
            .cloned()
            .unwrap_or_default()
    }

    /// `(role, content)` pairs for a conversation, for compact assertions
    pub fn transcript(&self, conv_id: &str) -> Vec<(Role, String)> {
        self.all_messages(conv_id)
            .into_iter()
            .map(|m| (m.role, m.content.unwrap_or_default()))
            .collect()
    }

    pub fn conversation(&self, conv_id: &str) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(conv_id).cloned()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStorage {
    async fn ensure_conversation(
        &self,
        id: Option<&str>,
        conv_type: ConversationType,
    ) -> Result<Conversation, String> {
        if let Some(existing) = id.and_then(|id| self.conversation(id)) {
            return Ok(existing);
        }
        self.create_conversation(id, DEFAULT_TITLE, conv_type).await
    }

    async fn create_conversation(
        &self,
        id: Option<&str>,
        title: &str,
        conv_type: ConversationType,
    ) -> Result<Conversation, String> {
        let conv = Conversation {
            id: id.map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from),
            title: title.to_string(),
            conv_type,
            created_at: chrono::Utc::now(),
        };
        self.conversations
            .lock()
            .unwrap()
            .insert(conv.id.clone(), conv.clone());
        Ok(conv)
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<Message, String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("disk I/O error".to_string());
        }
        if self.conversation(conversation_id).is_none() {
            return Err(format!("Conversation not found: {conversation_id}"));
        }

        let mut messages = self.messages.lock().unwrap();
        let log = messages.entry(conversation_id.to_string()).or_default();
        let mut next_id = self.next_msg_id.lock().unwrap();
        *next_id += 1;
        #[allow(clippy::cast_possible_wrap)]
        let sequence_id = log.len() as i64 + 1;
        let msg = Message {
            id: *next_id,
            conversation_id: conversation_id.to_string(),
            sequence_id,
            role,
            content: content.map(String::from),
            tool_call_id: tool_call_id.map(String::from),
            created_at: chrono::Utc::now(),
        };
        log.push(msg.clone());
        Ok(msg)
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        let all = self.all_messages(conversation_id);
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

// ============================================================================
// Event helpers
// ============================================================================

/// Receive events until a terminal one arrives, the stream ends, or 5s pass.
pub async fn collect_until_terminal(sub: &mut super::Subscriber) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => panic!("no terminal event within 5s, got {events:?}"),
            event = sub.recv() => match event {
                Some(event) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        return events;
                    }
                }
                None => return events,
            }
        }
    }
}

/// Event type tags, for asserting on order
pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            StreamEvent::Init { .. } => "init",
            StreamEvent::Token { .. } => "token",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        })
        .collect()
}
