//! Turn executor
//!
//! Runs the reasoning loop for one user turn: call the model, run any tool
//! calls it asked for through the gate, feed the results back, repeat until
//! the model answers without tool calls.

use super::gate::ToolGate;
use super::history::{build_llm_messages, encode_assistant_content, ToolCall};
use super::traits::{HistoryStore, LlmClient};
use super::{
    RuntimeConfig, StreamBroadcaster, StreamEvent, Turn, CANCELLED_MESSAGE,
    MAX_ITERATIONS_MESSAGE,
};
use crate::db::Role;
use crate::llm::{
    ContentBlock, LlmError, LlmMessage, LlmRequest, LlmResponse, MessageRole, SystemContent,
};
use crate::system_prompt::build_system_prompt;
use crate::tools::ToolContext;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Final answer of the synchronous loop when the model returns no text
pub const EMPTY_RESPONSE: &str = "Empty response.";

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a final answer
    Completed(String),
    Cancelled,
    /// The model call failed; carries the provider's error text
    Failed(String),
    /// The synchronous loop ran out of model calls
    IterationLimit,
}

pub struct TurnExecutor<S, L>
where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    conversation_id: String,
    storage: Arc<S>,
    llm: Arc<L>,
    gate: Arc<ToolGate>,
    broadcaster: Option<Arc<StreamBroadcaster>>,
    cancel: CancellationToken,
    config: RuntimeConfig,
}

impl<S, L> TurnExecutor<S, L>
where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    pub fn new(
        conversation_id: impl Into<String>,
        storage: Arc<S>,
        llm: Arc<L>,
        gate: Arc<ToolGate>,
        cancel: CancellationToken,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            storage,
            llm,
            gate,
            broadcaster: None,
            cancel,
            config,
        }
    }

    /// Publish stream events to `broadcaster`
    pub fn with_broadcaster(mut self, broadcaster: Arc<StreamBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Run the streaming variant. Iteration is bounded only by cancellation.
    ///
    /// Always publishes exactly one terminal event.
    pub async fn run(self, turn: Turn) -> TurnOutcome {
        tracing::info!(conv_id = %self.conversation_id, model = %self.llm.model_id(), "Starting turn");
        let outcome = self.drive(&turn, None).await;

        let terminal = match &outcome {
            TurnOutcome::Completed(_) => StreamEvent::Done,
            TurnOutcome::Cancelled => StreamEvent::error(CANCELLED_MESSAGE),
            TurnOutcome::Failed(message) => StreamEvent::error(message.clone()),
            TurnOutcome::IterationLimit => StreamEvent::error(MAX_ITERATIONS_MESSAGE),
        };
        self.emit(terminal);

        tracing::info!(conv_id = %self.conversation_id, outcome = ?outcome, "Turn finished");
        outcome
    }

    /// Run the synchronous variant, capped at `max_sync_iterations` model calls.
    ///
    /// An empty final answer becomes `EMPTY_RESPONSE`; running out of
    /// iterations records `MAX_ITERATIONS_MESSAGE` as the assistant's answer.
    pub async fn run_sync(self, turn: Turn) -> TurnOutcome {
        let cap = self.config.max_sync_iterations;
        tracing::info!(conv_id = %self.conversation_id, model = %self.llm.model_id(), max = cap, "Starting synchronous turn");
        match self.drive(&turn, Some(cap)).await {
            TurnOutcome::Completed(text) if text.trim().is_empty() => {
                TurnOutcome::Completed(EMPTY_RESPONSE.to_string())
            }
            TurnOutcome::IterationLimit => {
                tracing::warn!(conv_id = %self.conversation_id, max = cap, "Iteration limit reached");
                self.persist(Role::Assistant, Some(MAX_ITERATIONS_MESSAGE), None)
                    .await;
                TurnOutcome::IterationLimit
            }
            other => other,
        }
    }

    async fn drive(&self, turn: &Turn, max_iterations: Option<usize>) -> TurnOutcome {
        if !turn.user_message_persisted {
            if self.cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            self.persist(Role::User, Some(&turn.text), None).await;
        }

        let mut messages = self.load_history(&turn.text).await;
        let tool_names = self.gate.registry().names();
        let system = build_system_prompt(&tool_names);
        let tools = self.gate.registry().schemas();

        let mut iteration = 0;
        loop {
            if max_iterations.is_some_and(|max| iteration >= max) {
                return TurnOutcome::IterationLimit;
            }
            iteration += 1;

            // ==== AwaitingModel ====
            if self.cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            let request = LlmRequest {
                system: vec![SystemContent::new(system.clone())],
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
            };
            tracing::debug!(conv_id = %self.conversation_id, iteration, "Requesting model");

            let response = match self.call_model(&request).await {
                None => return TurnOutcome::Cancelled,
                Some(Ok(response)) => response,
                Some(Err(e)) => return self.model_failed(&e).await,
            };

            let text = response.text();
            let calls = tool_calls_of(&response);

            if self.cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }

            if calls.is_empty() {
                if !text.is_empty() {
                    self.persist(Role::Assistant, Some(&text), None).await;
                }
                return TurnOutcome::Completed(text);
            }

            // ==== ExecutingTools ====
            let encoded = encode_assistant_content(&text, &calls);
            self.persist(Role::Assistant, Some(&encoded), None).await;
            messages.push(LlmMessage {
                role: MessageRole::Assistant,
                content: response.content,
            });

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                if self.cancel.is_cancelled() {
                    return TurnOutcome::Cancelled;
                }
                self.emit(StreamEvent::ToolStart {
                    tool: call.name.clone(),
                    args: call.arguments.to_string(),
                });

                let ctx = ToolContext::new(self.cancel.clone(), self.conversation_id.clone());
                let result = self.gate.invoke(call, &messages, ctx).await;

                if self.cancel.is_cancelled() {
                    return TurnOutcome::Cancelled;
                }
                self.persist(Role::Tool, Some(&result.content), Some(&result.tool_call_id))
                    .await;
                self.emit(StreamEvent::ToolResult {
                    output: result.content.clone(),
                });
                results.push(ContentBlock::tool_result(
                    result.tool_call_id,
                    result.content,
                    result.is_error,
                ));
            }

            messages.push(LlmMessage {
                role: MessageRole::User,
                content: results,
            });
        }
    }

    /// Replay the recent history. The current user message is appended if
    /// history does not already end with it.
    async fn load_history(&self, user_text: &str) -> Vec<LlmMessage> {
        let rows = match self
            .storage
            .get_recent_messages(&self.conversation_id, self.config.replay_window)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(conv_id = %self.conversation_id, error = %e, "Failed to load history, starting fresh");
                Vec::new()
            }
        };

        let mut messages = build_llm_messages(&rows);
        let ends_with_turn = messages
            .last()
            .is_some_and(|m| m.is_human_turn() && m.text() == user_text);
        if !ends_with_turn {
            messages.push(LlmMessage::user_text(user_text));
        }
        messages
    }

    /// Call the model, forwarding streamed text as token events.
    ///
    /// Returns `None` if the turn was cancelled before the model answered.
    async fn call_model(&self, request: &LlmRequest) -> Option<Result<LlmResponse, LlmError>> {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let call = self.llm.complete_streaming(request, chunk_tx);
        tokio::pin!(call);

        let result = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    tracing::info!(conv_id = %self.conversation_id, "Model request cancelled");
                    return None;
                }

                Some(chunk) = chunk_rx.recv() => self.emit(StreamEvent::Token { content: chunk }),

                result = &mut call => break result,
            }
        };

        while let Ok(chunk) = chunk_rx.try_recv() {
            self.emit(StreamEvent::Token { content: chunk });
        }
        Some(result)
    }

    async fn model_failed(&self, error: &LlmError) -> TurnOutcome {
        tracing::error!(
            conv_id = %self.conversation_id,
            kind = ?error.kind,
            error = %error,
            "Model request failed"
        );
        if !self.cancel.is_cancelled() {
            let note = format!("Model request failed: {error}");
            self.persist(Role::System, Some(&note), None).await;
        }
        TurnOutcome::Failed(error.to_string())
    }

    /// Append to history. Failures are logged and the turn carries on.
    async fn persist(&self, role: Role, content: Option<&str>, tool_call_id: Option<&str>) {
        if let Err(e) = self
            .storage
            .add_message(&self.conversation_id, role, content, tool_call_id)
            .await
        {
            tracing::warn!(
                conv_id = %self.conversation_id,
                role = %role,
                error = %e,
                "Failed to persist message"
            );
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(event);
        }
    }
}

fn tool_calls_of(response: &LlmResponse) -> Vec<ToolCall> {
    response
        .tool_uses()
        .into_iter()
        .map(|(id, name, input)| ToolCall::new(id, name, input.clone()))
        .collect()
}
