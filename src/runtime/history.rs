//! Persistence contract for turns
//!
//! Assistant messages that issued tool calls store them in `content` behind
//! `TOOL_CALLS_MARKER`. Replay rebuilds model input from the persisted rows in
//! sequence order.

use crate::db::{Message, Role};
use crate::llm::{ContentBlock, LlmMessage, MessageRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TOOL_CALLS_MARKER: &str = ":::TOOL_CALLS:::";

/// Visible text stored when a tool-calling assistant message has no prose
pub const TOOL_USE_PLACEHOLDER: &str = "[tool use]";

/// Result recorded for a call whose result never reached history
const INTERRUPTED_RESULT: &str = "[tool call interrupted before completion]";

/// A model-requested tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(alias = "args", default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Encode assistant text plus its tool calls into a single content string.
pub fn encode_assistant_content(text: &str, calls: &[ToolCall]) -> String {
    if calls.is_empty() {
        return text.to_string();
    }
    let visible = if text.trim().is_empty() {
        TOOL_USE_PLACEHOLDER
    } else {
        text
    };
    match serde_json::to_string(calls) {
        Ok(json) => format!("{visible}{TOOL_CALLS_MARKER}{json}"),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode tool calls, storing text only");
            visible.to_string()
        }
    }
}

/// Split stored assistant content into visible text and tool calls.
///
/// Corrupt JSON after the marker is logged and treated as no tool calls.
pub fn decode_assistant_content(content: &str) -> (String, Vec<ToolCall>) {
    let Some((visible, encoded)) = content.split_once(TOOL_CALLS_MARKER) else {
        return (content.to_string(), Vec::new());
    };

    let visible = visible.trim();
    let visible = if visible == TOOL_USE_PLACEHOLDER { "" } else { visible };

    match serde_json::from_str::<Vec<ToolCall>>(encoded.trim()) {
        Ok(calls) => (visible.to_string(), calls),
        Err(e) => {
            tracing::warn!(error = %e, "Corrupt tool call encoding in history, ignoring tool calls");
            (visible.to_string(), Vec::new())
        }
    }
}

/// Rebuild model input from persisted messages.
///
/// System rows are skipped; tool rows without a preceding call are dropped;
/// calls whose results were never persisted get a synthetic error result so
/// the model never sees an unanswered call.
pub fn build_llm_messages(messages: &[Message]) -> Vec<LlmMessage> {
    let mut out: Vec<LlmMessage> = Vec::new();
    let mut pending: Vec<String> = Vec::new();

    for msg in messages {
        let content = msg.content.as_deref().unwrap_or_default();
        match msg.role {
            Role::Tool => {
                let Some(call_id) = msg.tool_call_id.as_deref() else {
                    tracing::warn!(message_id = msg.id, "Tool message without call id, skipping");
                    continue;
                };
                let Some(pos) = pending.iter().position(|id| id == call_id) else {
                    tracing::warn!(message_id = msg.id, call_id = %call_id, "Orphan tool result, skipping");
                    continue;
                };
                pending.remove(pos);
                push_tool_result(&mut out, ContentBlock::tool_result(call_id, content, false));
            }
            Role::User => {
                flush_pending(&mut out, &mut pending);
                if !content.is_empty() {
                    out.push(LlmMessage::user_text(content));
                }
            }
            Role::Assistant => {
                flush_pending(&mut out, &mut pending);
                let (text, calls) = decode_assistant_content(content);
                let mut blocks = Vec::with_capacity(calls.len() + 1);
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text));
                }
                for call in calls {
                    pending.push(call.id.clone());
                    blocks.push(ContentBlock::tool_use(call.id, call.name, call.arguments));
                }
                if !blocks.is_empty() {
                    out.push(LlmMessage {
                        role: MessageRole::Assistant,
                        content: blocks,
                    });
                }
            }
            Role::System => {}
        }
    }

    flush_pending(&mut out, &mut pending);
    out
}

fn push_tool_result(out: &mut Vec<LlmMessage>, block: ContentBlock) {
    if let Some(last) = out.last_mut() {
        let only_results = last.role == MessageRole::User
            && last
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }));
        if only_results {
            last.content.push(block);
            return;
        }
    }
    out.push(LlmMessage {
        role: MessageRole::User,
        content: vec![block],
    });
}

fn flush_pending(out: &mut Vec<LlmMessage>, pending: &mut Vec<String>) {
    for call_id in pending.drain(..) {
        push_tool_result(out, ContentBlock::tool_result(call_id, INTERRUPTED_RESULT, true));
    }
}
