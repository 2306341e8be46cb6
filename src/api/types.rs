//! API request and response types

use crate::db::{Conversation, Message, Role};
use crate::runtime::{decode_assistant_content, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Query string of the chat socket
#[derive(Debug, Default, Deserialize)]
pub struct ChatWsQuery {
    pub conversation_id: Option<String>,
}

/// Frame sent by a chat socket client.
///
/// `{"type": "stop"}` cancels; `{"messages": [...]}` starts a turn with the
/// last entry.
#[derive(Debug, Default, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub messages: Vec<ClientMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Request to run a synchronous turn
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub message: String,
}

/// Final answer of a synchronous turn
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: String,
}

/// Response with a list of conversations
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<Conversation>,
}

/// A persisted message with its tool calls decoded
#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub sequence_id: i64,
    pub role: Role,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageView {
    fn from(msg: Message) -> Self {
        let (content, tool_calls) = match (msg.role, msg.content) {
            (Role::Assistant, Some(raw)) => {
                let (text, calls) = decode_assistant_content(&raw);
                (Some(text), calls)
            }
            (_, content) => (content, Vec::new()),
        };
        Self {
            id: msg.id,
            sequence_id: msg.sequence_id,
            role: msg.role,
            content,
            tool_call_id: msg.tool_call_id,
            tool_calls,
            created_at: msg.created_at,
        }
    }
}

/// Response with conversation and messages
#[derive(Debug, Serialize)]
pub struct ConversationWithMessagesResponse {
    pub conversation: Conversation,
    pub messages: Vec<MessageView>,
    pub agent_working: bool,
}

/// Response for cancel action
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// Whether a running execution was asked to stop
    pub cancelled: bool,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running_executions: usize,
}

/// Alertmanager webhook body. Fields this service does not use are ignored.
#[derive(Debug, Deserialize)]
pub struct AlertmanagerPayload {
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Conversations started for the firing alerts of a webhook call
#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub status: &'static str,
    pub conversations: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
