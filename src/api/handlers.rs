//! HTTP request handlers

use super::alerts;
use super::chat_ws::{chat_ws, title_from_message};
use super::types::{
    AlertmanagerPayload, AlertsResponse, CancelResponse, ChatRequest, ChatResponse,
    ConversationListResponse, ConversationWithMessagesResponse, ErrorResponse, HealthResponse,
    MessageView, SuccessResponse,
};
use super::AppState;
use crate::db::{ConversationType, DbError};
use crate::runtime::{Turn, TurnOutcome, MAX_ITERATIONS_MESSAGE};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Most conversations returned by the listing
const CONVERSATION_LIST_LIMIT: usize = 50;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Streaming chat
        .route("/api/chat/ws", get(chat_ws))
        // Synchronous chat
        .route("/api/chat", post(chat))
        // Conversation history
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", axum::routing::delete(delete_conversation))
        .route("/api/conversations/:id/messages", get(get_messages))
        .route("/api/conversations/:id/cancel", post(cancel_conversation))
        // Alertmanager webhook
        .route("/api/alerts", post(receive_alerts))
        .route("/health", get(health))
        .with_state(state)
}

// ============================================================
// Chat
// ============================================================

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(AppError::BadRequest("message must not be empty".to_string()));
    }

    let conversation = match req.conversation_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => state.db.ensure_conversation(Some(id), ConversationType::Chat)?,
        None => state.db.create_conversation(
            None,
            &title_from_message(message),
            ConversationType::Chat,
        )?,
    };

    let outcome = state
        .supervisor
        .run_sync(&conversation.id, Turn::new(message))
        .await;

    let response = match outcome {
        TurnOutcome::Completed(text) => text,
        TurnOutcome::IterationLimit => MAX_ITERATIONS_MESSAGE.to_string(),
        TurnOutcome::Failed(e) => return Err(AppError::Internal(format!("LLM Provider Error: {e}"))),
        TurnOutcome::Cancelled => {
            return Err(AppError::Conflict(
                "Turn was cancelled or superseded by a newer turn".to_string(),
            ))
        }
    };

    Ok(Json(ChatResponse {
        conversation_id: conversation.id,
        response,
    }))
}

// ============================================================
// Conversations
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<ConversationListResponse>, AppError> {
    let conversations = state
        .db
        .list_conversations(ConversationType::Chat, CONVERSATION_LIST_LIMIT)?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithMessagesResponse>, AppError> {
    let conversation = state.db.get_conversation(&id)?;
    let messages = state
        .db
        .get_messages(&id)?
        .into_iter()
        .map(MessageView::from)
        .collect();

    Ok(Json(ConversationWithMessagesResponse {
        agent_working: state.supervisor.is_running(&id),
        conversation,
        messages,
    }))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.supervisor.cancel(&id);
    state.db.delete_conversation(&id)?;
    tracing::info!(conv_id = %id, "Conversation deleted");
    Ok(Json(SuccessResponse { success: true }))
}

async fn cancel_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.supervisor.cancel(&id),
    })
}

// ============================================================
// Alerts
// ============================================================

async fn receive_alerts(
    State(state): State<AppState>,
    Json(payload): Json<AlertmanagerPayload>,
) -> Result<Json<AlertsResponse>, AppError> {
    tracing::info!(count = payload.alerts.len(), "Alert webhook received");

    let mut conversations = Vec::new();
    for alert in payload.alerts.iter().filter(|a| alerts::is_firing(a)) {
        let id = format!("alert-{}", uuid::Uuid::new_v4());
        state
            .db
            .create_conversation(Some(&id), alerts::alert_name(alert), ConversationType::Alert)?;

        let execution = state
            .supervisor
            .start(&id, Turn::new(alerts::investigation_prompt(alert)));
        tracing::info!(conv_id = %id, alert = %alerts::alert_name(alert), "Alert investigation started");
        tokio::spawn(alerts::log_events(id.clone(), execution.subscriber));
        conversations.push(id);
    }

    Ok(Json(AlertsResponse {
        status: "received",
        conversations,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        running_executions: state.supervisor.running_count(),
    })
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, Role};
    use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmService, ModelRegistry};
    use crate::runtime::{encode_assistant_content, RuntimeConfig, ToolCall};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    /// Model that answers from a script, then fails, or never answers when
    /// `hang` is set. Registered under the registry's default id.
    struct ScriptedModel {
        responses: Mutex<VecDeque<LlmResponse>>,
        hang: bool,
    }

    #[async_trait]
    impl LlmService for ScriptedModel {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(response) => Ok(response),
                None if self.hang => std::future::pending().await,
                None => Err(LlmError::server_error("script exhausted")),
            }
        }

        fn model_id(&self) -> &str {
            "test-model"
        }
    }

    fn state_with(responses: Vec<LlmResponse>) -> AppState {
        scripted_state(responses, false)
    }

    fn scripted_state(responses: Vec<LlmResponse>, hang: bool) -> AppState {
        let mut registry = ModelRegistry::new_empty();
        registry.register(Arc::new(ScriptedModel {
            responses: Mutex::new(responses.into()),
            hang,
        }));
        AppState::new(
            Database::open_in_memory().unwrap(),
            Arc::new(registry),
            ToolRegistry::empty(),
            RuntimeConfig::default(),
        )
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let state = state_with(vec![]);
        let (status, body) = call(&state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "running_executions": 0}));
    }

    #[tokio::test]
    async fn test_sync_chat_creates_and_lists_conversation() {
        let state = state_with(vec![LlmResponse::text_only("3 pods running")]);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/chat",
            Some(json!({"message": "how many pods?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "3 pods running");
        let id = body["conversation_id"].as_str().unwrap().to_string();

        let (_, list) = call(&state, Method::GET, "/api/conversations", None).await;
        assert_eq!(list["conversations"][0]["id"], id.as_str());
        assert_eq!(list["conversations"][0]["title"], "how many pods?");
        assert_eq!(list["conversations"][0]["type"], "chat");

        let (status, detail) =
            call(&state, Method::GET, &format!("/api/conversations/{id}/messages"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["messages"].as_array().unwrap().len(), 2);
        assert_eq!(detail["messages"][1]["content"], "3 pods running");
        assert_eq!(detail["agent_working"], false);
    }

    #[tokio::test]
    async fn test_sync_chat_errors() {
        let state = state_with(vec![]);
        let (status, _) = call(&state, Method::POST, "/api/chat", Some(json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            call(&state, Method::POST, "/api/chat", Some(json!({"message": "hi"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "LLM Provider Error: script exhausted");
    }

    #[tokio::test]
    async fn test_messages_expose_decoded_tool_calls() {
        let state = state_with(vec![]);
        let conv = state
            .db
            .create_conversation(Some("c1"), "pods", ConversationType::Chat)
            .unwrap();
        let calls = vec![ToolCall::new("1", "run_kubectl", json!({"args": "get pods"}))];
        state
            .db
            .add_message(&conv.id, Role::Assistant, Some(&encode_assistant_content("", &calls)), None)
            .unwrap();
        state
            .db
            .add_message(&conv.id, Role::Tool, Some("pod-a Running"), Some("1"))
            .unwrap();

        let (_, detail) = call(&state, Method::GET, "/api/conversations/c1/messages", None).await;
        let assistant = &detail["messages"][0];
        assert_eq!(assistant["content"], "");
        assert_eq!(
            assistant["tool_calls"],
            json!([{"id": "1", "name": "run_kubectl", "arguments": {"args": "get pods"}}])
        );
        assert_eq!(detail["messages"][1]["tool_call_id"], "1");
    }

    #[tokio::test]
    async fn test_delete_and_missing_conversation() {
        let state = state_with(vec![]);
        state
            .db
            .create_conversation(Some("gone"), "x", ConversationType::Chat)
            .unwrap();

        let (status, body) = call(&state, Method::DELETE, "/api/conversations/gone", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let (status, body) = call(&state, Method::GET, "/api/conversations/gone/messages", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("gone"));

        let (status, _) = call(&state, Method::DELETE, "/api/conversations/gone", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_chat_holds_the_conversation_until_cancelled() {
        let state = scripted_state(vec![], true);
        state
            .db
            .create_conversation(Some("c1"), "busy", ConversationType::Chat)
            .unwrap();

        let pending = {
            let state = state.clone();
            tokio::spawn(async move {
                call(
                    &state,
                    Method::POST,
                    "/api/chat",
                    Some(json!({"conversation_id": "c1", "message": "still there?"})),
                )
                .await
            })
        };

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !state.supervisor.is_running("c1") {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (_, detail) = call(&state, Method::GET, "/api/conversations/c1/messages", None).await;
        assert_eq!(detail["agent_working"], true);

        let (_, body) = call(&state, Method::POST, "/api/conversations/c1/cancel", None).await;
        assert_eq!(body, json!({"cancelled": true}));

        let (status, _) = pending.await.unwrap();
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!state.supervisor.is_running("c1"));
    }

    #[tokio::test]
    async fn test_cancel_without_execution_is_noop() {
        let state = state_with(vec![]);
        let (status, body) = call(&state, Method::POST, "/api/conversations/c1/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"cancelled": false}));
    }

    #[tokio::test]
    async fn test_alert_webhook_starts_investigation_per_firing_alert() {
        let state = state_with(vec![LlmResponse::text_only("Root cause: memory limit too low.")]);
        let payload = json!({
            "receiver": "kubeops",
            "status": "firing",
            "alerts": [
                {"status": "firing", "labels": {"alertname": "PodOOM", "instance": "web-1"}, "annotations": {"summary": "OOM"}},
                {"status": "resolved", "labels": {"alertname": "DiskFull"}, "annotations": {}}
            ]
        });

        let (status, body) = call(&state, Method::POST, "/api/alerts", Some(payload)).await;
        assert_eq!(status, StatusCode::OK);
        let ids = body["conversations"].as_array().unwrap();
        assert_eq!(ids.len(), 1);
        let id = ids[0].as_str().unwrap();
        assert!(id.starts_with("alert-"));

        let conv = state.db.get_conversation(id).unwrap();
        assert_eq!(conv.conv_type, ConversationType::Alert);
        assert_eq!(conv.title, "PodOOM");

        // alert conversations stay out of the chat listing
        let (_, list) = call(&state, Method::GET, "/api/conversations", None).await;
        assert_eq!(list["conversations"], json!([]));
    }
}
