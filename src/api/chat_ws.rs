//! Chat WebSocket
//!
//! One `ConnectionMultiplexer` runs per socket. It merges inbound client
//! frames and the events of the execution it is subscribed to into a single
//! control loop. Executions outlive the socket: disconnecting only drops the
//! subscription, and a later connection can rejoin a run still in flight.

use super::types::{ChatWsQuery, ClientFrame};
use super::AppState;
use crate::db::{ConversationType, Role};
use crate::runtime::{
    ExecutionSupervisor, HistoryStore, LlmClient, StreamEvent, Subscriber, Turn,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;

/// Longest title derived from a first message, in characters
const TITLE_MAX_CHARS: usize = 50;

/// The outbound side went away
struct Disconnected;

/// Title for a conversation created by its first message
pub fn title_from_message(text: &str) -> String {
    let mut chars = text.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}...")
    } else {
        title
    }
}

pub struct ConnectionMultiplexer<S, L>
where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    supervisor: Arc<ExecutionSupervisor<S, L>>,
    conversation_id: Option<String>,
    subscription: Option<Subscriber>,
}

impl<S, L> ConnectionMultiplexer<S, L>
where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    pub fn new(supervisor: Arc<ExecutionSupervisor<S, L>>, conversation_id: Option<String>) -> Self {
        Self {
            supervisor,
            conversation_id: conversation_id.filter(|id| !id.is_empty()),
            subscription: None,
        }
    }

    /// Drive the connection until the client goes away.
    pub async fn run<I, O>(mut self, mut inbound: I, mut outbound: O)
    where
        I: Stream<Item = String> + Unpin,
        O: Sink<String> + Unpin,
    {
        self.attach().await;

        loop {
            // Both waits are cancel-safe, so the one that loses the race
            // keeps its item for the next iteration.
            tokio::select! {
                frame = inbound.next() => {
                    let Some(frame) = frame else { break };
                    if self.handle_frame(&frame, &mut outbound).await.is_err() {
                        break;
                    }
                }
                event = next_event(&mut self.subscription) => match event {
                    Some(event) => {
                        if send_event(&mut outbound, &event).await.is_err() {
                            break;
                        }
                    }
                    // execution finished and its queue is drained
                    None => self.subscription = None,
                },
            }
        }

        tracing::info!(conv_id = ?self.conversation_id, "Chat connection closed");
    }

    /// Resolve the requested conversation and rejoin its execution if one is running.
    async fn attach(&mut self) {
        let Some(id) = self.conversation_id.clone() else {
            tracing::info!("Chat connection opened, conversation created on first message");
            return;
        };

        if let Err(e) = self
            .supervisor
            .storage()
            .ensure_conversation(Some(&id), ConversationType::Chat)
            .await
        {
            tracing::warn!(conv_id = %id, error = %e, "Failed to resolve conversation");
        }

        self.subscription = self.supervisor.join_if_running(&id);
        tracing::info!(
            conv_id = %id,
            rejoined = self.subscription.is_some(),
            "Chat connection opened"
        );
    }

    async fn handle_frame<O>(&mut self, raw: &str, outbound: &mut O) -> Result<(), Disconnected>
    where
        O: Sink<String> + Unpin,
    {
        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) if e.is_syntax() || e.is_eof() => {
                tracing::debug!(error = %e, "Client sent invalid JSON");
                return send_event(outbound, &StreamEvent::error("Invalid JSON format")).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unrecognized frame");
                return Ok(());
            }
        };

        if frame.kind.as_deref() == Some("stop") {
            if let Some(id) = &self.conversation_id {
                self.supervisor.cancel(id);
            }
            return Ok(());
        }

        // only the last entry is new; earlier ones are the client's copy of history
        let Some(last) = frame.messages.last() else {
            return Ok(());
        };
        if last.role != "user" || last.content.trim().is_empty() {
            tracing::debug!(role = %last.role, "Ignoring frame without a new user message");
            return Ok(());
        }

        self.start_turn(last.content.clone(), outbound).await
    }

    async fn start_turn<O>(&mut self, text: String, outbound: &mut O) -> Result<(), Disconnected>
    where
        O: Sink<String> + Unpin,
    {
        let storage = self.supervisor.storage().clone();

        let conversation_id = match &self.conversation_id {
            Some(id) => id.clone(),
            None => {
                let title = title_from_message(&text);
                let conv = match storage
                    .create_conversation(None, &title, ConversationType::Chat)
                    .await
                {
                    Ok(conv) => conv,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to create conversation");
                        return send_event(outbound, &StreamEvent::error(format!("Failed to create conversation: {e}")))
                            .await;
                    }
                };
                tracing::info!(conv_id = %conv.id, title = %title, "Conversation created from first message");
                self.conversation_id = Some(conv.id.clone());
                let init = StreamEvent::Init {
                    conversation_id: conv.id.clone(),
                    title,
                };
                send_event(outbound, &init).await?;
                conv.id
            }
        };

        // on failure the executor retries the write itself
        let turn = match storage
            .add_message(&conversation_id, Role::User, Some(&text), None)
            .await
        {
            Ok(_) => Turn::persisted(text),
            Err(e) => {
                tracing::warn!(conv_id = %conversation_id, error = %e, "Failed to persist user message");
                Turn::new(text)
            }
        };

        // unsubscribe from the old broadcaster before taking the new one
        self.subscription = None;
        let execution = self.supervisor.start(&conversation_id, turn);
        self.subscription = Some(execution.subscriber);
        Ok(())
    }
}

async fn next_event(subscription: &mut Option<Subscriber>) -> Option<StreamEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => future::pending().await,
    }
}

async fn send_event<O>(outbound: &mut O, event: &StreamEvent) -> Result<(), Disconnected>
where
    O: Sink<String> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize event");
            return Ok(());
        }
    };
    outbound.send(text).await.map_err(|_| Disconnected)
}

// ============================================================================
// Axum adapter
// ============================================================================

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChatWsQuery>,
) -> Response {
    let supervisor = state.supervisor.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, supervisor, query.conversation_id))
}

async fn handle_socket<S, L>(
    socket: WebSocket,
    supervisor: Arc<ExecutionSupervisor<S, L>>,
    conversation_id: Option<String>,
) where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    let (sender, receiver) = socket.split();

    let inbound = receiver
        .take_while(|msg| future::ready(!matches!(msg, Err(_) | Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });
    let outbound = sender.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));

    ConnectionMultiplexer::new(supervisor, conversation_id)
        .run(Box::pin(inbound), Box::pin(outbound))
        .await;
}
