//! Runtime for executing conversation turns
//!
//! One execution runs per conversation at a time. Each execution owns a
//! `StreamBroadcaster` that fans its events out to whoever is watching:
//! live sockets, log sinks, or nobody at all.

mod broadcast;
mod executor;
mod gate;
mod history;
mod supervisor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use broadcast::{StreamBroadcaster, Subscriber};
pub use executor::TurnOutcome;
pub use gate::{SafetyPolicy, ToolGate};
pub use history::{
    decode_assistant_content, encode_assistant_content, ToolCall, TOOL_USE_PLACEHOLDER,
};
pub use supervisor::ExecutionSupervisor;
pub use traits::*;

use serde::{Deserialize, Serialize};

/// Type alias for the production supervisor with concrete implementations
pub type ProductionSupervisor = ExecutionSupervisor<DatabaseStorage, RegistryLlmClient>;

/// Terminal error text published when a turn is cancelled
pub const CANCELLED_MESSAGE: &str = "[Task Cancelled by User]";

/// Final answer of the synchronous loop when it runs out of iterations
pub const MAX_ITERATIONS_MESSAGE: &str =
    "I'm sorry, I reached my maximum thinking steps before finding a final answer.";

/// Events streamed to subscribers of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Init {
        conversation_id: String,
        title: String,
    },
    Token {
        content: String,
    },
    ToolStart {
        tool: String,
        /// Arguments as a JSON-encoded string
        args: String,
    },
    ToolResult {
        output: String,
    },
    Error {
        content: String,
    },
    Done,
}

impl StreamEvent {
    /// True for the events that end a turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }

    pub fn error(content: impl Into<String>) -> Self {
        StreamEvent::Error {
            content: content.into(),
        }
    }
}

/// One user message to process
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub text: String,
    /// Whether the caller already appended the user message to history
    pub user_message_persisted: bool,
}

impl Turn {
    /// A turn whose user message the executor must persist
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_message_persisted: false,
        }
    }

    /// A turn whose user message is already in history
    pub fn persisted(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_message_persisted: true,
        }
    }
}

/// Tunables for executions
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Queue depth of each broadcaster subscriber
    pub subscriber_capacity: usize,
    /// Model calls allowed in the synchronous loop
    pub max_sync_iterations: usize,
    /// Number of most recent messages replayed into each turn
    pub replay_window: usize,
    pub max_tokens: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            max_sync_iterations: 10,
            replay_window: 20,
            max_tokens: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup. Zero or unparsable counts keep their defaults.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let positive = |key: &str| parse(key).filter(|n| *n > 0);

        let defaults = Self::default();
        Self {
            subscriber_capacity: positive("KUBEOPS_SUBSCRIBER_CAPACITY")
                .unwrap_or(defaults.subscriber_capacity),
            max_sync_iterations: positive("KUBEOPS_MAX_SYNC_ITERATIONS")
                .unwrap_or(defaults.max_sync_iterations),
            replay_window: positive("KUBEOPS_REPLAY_WINDOW").unwrap_or(defaults.replay_window),
            max_tokens: lookup("KUBEOPS_MAX_TOKENS")
                .and_then(|v| v.trim().parse().ok())
                .or(defaults.max_tokens),
        }
    }
}
