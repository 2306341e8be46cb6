//! Execution supervisor
//!
//! Owns the table of running executions, at most one per conversation.
//! Every table entry carries a generation number so that a finishing task
//! only removes its own entry, never a successor's.

use super::broadcast::{StreamBroadcaster, Subscriber};
use super::executor::{TurnExecutor, TurnOutcome};
use super::gate::ToolGate;
use super::traits::{HistoryStore, LlmClient};
use super::{RuntimeConfig, Turn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ExecutionEntry {
    generation: u64,
    cancel: CancellationToken,
    broadcaster: Arc<StreamBroadcaster>,
    finished: Arc<AtomicBool>,
}

impl ExecutionEntry {
    fn is_live(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ExecutionTable {
    entries: Mutex<HashMap<String, ExecutionEntry>>,
    next_generation: AtomicU64,
}

impl ExecutionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ExecutionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compare-and-delete: remove the entry only if it is still `generation`.
    fn remove_if_current(&self, conversation_id: &str, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(conversation_id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(conversation_id);
                true
            }
            _ => false,
        }
    }
}

/// Marks an execution finished and releases its table entry when dropped,
/// including when the owning future is dropped mid-turn.
struct EntryGuard {
    table: Arc<ExecutionTable>,
    conversation_id: String,
    generation: u64,
    broadcaster: Arc<StreamBroadcaster>,
    finished: Arc<AtomicBool>,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
        self.broadcaster.close();
        if !self.table.remove_if_current(&self.conversation_id, self.generation) {
            tracing::debug!(
                conv_id = %self.conversation_id,
                generation = self.generation,
                "Entry already superseded"
            );
        }
    }
}

/// A started execution
pub struct Execution {
    pub generation: u64,
    /// Subscribed before the task was spawned, so it sees every event
    pub subscriber: Subscriber,
    pub handle: JoinHandle<TurnOutcome>,
}

pub struct ExecutionSupervisor<S, L>
where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    table: Arc<ExecutionTable>,
    storage: Arc<S>,
    llm: Arc<L>,
    gate: Arc<ToolGate>,
    config: RuntimeConfig,
}

impl<S, L> ExecutionSupervisor<S, L>
where
    S: HistoryStore + 'static,
    L: LlmClient + 'static,
{
    pub fn new(storage: Arc<S>, llm: Arc<L>, gate: Arc<ToolGate>, config: RuntimeConfig) -> Self {
        Self {
            table: Arc::new(ExecutionTable::default()),
            storage,
            llm,
            gate,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    fn executor(&self, conversation_id: &str, cancel: CancellationToken) -> TurnExecutor<S, L> {
        TurnExecutor::new(
            conversation_id,
            self.storage.clone(),
            self.llm.clone(),
            self.gate.clone(),
            cancel,
            self.config.clone(),
        )
    }

    /// Install a fresh entry for the conversation, cancelling a live predecessor.
    fn install(&self, conversation_id: &str) -> (EntryGuard, CancellationToken) {
        let generation = self.table.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let broadcaster = StreamBroadcaster::new(conversation_id, self.config.subscriber_capacity);
        let finished = Arc::new(AtomicBool::new(false));

        let entry = ExecutionEntry {
            generation,
            cancel: cancel.clone(),
            broadcaster: broadcaster.clone(),
            finished: finished.clone(),
        };
        let previous = self.table.lock().insert(conversation_id.to_string(), entry);
        if let Some(previous) = previous.filter(ExecutionEntry::is_live) {
            tracing::info!(
                conv_id = %conversation_id,
                superseded = previous.generation,
                generation,
                "Cancelling previous execution"
            );
            previous.cancel.cancel();
        }

        let guard = EntryGuard {
            table: Arc::clone(&self.table),
            conversation_id: conversation_id.to_string(),
            generation,
            broadcaster,
            finished,
        };
        (guard, cancel)
    }

    /// Start a turn, superseding any live execution for the conversation.
    pub fn start(&self, conversation_id: &str, turn: Turn) -> Execution {
        let (guard, cancel) = self.install(conversation_id);
        let generation = guard.generation;
        let subscriber = guard.broadcaster.subscribe();
        let executor = self
            .executor(conversation_id, cancel)
            .with_broadcaster(guard.broadcaster.clone());

        let handle = tokio::spawn(async move {
            let outcome = executor.run(turn).await;
            drop(guard);
            outcome
        });

        tracing::info!(conv_id = %conversation_id, generation, "Execution started");
        Execution {
            generation,
            subscriber,
            handle,
        }
    }

    /// Request cancellation of the live execution. Returns false if none was running.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let entries = self.table.lock();
        match entries.get(conversation_id).filter(|e| e.is_live()) {
            Some(entry) => {
                tracing::info!(conv_id = %conversation_id, generation = entry.generation, "Cancelling execution");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Subscribe to the live execution of a conversation, if there is one.
    pub fn join_if_running(&self, conversation_id: &str) -> Option<Subscriber> {
        let entries = self.table.lock();
        let entry = entries.get(conversation_id).filter(|e| e.is_live())?;
        tracing::info!(conv_id = %conversation_id, generation = entry.generation, "Rejoining execution");
        Some(entry.broadcaster.subscribe())
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.table
            .lock()
            .get(conversation_id)
            .is_some_and(ExecutionEntry::is_live)
    }

    pub fn running_count(&self) -> usize {
        self.table.lock().values().filter(|e| e.is_live()).count()
    }

    /// Live subscribers of the conversation's current execution
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.table
            .lock()
            .get(conversation_id)
            .map_or(0, |e| e.broadcaster.subscriber_count())
    }

    /// Run the synchronous variant to completion on the caller's task.
    ///
    /// It takes the conversation's table entry like `start` does, so it
    /// supersedes a live execution and can itself be cancelled or superseded.
    /// Nothing is streamed.
    pub async fn run_sync(&self, conversation_id: &str, turn: Turn) -> TurnOutcome {
        let (guard, cancel) = self.install(conversation_id);
        tracing::info!(conv_id = %conversation_id, generation = guard.generation, "Synchronous execution started");
        let outcome = self.executor(conversation_id, cancel).run_sync(turn).await;
        drop(guard);
        outcome
    }
}
