//! Fan-out of execution events to live subscribers
//!
//! Each subscriber gets its own bounded queue. Publishing never waits: a full
//! queue loses that one event, other subscribers are unaffected. There is no
//! replay buffer, so a subscriber only sees events published after it joined.

use super::StreamEvent;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

pub struct StreamBroadcaster {
    conversation_id: String,
    capacity: usize,
    state: Mutex<BroadcastState>,
}

#[derive(Default)]
struct BroadcastState {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::Sender<StreamEvent>)>,
    closed: bool,
}

/// Receiving end registered against one broadcaster.
///
/// Dropping it unsubscribes.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<StreamEvent>,
    broadcaster: Weak<StreamBroadcaster>,
}

impl Subscriber {
    /// Next event, or `None` once the broadcaster has closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.remove(self.id);
        }
    }
}

impl StreamBroadcaster {
    pub fn new(conversation_id: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            conversation_id: conversation_id.into(),
            capacity: capacity.max(1),
            state: Mutex::new(BroadcastState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber. After `close` the subscriber is born finished.
    pub fn subscribe(self: &Arc<Self>) -> Subscriber {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.push((id, tx));
        }
        drop(state);

        tracing::debug!(conv_id = %self.conversation_id, subscriber = id, "Subscriber attached");
        Subscriber {
            id,
            rx,
            broadcaster: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, subscriber: Subscriber) {
        self.remove(subscriber.id);
    }

    fn remove(&self, id: u64) {
        let mut state = self.state();
        let before = state.subscribers.len();
        state.subscribers.retain(|(sid, _)| *sid != id);
        if state.subscribers.len() != before {
            tracing::debug!(conv_id = %self.conversation_id, subscriber = id, "Subscriber detached");
        }
    }

    /// Offer `event` to every subscriber without waiting. Returns how many accepted it.
    pub fn publish(&self, event: StreamEvent) -> usize {
        let mut state = self.state();
        let mut delivered = 0;
        state.subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    conv_id = %self.conversation_id,
                    subscriber = id,
                    event = ?dropped,
                    "Subscriber queue full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Stop accepting subscribers and end every existing subscription.
    ///
    /// Queued events stay readable; `recv` returns `None` after them.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }
}
