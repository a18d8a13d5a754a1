use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    error::ChatError,
    types::{SendAck, SubscriptionState},
};

/// Notifications emitted by the sync core for UI consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// A conversation slice changed.
    SliceUpdated {
        conversation_id: String,
        /// Number of messages after the change.
        len: usize,
    },
    /// Live subscription lifecycle transition.
    SubscriptionStateChanged {
        conversation_id: String,
        state: SubscriptionState,
    },
    /// A conversation-scoped fault was recorded.
    ConversationError {
        conversation_id: String,
        error: ChatError,
    },
    /// Outcome of one send attempt.
    SendAck(SendAck),
    /// Conversation table changed (bootstrap or new direct conversation).
    RegistryUpdated {
        shared_conversation_id: Option<String>,
        direct_conversation_ids: Vec<String>,
    },
}

/// Broadcast event stream type used by subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Errors returned by event channel operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatEventsError {
    /// The subscriber fell behind and missed events.
    #[error("event subscriber lagged by {0} events")]
    Lagged(u64),
    /// Every sender was dropped.
    #[error("event channel is closed")]
    Closed,
}

/// Cloneable event bus shared by the store and every producer.
#[derive(Clone, Debug)]
pub struct ChatEvents {
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatEvents {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; having no subscriber is not an error.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for ChatEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receive the next event, mapping broadcast failures to [`ChatEventsError`].
pub async fn next_event(stream: &mut EventStream) -> Result<ChatEvent, ChatEventsError> {
    stream.recv().await.map_err(|err| match err {
        broadcast::error::RecvError::Lagged(skipped) => ChatEventsError::Lagged(skipped),
        broadcast::error::RecvError::Closed => ChatEventsError::Closed,
    })
}
