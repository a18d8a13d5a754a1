//! Shared per-conversation message store.
//!
//! Every mutation runs as one read-compute-commit step under a single write
//! lock, so interleaved completions from the live feed, pagination and sends
//! can never overwrite each other's updates. Events are emitted after the lock
//! is released.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use tracing::{debug, warn};

use crate::{
    channel::{ChatEvent, ChatEvents},
    error::ChatError,
    slice::{ConversationSlice, MergeStats},
    state_machine::SubscriptionStateMachine,
    types::{Message, PageCursor, SubscriptionState},
};

/// Result of trying to start a historical page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStart {
    /// No live page has loaded yet, so there is nothing to page from.
    NoCursor,
    /// An earlier page came back short.
    Exhausted,
    /// Another page fetch for the conversation is outstanding.
    InFlight,
    /// Fetch may proceed from this cursor.
    Ready(PageCursor),
}

#[derive(Debug, Default)]
struct ConversationState {
    slice: ConversationSlice,
    cursor: Option<PageCursor>,
    history_exhausted: bool,
    page_in_flight: bool,
    subscription: SubscriptionStateMachine,
    attach_epoch: u64,
    error: Option<ChatError>,
}

impl ConversationState {
    fn merge(
        &mut self,
        conversation_id: &str,
        messages: &[Message],
        prepend: bool,
        events: &mut Vec<ChatEvent>,
    ) -> MergeStats {
        let stats = self.slice.merge(messages, prepend);
        if stats.changed() {
            events.push(self.slice_event(conversation_id));
        }
        stats
    }

    fn slice_event(&self, conversation_id: &str) -> ChatEvent {
        ChatEvent::SliceUpdated {
            conversation_id: conversation_id.to_owned(),
            len: self.slice.len(),
        }
    }

    fn advance_cursor(&mut self, oldest: Option<PageCursor>) {
        let Some(oldest) = oldest else {
            return;
        };
        self.cursor = Some(match self.cursor.take() {
            Some(current) => current.older_of(oldest),
            None => oldest,
        });
    }

    fn record_error(
        &mut self,
        conversation_id: &str,
        error: ChatError,
        events: &mut Vec<ChatEvent>,
    ) {
        self.error = Some(error.clone());
        events.push(ChatEvent::ConversationError {
            conversation_id: conversation_id.to_owned(),
            error,
        });
    }
}

fn state_event(conversation_id: &str, state: SubscriptionState) -> ChatEvent {
    ChatEvent::SubscriptionStateChanged {
        conversation_id: conversation_id.to_owned(),
        state,
    }
}

/// Conversation-keyed store shared by every producer.
///
/// Owned by the chat session and handed to producers behind an `Arc`; lives as
/// long as the session that created it.
#[derive(Debug)]
pub struct ChatStore {
    conversations: RwLock<HashMap<String, ConversationState>>,
    events: ChatEvents,
}

impl ChatStore {
    pub fn new(events: ChatEvents) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Event bus this store publishes to.
    pub fn events(&self) -> &ChatEvents {
        &self.events
    }

    /// Upsert messages into a conversation slice.
    pub fn merge(&self, conversation_id: &str, messages: &[Message], prepend: bool) -> MergeStats {
        self.update(conversation_id, |state, events| {
            state.merge(conversation_id, messages, prepend, events)
        })
    }

    /// Insert a locally created pending message.
    pub fn insert_optimistic(&self, conversation_id: &str, placeholder: Message) -> MergeStats {
        debug_assert!(placeholder.pending, "optimistic messages must be pending");
        self.merge(conversation_id, std::slice::from_ref(&placeholder), false)
    }

    /// Replace a placeholder with its server-confirmed record.
    ///
    /// Returns `true` when the placeholder was still present.
    pub fn reconcile(
        &self,
        conversation_id: &str,
        canonical: Message,
        placeholder_id: &str,
    ) -> bool {
        self.update(conversation_id, |state, events| {
            let removed = state.slice.reconcile(canonical, placeholder_id);
            events.push(state.slice_event(conversation_id));
            removed
        })
    }

    /// Turn a placeholder into a terminal failed record, keeping its content.
    ///
    /// The record is upserted, so it is re-inserted if the placeholder is gone.
    pub fn mark_failed(&self, conversation_id: &str, mut failed: Message) {
        failed.pending = false;
        failed.error = true;
        self.merge(conversation_id, std::slice::from_ref(&failed), false);
    }

    /// Flip a failed message back to pending so it can be sent again.
    ///
    /// Returns the updated message, or `None` when the id is unknown or the
    /// message is not in the failed state.
    pub fn mark_retrying(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.update(conversation_id, |state, events| {
            let mut message = state.slice.get(message_id).filter(|m| m.error)?.clone();
            message.pending = true;
            message.error = false;
            state.merge(conversation_id, std::slice::from_ref(&message), false, events);
            Some(message)
        })
    }

    /// Snapshot of a conversation slice; empty when nothing was loaded yet.
    pub fn slice(&self, conversation_id: &str) -> ConversationSlice {
        self.read(conversation_id, |state| state.slice.clone())
            .unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.read(conversation_id, |state| state.slice.get(message_id).cloned())
            .flatten()
    }

    /// Last conversation-scoped fault, if any.
    pub fn error(&self, conversation_id: &str) -> Option<ChatError> {
        self.read(conversation_id, |state| state.error.clone())
            .flatten()
    }

    /// Oldest record observed so far, used as the next page's exclusive bound.
    pub fn cursor(&self, conversation_id: &str) -> Option<PageCursor> {
        self.read(conversation_id, |state| state.cursor.clone())
            .flatten()
    }

    /// A cursor was recorded and no page has come back short yet.
    pub fn has_more_history(&self, conversation_id: &str) -> bool {
        self.read(conversation_id, |state| {
            state.cursor.is_some() && !state.history_exhausted
        })
        .unwrap_or(false)
    }

    pub fn subscription_state(&self, conversation_id: &str) -> SubscriptionState {
        self.read(conversation_id, |state| state.subscription.state())
            .unwrap_or_default()
    }

    /// Atomically check whether a page fetch may start and claim it.
    pub fn begin_page(&self, conversation_id: &str) -> PageStart {
        self.update(conversation_id, |state, _| {
            if state.page_in_flight {
                return PageStart::InFlight;
            }
            let Some(cursor) = state.cursor.clone() else {
                return PageStart::NoCursor;
            };
            if state.history_exhausted {
                return PageStart::Exhausted;
            }
            state.page_in_flight = true;
            PageStart::Ready(cursor)
        })
    }

    /// Merge a fetched page, move the cursor and release the in-flight claim.
    pub fn complete_page(
        &self,
        conversation_id: &str,
        messages: &[Message],
        oldest: Option<PageCursor>,
        exhausted: bool,
    ) -> MergeStats {
        self.update(conversation_id, |state, events| {
            state.page_in_flight = false;
            state.history_exhausted |= exhausted;
            state.advance_cursor(oldest);
            state.merge(conversation_id, messages, true, events)
        })
    }

    /// Record a page fault and release the in-flight claim. Merged messages stay.
    pub fn fail_page(&self, conversation_id: &str, error: ChatError) {
        self.update(conversation_id, |state, events| {
            state.page_in_flight = false;
            state.record_error(conversation_id, error, events);
        });
    }

    /// Release the in-flight claim of a fetch that was dropped before finishing.
    pub fn abandon_page(&self, conversation_id: &str) {
        self.update(conversation_id, |state, _| state.page_in_flight = false);
    }

    /// Start a new live attach and return its epoch.
    ///
    /// A previous attach that was never detached is detached first.
    pub fn begin_attach(&self, conversation_id: &str) -> u64 {
        self.update(conversation_id, |state, events| {
            state.attach_epoch += 1;
            if state.subscription.is_attached() {
                warn!(
                    %conversation_id,
                    "attaching over a live subscription; detaching the old one"
                );
                if let Some(detached) = state.subscription.on_detach() {
                    events.push(state_event(conversation_id, detached));
                }
            }
            match state.subscription.begin_attach() {
                Ok(next) => events.push(state_event(conversation_id, next)),
                Err(err) => warn!(%conversation_id, error = %err, "attach transition rejected"),
            }
            state.attach_epoch
        })
    }

    /// Merge one live batch.
    ///
    /// Messages are always merged. Lifecycle and error state only follow
    /// batches from the current attach epoch.
    pub fn apply_live_batch(
        &self,
        conversation_id: &str,
        epoch: u64,
        messages: &[Message],
        oldest: Option<PageCursor>,
    ) -> MergeStats {
        self.update(conversation_id, |state, events| {
            state.advance_cursor(oldest);
            let stats = state.merge(conversation_id, messages, false, events);
            if state.attach_epoch == epoch {
                match state.subscription.on_batch() {
                    Ok(Some(next)) => {
                        state.error = None;
                        events.push(state_event(conversation_id, next));
                    }
                    Ok(None) => {}
                    Err(err) => debug!(%conversation_id, error = %err, "batch after detach"),
                }
            }
            stats
        })
    }

    /// Record a live transport fault. Returns `false` for stale epochs.
    pub fn subscription_fault(&self, conversation_id: &str, epoch: u64, error: ChatError) -> bool {
        self.update(conversation_id, |state, events| {
            if state.attach_epoch != epoch {
                return false;
            }
            match state.subscription.on_fault() {
                Ok(next) => {
                    events.push(state_event(conversation_id, next));
                    state.record_error(conversation_id, error, events);
                    true
                }
                Err(err) => {
                    debug!(%conversation_id, error = %err, "fault after detach ignored");
                    false
                }
            }
        })
    }

    /// Move a faulted subscription back to attaching. Returns `false` for
    /// stale epochs or when the subscription is no longer in the error state.
    pub fn reattach(&self, conversation_id: &str, epoch: u64) -> bool {
        self.update(conversation_id, |state, events| {
            if state.attach_epoch != epoch
                || state.subscription.state() != SubscriptionState::Error
            {
                return false;
            }
            match state.subscription.begin_attach() {
                Ok(next) => {
                    events.push(state_event(conversation_id, next));
                    true
                }
                Err(_) => false,
            }
        })
    }

    /// Mark the subscription of `epoch` detached. A repeat is a no-op.
    pub fn detach(&self, conversation_id: &str, epoch: u64) -> bool {
        self.update(conversation_id, |state, events| {
            if state.attach_epoch != epoch {
                return false;
            }
            match state.subscription.on_detach() {
                Some(next) => {
                    events.push(state_event(conversation_id, next));
                    true
                }
                None => false,
            }
        })
    }

    fn update<R>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut ConversationState, &mut Vec<ChatEvent>) -> R,
    ) -> R {
        let mut pending = Vec::new();
        let result = {
            let mut conversations = self
                .conversations
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let state = conversations.entry(conversation_id.to_owned()).or_default();
            f(state, &mut pending)
        };
        for event in pending {
            self.events.emit(event);
        }
        result
    }

    fn read<R>(&self, conversation_id: &str, f: impl FnOnce(&ConversationState) -> R) -> Option<R> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        conversations.get(conversation_id).map(f)
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new(ChatEvents::default())
    }
}
