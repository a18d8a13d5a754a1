//! Core of the realtime chat sync layer.
//!
//! This crate defines the wire records exchanged with the chat backend, the
//! per-conversation message slice and its merge rules, the shared message
//! store, the live subscription lifecycle, and common error/event types.

/// Broadcast event bus for UI consumers.
pub mod channel;
/// Conversation-scoped error values and HTTP classification helpers.
pub mod error;
/// Record normalization helpers (pages, send acknowledgements).
pub mod normalization;
/// Backoff policy used by live feed reattach loops.
pub mod retry;
/// Ordered per-conversation message slice with a pure merge.
pub mod slice;
/// Live subscription lifecycle state machine.
pub mod state_machine;
/// Shared conversation-keyed store.
pub mod store;
/// Wire records, queries and runtime configuration.
pub mod types;

pub use channel::{ChatEvent, ChatEvents, ChatEventsError, EventStream, next_event};
pub use error::{ChatError, ChatErrorCategory};
pub use normalization::{SendOutcome, normalize_page, normalize_record, normalize_send_outcome};
pub use retry::RetryPolicy;
pub use slice::{ConversationSlice, MergeStats};
pub use state_machine::SubscriptionStateMachine;
pub use store::{ChatStore, PageStart};
pub use types::{
    BootstrapPayload, ChatUser, Conversation, ConversationKind, DEFAULT_PAGE_SIZE,
    DirectConversation, Message, MessageKind, MessageQuery, MessageRecord, PageCursor,
    PostMessageRequest, RuntimeConfig, SendAck, SortOrder, SubscriptionState, TEMP_ID_PREFIX,
};
