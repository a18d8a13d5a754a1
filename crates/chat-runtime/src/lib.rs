//! Producers that feed the chat message store.
//!
//! The registry bootstraps conversations, the realtime subscription keeps the
//! active conversation live, the pagination cursor extends history backward
//! and the send coordinator adds optimistic messages. [`ChatSession`] wires
//! them around one shared [`chat_core::ChatStore`].

/// Remote service contract.
pub mod backend;
/// In-memory backend for tests and local runs.
pub mod memory;
/// Historical page loading.
pub mod pagination;
/// Live feed subscription per conversation.
pub mod realtime;
/// Conversation bootstrap and direct conversation lookup.
pub mod registry;
/// Optimistic sends and reconciliation.
pub mod send;
/// Composition root.
pub mod session;

use std::time::{SystemTime, UNIX_EPOCH};

pub use backend::{ChatBackend, FeedItem, LiveFeed};
pub use memory::{CallCounts, InMemoryChatBackend, text_record};
pub use pagination::{PageOutcome, PaginationCursor};
pub use realtime::{RealtimeSubscription, SubscriptionHandle};
pub use registry::{BootstrapOutcome, ChatRegistry};
pub use send::{SendCoordinator, SendTicket};
pub use session::ChatSession;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
