use async_trait::async_trait;
use chat_core::{
    BootstrapPayload, ChatError, DirectConversation, MessageQuery, MessageRecord,
    PostMessageRequest,
};
use tokio::sync::mpsc;

/// One item of a live feed: a newest-first batch of added records, or a
/// transport fault.
pub type FeedItem = Result<Vec<MessageRecord>, ChatError>;

/// Receiving end of a live subscription. Dropping it unsubscribes.
pub type LiveFeed = mpsc::Receiver<FeedItem>;

/// Remote chat service consumed by the sync core.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Current user plus the shared and direct conversations they belong to.
    async fn bootstrap(&self) -> Result<BootstrapPayload, ChatError>;

    /// Idempotently create or look up the direct conversation with a user.
    async fn ensure_direct_chat(&self, target_user_id: &str)
    -> Result<DirectConversation, ChatError>;

    /// Create a message and return its canonical record.
    async fn post_message(&self, request: PostMessageRequest) -> Result<MessageRecord, ChatError>;

    /// Open a live feed for `query` (conversation filter, newest first, limited).
    ///
    /// The first item is the current newest page, even when empty.
    async fn subscribe(&self, query: MessageQuery) -> Result<LiveFeed, ChatError>;

    /// Fetch one newest-first page strictly older than `query.start_after`.
    async fn fetch_page(&self, query: MessageQuery) -> Result<Vec<MessageRecord>, ChatError>;
}
