use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chat_core::{
    ChatError, ChatEvents, ChatStore, ConversationSlice, DirectConversation, EventStream,
    RuntimeConfig, SubscriptionState,
};
use tracing::{debug, info};

use crate::{
    backend::ChatBackend,
    pagination::{PageOutcome, PaginationCursor},
    realtime::{RealtimeSubscription, SubscriptionHandle},
    registry::{BootstrapOutcome, ChatRegistry},
    send::{SendCoordinator, SendTicket},
};

/// Owns the message store and the producers that write to it.
///
/// The store lives exactly as long as the session. Dropping the session
/// detaches the active live feed; in-flight sends and page fetches still
/// settle into the store through their own handles.
pub struct ChatSession {
    events: ChatEvents,
    store: Arc<ChatStore>,
    registry: Arc<ChatRegistry>,
    realtime: RealtimeSubscription,
    pagination: PaginationCursor,
    sender: SendCoordinator,
    active: Mutex<Option<SubscriptionHandle>>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, config: RuntimeConfig) -> Self {
        let events = ChatEvents::new(config.event_buffer);
        let store = Arc::new(ChatStore::new(events.clone()));
        let registry = Arc::new(ChatRegistry::new(Arc::clone(&backend), events.clone()));
        let realtime =
            RealtimeSubscription::new(Arc::clone(&backend), Arc::clone(&store), config.clone());
        let pagination =
            PaginationCursor::new(Arc::clone(&backend), Arc::clone(&store), config.page_size);
        let sender = SendCoordinator::new(backend, Arc::clone(&store), Arc::clone(&registry));

        Self {
            events,
            store,
            registry,
            realtime,
            pagination,
            sender,
            active: Mutex::new(None),
        }
    }

    pub async fn bootstrap(&self, force: bool) -> Result<BootstrapOutcome, ChatError> {
        self.registry.bootstrap(force).await
    }

    pub async fn ensure_direct_conversation(
        &self,
        target_user_id: &str,
    ) -> Result<DirectConversation, ChatError> {
        self.registry.ensure_direct_conversation(target_user_id).await
    }

    /// Make `conversation_id` the live conversation.
    ///
    /// Cancels the previous subscription handle once and attaches a new one.
    /// Returns `false` when the conversation is already the live one. A feed
    /// that stopped in the error state is replaced by a fresh attach.
    pub fn select_conversation(&self, conversation_id: &str) -> bool {
        let mut active = self.lock_active();
        if let Some(current) = active.as_ref()
            && current.conversation_id() == conversation_id
            && !current.is_cancelled()
            && !current.is_finished()
            && self.store.subscription_state(conversation_id) != SubscriptionState::Error
        {
            debug!(%conversation_id, "conversation already active");
            return false;
        }

        if let Some(previous) = active.take() {
            previous.cancel();
        }
        info!(%conversation_id, "switching active conversation");
        *active = Some(self.realtime.attach(conversation_id));
        true
    }

    pub fn active_conversation_id(&self) -> Option<String> {
        self.lock_active()
            .as_ref()
            .map(|handle| handle.conversation_id().to_owned())
    }

    /// Cancel the active live feed. Returns `false` when none was active.
    pub fn detach(&self) -> bool {
        match self.lock_active().take() {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    pub async fn load_older(&self, conversation_id: &str) -> PageOutcome {
        self.pagination.load_older(conversation_id).await
    }

    /// See [`SendCoordinator::send`].
    pub fn send(&self, conversation_id: &str, content: &str) -> Option<SendTicket> {
        self.sender.send(conversation_id, content)
    }

    pub fn retry_send(&self, conversation_id: &str, message_id: &str) -> Option<SendTicket> {
        self.sender.retry(conversation_id, message_id)
    }

    pub fn slice(&self, conversation_id: &str) -> ConversationSlice {
        self.store.slice(conversation_id)
    }

    pub fn error(&self, conversation_id: &str) -> Option<ChatError> {
        self.store.error(conversation_id)
    }

    pub fn subscription_state(&self, conversation_id: &str) -> SubscriptionState {
        self.store.subscription_state(conversation_id)
    }

    pub fn has_more_history(&self, conversation_id: &str) -> bool {
        self.store.has_more_history(conversation_id)
    }

    /// Subscribe to store and registry events.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ChatRegistry> {
        &self.registry
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if self.detach() {
            debug!("chat session dropped with an active conversation");
        }
    }
}
