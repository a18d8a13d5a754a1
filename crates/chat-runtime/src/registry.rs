use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chat_core::{
    BootstrapPayload, ChatError, ChatEvent, ChatEvents, ChatUser, Conversation, DirectConversation,
};
use tracing::{debug, info, warn};

use crate::{backend::ChatBackend, now_ms};

/// Result of a bootstrap request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Fetched and applied a fresh payload.
    Loaded,
    /// Already bootstrapped this session and not forced.
    AlreadyLoaded,
    /// Another bootstrap is running; no second fetch was issued.
    InFlight,
    /// A forced bootstrap started while this one was running and won.
    Superseded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    InFlight,
    Ready,
}

#[derive(Debug, Default)]
struct RegistryState {
    phase: Phase,
    generation: u64,
    user: Option<ChatUser>,
    shared_conversation_id: Option<String>,
    direct_conversation_ids: Vec<String>,
    conversations: HashMap<String, Conversation>,
    direct_by_target: HashMap<String, String>,
}

impl RegistryState {
    fn apply(&mut self, payload: BootstrapPayload) {
        let BootstrapPayload {
            user,
            shared_conversation,
            direct_conversations,
        } = payload;

        self.user = Some(user);
        self.shared_conversation_id = Some(shared_conversation.id.clone());
        self.direct_conversation_ids = direct_conversations
            .iter()
            .map(|conversation| conversation.id.clone())
            .collect();

        // records are kept as first discovered
        for conversation in std::iter::once(shared_conversation).chain(direct_conversations) {
            self.conversations
                .entry(conversation.id.clone())
                .or_insert(conversation);
        }
        self.phase = Phase::Ready;
    }

    fn updated_event(&self) -> ChatEvent {
        ChatEvent::RegistryUpdated {
            shared_conversation_id: self.shared_conversation_id.clone(),
            direct_conversation_ids: self.direct_conversation_ids.clone(),
        }
    }
}

/// Conversation table for the current user.
pub struct ChatRegistry {
    backend: Arc<dyn ChatBackend>,
    events: ChatEvents,
    state: Mutex<RegistryState>,
}

impl ChatRegistry {
    pub fn new(backend: Arc<dyn ChatBackend>, events: ChatEvents) -> Self {
        Self {
            backend,
            events,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Fetch the user and their conversations.
    ///
    /// Runs once per session unless `force` is set. A non-forced call while a
    /// bootstrap is in flight returns [`BootstrapOutcome::InFlight`] without a
    /// second fetch. On failure the registry keeps whatever it had loaded
    /// before.
    pub async fn bootstrap(&self, force: bool) -> Result<BootstrapOutcome, ChatError> {
        let generation = {
            let mut state = self.lock();
            match (state.phase, force) {
                (Phase::InFlight, false) => {
                    debug!("bootstrap already in flight");
                    return Ok(BootstrapOutcome::InFlight);
                }
                (Phase::Ready, false) => return Ok(BootstrapOutcome::AlreadyLoaded),
                _ => {}
            }
            state.phase = Phase::InFlight;
            state.generation += 1;
            state.generation
        };

        info!(generation, force, "bootstrapping chat registry");
        let result = self.backend.bootstrap().await;

        let event = {
            let mut state = self.lock();
            if state.generation != generation {
                debug!(generation, "discarding superseded bootstrap result");
                return Ok(BootstrapOutcome::Superseded);
            }
            match result {
                Ok(payload) => {
                    state.apply(payload);
                    info!(
                        shared = ?state.shared_conversation_id,
                        direct_count = state.direct_conversation_ids.len(),
                        "chat registry bootstrapped"
                    );
                    state.updated_event()
                }
                Err(err) => {
                    state.phase = if state.user.is_some() {
                        Phase::Ready
                    } else {
                        Phase::Idle
                    };
                    warn!(error = %err, "chat registry bootstrap failed");
                    return Err(err);
                }
            }
        };

        self.events.emit(event);
        Ok(BootstrapOutcome::Loaded)
    }

    /// Return the direct conversation with `target_user_id`, creating it if
    /// needed. Repeat calls are answered locally with `created == false`.
    pub async fn ensure_direct_conversation(
        &self,
        target_user_id: &str,
    ) -> Result<DirectConversation, ChatError> {
        let target_user_id = target_user_id.trim();
        if target_user_id.is_empty() {
            return Err(ChatError::config(
                "invalid_target_user",
                "target user id must not be empty",
            ));
        }

        let known = self.lock().direct_by_target.get(target_user_id).cloned();
        if let Some(chat_id) = known {
            return Ok(DirectConversation {
                chat_id,
                created: false,
            });
        }

        let response = self.backend.ensure_direct_chat(target_user_id).await?;

        let event = {
            let mut state = self.lock();
            state
                .direct_by_target
                .insert(target_user_id.to_owned(), response.chat_id.clone());
            state
                .conversations
                .entry(response.chat_id.clone())
                .or_insert_with(|| {
                    Conversation::direct_placeholder(response.chat_id.clone(), now_ms())
                });
            if !state.direct_conversation_ids.contains(&response.chat_id) {
                state.direct_conversation_ids.push(response.chat_id.clone());
            }
            state.updated_event()
        };

        info!(
            chat_id = %response.chat_id,
            created = response.created,
            "direct conversation ensured"
        );
        self.events.emit(event);
        Ok(response)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.lock().user.is_some()
    }

    pub fn current_user(&self) -> Option<ChatUser> {
        self.lock().user.clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.lock().user.as_ref().map(|user| user.id.clone())
    }

    pub fn shared_conversation_id(&self) -> Option<String> {
        self.lock().shared_conversation_id.clone()
    }

    /// Direct conversation ids in backend order, followed by ones ensured later.
    pub fn direct_conversation_ids(&self) -> Vec<String> {
        self.lock().direct_conversation_ids.clone()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock().conversations.get(conversation_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
