use std::sync::Arc;

use chat_core::{
    ChatError, ChatStore, Message, MessageKind, PostMessageRequest, SendOutcome, TEMP_ID_PREFIX,
    normalize_record, normalize_send_outcome,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{backend::ChatBackend, now_ms, registry::ChatRegistry};

/// A send in progress.
#[derive(Debug)]
pub struct SendTicket {
    temp_id: String,
    task: JoinHandle<SendOutcome>,
}

impl SendTicket {
    /// Id of the placeholder this send created or retried.
    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    /// Wait for the post to settle.
    pub async fn outcome(self) -> SendOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => SendOutcome::Failure {
                error: ChatError::internal("send_task_failed", err.to_string()),
            },
        }
    }
}

/// Inserts optimistic placeholders and reconciles them with the server.
pub struct SendCoordinator {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ChatStore>,
    registry: Arc<ChatRegistry>,
}

impl SendCoordinator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<ChatStore>,
        registry: Arc<ChatRegistry>,
    ) -> Self {
        Self {
            backend,
            store,
            registry,
        }
    }

    /// Send `content` to `conversation_id`.
    ///
    /// The pending placeholder is in the store when this returns. Returns
    /// `None` for blank content. Must be called from within a tokio runtime.
    pub fn send(&self, conversation_id: &str, content: &str) -> Option<SendTicket> {
        if content.trim().is_empty() {
            debug!(%conversation_id, "ignoring blank message");
            return None;
        }

        let placeholder = Message {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_owned(),
            sender_id: self.registry.current_user_id().unwrap_or_default(),
            content: content.to_owned(),
            kind: MessageKind::Text,
            timestamp_ms: now_ms(),
            pending: true,
            error: false,
            sample: false,
        };
        self.store.insert_optimistic(conversation_id, placeholder.clone());
        debug!(%conversation_id, temp_id = %placeholder.id, "optimistic message inserted");

        Some(self.dispatch(placeholder))
    }

    /// Send a failed message again under the same id.
    ///
    /// Returns `None` when `message_id` is not a failed message of the
    /// conversation.
    pub fn retry(&self, conversation_id: &str, message_id: &str) -> Option<SendTicket> {
        let Some(placeholder) = self.store.mark_retrying(conversation_id, message_id) else {
            debug!(%conversation_id, %message_id, "nothing to retry");
            return None;
        };
        info!(%conversation_id, temp_id = %placeholder.id, "retrying failed send");
        Some(self.dispatch(placeholder))
    }

    fn dispatch(&self, placeholder: Message) -> SendTicket {
        let temp_id = placeholder.id.clone();
        let task = tokio::spawn(post(
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            placeholder,
        ));
        SendTicket { temp_id, task }
    }
}

async fn post(
    backend: Arc<dyn ChatBackend>,
    store: Arc<ChatStore>,
    placeholder: Message,
) -> SendOutcome {
    let conversation_id = placeholder.conversation_id.clone();
    let request = PostMessageRequest {
        chat_id: conversation_id.clone(),
        content: placeholder.content.clone(),
        kind: placeholder.kind,
    };

    let outcome = match backend.post_message(request).await {
        Ok(record) => {
            let canonical = normalize_record(record);
            let message_id = canonical.id.clone();
            if !store.reconcile(&conversation_id, canonical, &placeholder.id) {
                debug!(%conversation_id, temp_id = %placeholder.id, "placeholder already gone");
            }
            info!(%conversation_id, temp_id = %placeholder.id, %message_id, "message sent");
            SendOutcome::Success { message_id }
        }
        Err(error) => {
            warn!(
                %conversation_id,
                temp_id = %placeholder.id,
                error = %error,
                "message send failed"
            );
            store.mark_failed(&conversation_id, placeholder.clone());
            SendOutcome::Failure { error }
        }
    };

    store
        .events()
        .emit(normalize_send_outcome(&conversation_id, &placeholder.id, &outcome));
    outcome
}
