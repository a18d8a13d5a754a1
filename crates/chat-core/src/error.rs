use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SubscriptionState;

/// What went wrong, coarse enough to drive retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Bad input or an unknown conversation.
    Config,
    Auth,
    /// Transport dropped or the backend was unavailable.
    Network,
    RateLimited,
    /// Backend payload could not be decoded.
    Serialization,
    Internal,
}

impl ChatErrorCategory {
    /// Transport-level categories where the same request may succeed later.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Network | Self::RateLimited)
    }
}

/// Fault recorded against one conversation.
///
/// Live feed, page and send faults are kept as values on the conversation and
/// published as events; they never abort the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{code} ({category:?}): {message}")]
#[serde(rename_all = "camelCase")]
pub struct ChatError {
    pub category: ChatErrorCategory,
    /// Stable machine code, e.g. `live_feed_closed`.
    pub code: String,
    pub message: String,
    /// Server-provided wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Network, code, message)
    }

    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Config, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Internal, code, message)
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// A live subscription event arrived in a state that cannot accept it.
    pub fn invalid_state(current: SubscriptionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::internal(
            "invalid_state_transition",
            format!("subscription cannot handle '{action}' while {current:?}"),
        )
    }

    pub fn is_recoverable(&self) -> bool {
        self.category.is_recoverable()
    }
}
