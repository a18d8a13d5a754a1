use crate::{error::ChatError, types::SubscriptionState};

/// Lifecycle of one conversation's live subscription.
///
/// `Unattached -> Attaching -> Live -> (Error | Detached)`, with `Error` and
/// `Detached` allowed to attach again.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStateMachine {
    state: SubscriptionState,
}

impl SubscriptionStateMachine {
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        matches!(
            self.state,
            SubscriptionState::Attaching | SubscriptionState::Live
        )
    }

    /// A subscription was requested.
    pub fn begin_attach(&mut self) -> Result<SubscriptionState, ChatError> {
        self.transition_from_any_of(
            &[
                SubscriptionState::Unattached,
                SubscriptionState::Error,
                SubscriptionState::Detached,
            ],
            SubscriptionState::Attaching,
            "attach",
        )
    }

    /// A batch was merged. Returns the new state only when it changed.
    pub fn on_batch(&mut self) -> Result<Option<SubscriptionState>, ChatError> {
        match self.state {
            SubscriptionState::Live => Ok(None),
            SubscriptionState::Attaching => {
                self.state = SubscriptionState::Live;
                Ok(Some(self.state))
            }
            current => Err(ChatError::invalid_state(current, "on_batch")),
        }
    }

    /// The transport reported a fault.
    pub fn on_fault(&mut self) -> Result<SubscriptionState, ChatError> {
        self.transition_from_any_of(
            &[SubscriptionState::Attaching, SubscriptionState::Live],
            SubscriptionState::Error,
            "on_fault",
        )
    }

    /// The handle was cancelled. Detaching twice is a no-op and returns `None`.
    pub fn on_detach(&mut self) -> Option<SubscriptionState> {
        if self.state == SubscriptionState::Detached {
            return None;
        }
        self.state = SubscriptionState::Detached;
        Some(self.state)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SubscriptionState],
        next: SubscriptionState,
        action: &str,
    ) -> Result<SubscriptionState, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
