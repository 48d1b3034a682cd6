//! Settlement state machine for leased messages.
//!
//! A [`LeasedMessage`] starts in [`LeaseState::Leased`] and moves to exactly
//! one terminal state. Clones share the same state, so a message settled by
//! a handler is seen as settled by the dispatcher that delivered it.

use crate::error::MessagingError;
use crate::message::{LockToken, ReceivedMessage};
use crate::transport::TransportReceiver;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// A settlement call against a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettlementAction {
    Complete,
    Abandon,
    DeadLetter,
    Defer,
}

impl SettlementAction {
    /// State the lease ends in when the action succeeds
    pub fn terminal_state(self) -> LeaseState {
        match self {
            Self::Complete => LeaseState::Completed,
            Self::Abandon => LeaseState::Abandoned,
            Self::DeadLetter => LeaseState::DeadLettered,
            Self::Defer => LeaseState::Deferred,
        }
    }
}

impl fmt::Display for SettlementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::DeadLetter => "dead-letter",
            Self::Defer => "defer",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    Leased,
    /// A settlement call is in flight
    Settling,
    Completed,
    Abandoned,
    DeadLettered,
    Deferred,
}

impl LeaseState {
    /// Check if no further settlement is possible
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Leased | Self::Settling)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Leased => "leased",
            Self::Settling => "being settled",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::DeadLettered => "dead-lettered",
            Self::Deferred => "deferred",
        };
        write!(f, "{}", name)
    }
}

/// A received message together with the lease that must be resolved
#[derive(Clone)]
pub struct LeasedMessage {
    message: ReceivedMessage,
    lock_token: LockToken,
    state: Arc<Mutex<LeaseState>>,
    origin: Arc<dyn TransportReceiver>,
}

impl LeasedMessage {
    /// Wrap a delivery from `origin`. Deliveries without a lock token were
    /// not leased and cannot be settled.
    pub fn from_received(
        message: ReceivedMessage,
        origin: Arc<dyn TransportReceiver>,
    ) -> Result<Self, MessagingError> {
        let lock_token = message
            .lock_token
            .clone()
            .ok_or_else(|| MessagingError::Subscription {
                entity: origin.entity().to_string(),
                message: format!("message {} was delivered without a lock token", message.message_id),
            })?;

        Ok(Self {
            message,
            lock_token,
            state: Arc::new(Mutex::new(LeaseState::Leased)),
            origin,
        })
    }

    /// The delivered message
    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    /// Lock token of the lease
    pub fn lock_token(&self) -> &LockToken {
        &self.lock_token
    }

    /// Current lease state
    pub fn state(&self) -> LeaseState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if the lease reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }

    /// Remove the message from the entity
    pub async fn complete(&self) -> Result<(), MessagingError> {
        self.settle(SettlementAction::Complete, None).await
    }

    /// Release the lease so the message is redelivered
    pub async fn abandon(&self) -> Result<(), MessagingError> {
        self.settle(SettlementAction::Abandon, None).await
    }

    /// Move the message to the dead-letter queue
    pub async fn dead_letter(&self, reason: Option<&str>) -> Result<(), MessagingError> {
        self.settle(SettlementAction::DeadLetter, reason).await
    }

    /// Set the message aside; it stays retrievable by sequence number
    pub async fn defer(&self) -> Result<(), MessagingError> {
        self.settle(SettlementAction::Defer, None).await
    }

    async fn settle(
        &self,
        action: SettlementAction,
        reason: Option<&str>,
    ) -> Result<(), MessagingError> {
        self.begin_settlement(action)?;

        let result = match action {
            SettlementAction::Complete => self.origin.complete(&self.lock_token).await,
            SettlementAction::Abandon => self.origin.abandon(&self.lock_token).await,
            SettlementAction::DeadLetter => {
                self.origin.dead_letter(&self.lock_token, reason).await
            }
            SettlementAction::Defer => self.origin.defer(&self.lock_token).await,
        };

        match result {
            Ok(()) => {
                self.set_state(action.terminal_state());
                debug!(
                    message_id = %self.message.message_id,
                    lock_token = %self.lock_token,
                    action = %action,
                    "Message settled"
                );
                Ok(())
            }
            Err(err) => {
                // The broker still owns the decision; the lease may be retried
                self.set_state(LeaseState::Leased);
                Err(err.into_settlement(action, self.lock_token.as_str()))
            }
        }
    }

    fn begin_settlement(&self, action: SettlementAction) -> Result<(), MessagingError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != LeaseState::Leased {
            return Err(MessagingError::Settlement {
                action,
                lock_token: self.lock_token.to_string(),
                reason: format!("message is already {}", *state),
            });
        }
        *state = LeaseState::Settling;
        Ok(())
    }

    fn set_state(&self, next: LeaseState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl fmt::Debug for LeasedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedMessage")
            .field("message_id", &self.message.message_id)
            .field("lock_token", &self.lock_token)
            .field("state", &self.state())
            .field("entity", &self.origin.entity())
            .finish()
    }
}

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;
