//! Broker-facing collaborator surface.
//!
//! These traits are what a broker client library must provide: handles for
//! sending and receiving on an entity, settlement by lock token, and session
//! acceptance. The runtime adds validation, retry, batching and settlement
//! bookkeeping on top. [`crate::providers::memory::InMemoryBroker`] is the
//! bundled implementation.

use crate::batch::MessageBatch;
use crate::connection::Credential;
use crate::error::MessagingError;
use crate::message::{LockToken, PeekOptions, ReceiveOptions, ReceivedMessage, SendOptions, WireEnvelope};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Addressable broker entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityPath {
    Queue(String),
    Topic(String),
    Subscription { topic: String, subscription: String },
}

impl EntityPath {
    /// Canonical entity path as the broker names it
    pub fn key(&self) -> String {
        match self {
            Self::Queue(name) | Self::Topic(name) => name.clone(),
            Self::Subscription {
                topic,
                subscription,
            } => format!("{}/subscriptions/{}", topic, subscription),
        }
    }

    /// Check if messages can be sent to this entity
    pub fn accepts_sends(&self) -> bool {
        !matches!(self, Self::Subscription { .. })
    }

    /// Check if messages can be received from this entity
    pub fn accepts_receives(&self) -> bool {
        !matches!(self, Self::Topic(_))
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Send handle bound to one queue or topic
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Path of the entity this handle sends to
    fn entity(&self) -> &str;

    /// Create an empty batch sized to the broker's limit
    async fn create_message_batch(&self) -> Result<MessageBatch, MessagingError>;

    /// Transmit one envelope
    async fn send_message(
        &self,
        envelope: &WireEnvelope,
        options: &SendOptions,
    ) -> Result<(), MessagingError>;

    /// Transmit every envelope of a batch in one round trip
    async fn send_batch(
        &self,
        batch: &MessageBatch,
        options: &SendOptions,
    ) -> Result<(), MessagingError>;

    /// Release the handle
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Receive handle bound to one queue, subscription or session
#[async_trait]
pub trait TransportReceiver: Send + Sync {
    /// Path of the entity this handle receives from
    fn entity(&self) -> &str;

    /// Session the handle is locked to, if any
    fn session_id(&self) -> Option<&str>;

    /// Lease up to `max_messages` messages
    async fn receive_messages(
        &self,
        max_messages: usize,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, MessagingError>;

    /// Read up to `max_messages` messages without leasing them
    async fn peek_messages(
        &self,
        max_messages: usize,
        options: &PeekOptions,
    ) -> Result<Vec<ReceivedMessage>, MessagingError>;

    /// Lease previously deferred messages by sequence number
    async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>, MessagingError>;

    async fn complete(&self, lock_token: &LockToken) -> Result<(), MessagingError>;

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), MessagingError>;

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: Option<&str>,
    ) -> Result<(), MessagingError>;

    async fn defer(&self, lock_token: &LockToken) -> Result<(), MessagingError>;

    /// Release the handle and any session lock it holds
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Shared connection to a broker namespace
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn create_sender(
        &self,
        entity: &EntityPath,
    ) -> Result<Arc<dyn TransportSender>, MessagingError>;

    async fn create_receiver(
        &self,
        entity: &EntityPath,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError>;

    /// Lock a specific session for exclusive receiving
    async fn accept_session(
        &self,
        entity: &EntityPath,
        session_id: &str,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError>;

    /// Lock whichever session the broker picks
    async fn accept_next_session(
        &self,
        entity: &EntityPath,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// Opens broker clients from resolved credentials
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, credential: &Credential)
        -> Result<Arc<dyn BrokerClient>, MessagingError>;
}

/// Bound a transport call by an optional per-attempt timeout.
pub(crate) async fn bounded<T, F>(timeout: Option<Duration>, call: F) -> Result<T, MessagingError>
where
    F: Future<Output = Result<T, MessagingError>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, call)
            .await
            .map_err(|_| MessagingError::Timeout { duration })?,
        None => call.await,
    }
}
