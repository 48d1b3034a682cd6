//! In-memory broker implementation for testing and development.
//!
//! This module provides a complete in-memory broker that:
//! - Supports queues, and topics fanning out to subscriptions
//! - Leases messages under lock tokens that expire
//! - Implements complete, abandon, dead-letter and defer settlement
//! - Dead-letters messages that exceed the maximum delivery count
//! - Enforces exclusive session locks
//!
//! It also records what crossed the transport boundary (connections,
//! transmissions, handle closes) and can inject send, receive and close failures,
//! so tests can assert on broker-side effects.

use crate::admin::{AdminConnector, AdminTransport, SubscriptionDetails};
use crate::batch::MessageBatch;
use crate::connection::Credential;
use crate::error::{ConfigurationError, MessagingError};
use crate::lease::SettlementAction;
use crate::message::{
    LockToken, MessageId, PeekOptions, ReceiveOptions, ReceivedMessage, SendOptions, WireEnvelope,
};
use crate::transport::{BrokerClient, BrokerConnector, EntityPath, TransportReceiver, TransportSender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Reason recorded when a message is dead-lettered for too many deliveries
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

// ============================================================================
// Configuration and Records
// ============================================================================

/// Limits of the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryBrokerConfig {
    /// Capacity of batches handed out by senders
    pub max_batch_size_bytes: usize,

    /// How long a lease lasts before the message becomes available again
    pub lock_duration: Duration,

    /// Deliveries after which an abandoned message is dead-lettered
    pub max_delivery_count: u32,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_batch_size_bytes: 256 * 1024,
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
        }
    }
}

/// A handle release observed by the broker, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    SenderClosed {
        entity: String,
    },
    ReceiverClosed {
        entity: String,
        session_id: Option<String>,
    },
    ClientClosed,
}

/// One successful broker round trip carrying messages
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub entity: String,
    pub envelopes: Vec<WireEnvelope>,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    sequence_number: i64,
    envelope: WireEnvelope,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
    dead_letter_reason: Option<String>,
}

impl StoredMessage {
    fn to_received(
        &self,
        lock_token: Option<LockToken>,
        locked_until: Option<DateTime<Utc>>,
    ) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            sequence_number: self.sequence_number,
            envelope: self.envelope.clone(),
            lock_token,
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
            locked_until,
            dead_letter_reason: self.dead_letter_reason.clone(),
        }
    }

    fn in_session(&self, session_id: Option<&str>) -> bool {
        match session_id {
            Some(session_id) => self.envelope.session_id.as_deref() == Some(session_id),
            None => true,
        }
    }
}

struct Lease {
    message: StoredMessage,
    expires_at: Instant,
    owner: u64,
}

/// State of one queue or subscription
struct EntityStore {
    requires_session: bool,
    ready: BTreeMap<i64, StoredMessage>,
    locked: HashMap<LockToken, Lease>,
    deferred: BTreeMap<i64, StoredMessage>,
    dead_letters: Vec<StoredMessage>,
    /// Session id to owning receiver handle
    session_locks: HashMap<String, u64>,
}

impl EntityStore {
    fn new(requires_session: bool) -> Self {
        Self {
            requires_session,
            ready: BTreeMap::new(),
            locked: HashMap::new(),
            deferred: BTreeMap::new(),
            dead_letters: Vec::new(),
            session_locks: HashMap::new(),
        }
    }

    /// Return expired leases to the entity
    fn release_expired(&mut self, now: Instant, max_delivery_count: u32) {
        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(lease) = self.locked.remove(&token) {
                self.requeue(lease.message, max_delivery_count);
            }
        }
    }

    fn requeue(&mut self, mut message: StoredMessage, max_delivery_count: u32) {
        if message.delivery_count >= max_delivery_count {
            message.dead_letter_reason = Some(MAX_DELIVERY_COUNT_EXCEEDED.to_string());
            self.dead_letters.push(message);
        } else {
            self.ready.insert(message.sequence_number, message);
        }
    }

    fn take_ready(&mut self, max_messages: usize, session_id: Option<&str>) -> Vec<StoredMessage> {
        let keys: Vec<i64> = self
            .ready
            .values()
            .filter(|message| message.in_session(session_id))
            .take(max_messages)
            .map(|message| message.sequence_number)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.ready.remove(&key))
            .collect()
    }

    fn lease(
        &mut self,
        mut message: StoredMessage,
        owner: u64,
        lock_duration: Duration,
        now: Instant,
    ) -> ReceivedMessage {
        message.delivery_count += 1;
        let lock_token = LockToken::new();
        let locked_until = chrono::Duration::from_std(lock_duration)
            .ok()
            .map(|duration| Utc::now() + duration);
        let received = message.to_received(Some(lock_token.clone()), locked_until);

        self.locked.insert(
            lock_token,
            Lease {
                message,
                expires_at: now + lock_duration,
                owner,
            },
        );
        received
    }

    fn release_owner(&mut self, owner: u64, session_id: Option<&str>) {
        if let Some(session_id) = session_id {
            if self.session_locks.get(session_id) == Some(&owner) {
                self.session_locks.remove(session_id);
            }
        }

        let owned: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, lease)| lease.owner == owner)
            .map(|(token, _)| token.clone())
            .collect();

        for token in owned {
            if let Some(lease) = self.locked.remove(&token) {
                self.ready
                    .insert(lease.message.sequence_number, lease.message);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    entities: HashMap<String, EntityStore>,
    topics: HashMap<String, Vec<String>>,
    next_sequence_number: i64,
    next_handle_id: u64,
    connections: Vec<Credential>,
    events: Vec<HandleEvent>,
    transmissions: Vec<Transmission>,
    send_attempts: u32,
    failing_sends: u32,
    failing_receives: u32,
    failing_closes: u32,
}

impl BrokerState {
    fn entity_mut(&mut self, key: &str) -> Result<&mut EntityStore, MessagingError> {
        self.entities
            .get_mut(key)
            .ok_or_else(|| MessagingError::EntityNotFound {
                entity: key.to_string(),
            })
    }

    fn entity(&self, key: &str) -> Result<&EntityStore, MessagingError> {
        self.entities
            .get(key)
            .ok_or_else(|| MessagingError::EntityNotFound {
                entity: key.to_string(),
            })
    }

    fn next_sequence_number(&mut self) -> i64 {
        self.next_sequence_number += 1;
        self.next_sequence_number
    }

    fn next_handle_id(&mut self) -> u64 {
        self.next_handle_id += 1;
        self.next_handle_id
    }

    /// Resolve the receivable entity behind `path`, creating queues on demand
    fn receivable_key(&mut self, path: &EntityPath) -> Result<String, MessagingError> {
        match path {
            EntityPath::Queue(name) => {
                self.entities
                    .entry(name.clone())
                    .or_insert_with(|| EntityStore::new(false));
                Ok(name.clone())
            }
            EntityPath::Subscription { .. } => {
                let key = path.key();
                self.entity(&key)?;
                Ok(key)
            }
            EntityPath::Topic(name) => Err(ConfigurationError::Invalid {
                message: format!("cannot receive from topic '{}'", name),
            }
            .into()),
        }
    }
}

// ============================================================================
// In-Memory Broker
// ============================================================================

/// Shared in-memory broker; clones see the same entities
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    notify: Arc<Notify>,
    config: InMemoryBrokerConfig,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with default limits
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    /// Create a broker with custom limits
    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn config(&self) -> &InMemoryBrokerConfig {
        &self.config
    }

    /// Create a queue; queues are also created on first use
    pub fn create_queue(&self, name: &str) {
        self.create_entity(name, false);
    }

    /// Create a queue whose messages can only be received through sessions
    pub fn create_session_queue(&self, name: &str) {
        self.create_entity(name, true);
    }

    /// Create a topic with the given subscriptions
    pub fn create_topic(&self, name: &str, subscriptions: &[&str]) {
        let mut state = self.write();
        let mut keys = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let key = EntityPath::Subscription {
                topic: name.to_string(),
                subscription: subscription.to_string(),
            }
            .key();
            state
                .entities
                .entry(key.clone())
                .or_insert_with(|| EntityStore::new(false));
            keys.push(key);
        }
        state.topics.entry(name.to_string()).or_default().extend(keys);
    }

    /// Fail the next `count` send attempts with a transmission error
    pub fn fail_next_sends(&self, count: u32) {
        self.write().failing_sends = count;
    }

    /// Fail the next `count` receive calls with a connection error
    pub fn fail_next_receives(&self, count: u32) {
        self.write().failing_receives = count;
    }

    /// Fail the next `count` send or receive handle closes with a
    /// connection error. The failing handle stays open.
    pub fn fail_next_handle_closes(&self, count: u32) {
        self.write().failing_closes = count;
    }

    /// Credentials every connection was opened with
    pub fn connections(&self) -> Vec<Credential> {
        self.read(|state| state.connections.clone())
    }

    /// Handle releases in the order they happened
    pub fn handle_events(&self) -> Vec<HandleEvent> {
        self.read(|state| state.events.clone())
    }

    /// Successful transmissions in the order they happened
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.read(|state| state.transmissions.clone())
    }

    /// Send attempts including the failed ones
    pub fn send_attempts(&self) -> u32 {
        self.read(|state| state.send_attempts)
    }

    /// Messages available or leased on an entity
    pub fn active_message_count(&self, entity: &str) -> usize {
        self.read(|state| {
            state
                .entities
                .get(entity)
                .map(|store| store.ready.len() + store.locked.len())
                .unwrap_or(0)
        })
    }

    /// Messages set aside by defer on an entity
    pub fn deferred_message_count(&self, entity: &str) -> usize {
        self.read(|state| {
            state
                .entities
                .get(entity)
                .map(|store| store.deferred.len())
                .unwrap_or(0)
        })
    }

    /// Contents of an entity's dead-letter queue
    pub fn dead_letter_messages(&self, entity: &str) -> Vec<ReceivedMessage> {
        self.read(|state| {
            state
                .entities
                .get(entity)
                .map(|store| {
                    store
                        .dead_letters
                        .iter()
                        .map(|message| message.to_received(None, None))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Sessions currently locked by a receiver
    pub fn locked_sessions(&self, entity: &str) -> Vec<String> {
        self.read(|state| {
            let mut sessions: Vec<String> = state
                .entities
                .get(entity)
                .map(|store| store.session_locks.keys().cloned().collect())
                .unwrap_or_default();
            sessions.sort();
            sessions
        })
    }

    fn create_entity(&self, name: &str, requires_session: bool) {
        self.write()
            .entities
            .entry(name.to_string())
            .or_insert_with(|| EntityStore::new(requires_session));
    }

    fn write(&self) -> RwLockWriteGuard<'_, BrokerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&BrokerState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn record_event(&self, event: HandleEvent) {
        self.write().events.push(event);
    }

    fn take_close_failure(&self, entity: &str) -> Result<(), MessagingError> {
        let mut state = self.write();
        if state.failing_closes > 0 {
            state.failing_closes -= 1;
            return Err(MessagingError::Connection {
                message: format!("injected close failure on '{}'", entity),
            });
        }
        Ok(())
    }

    fn enqueue(&self, path: &EntityPath, envelopes: &[WireEnvelope]) -> Result<(), MessagingError> {
        let mut state = self.write();
        let key = path.key();

        state.send_attempts += 1;
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(MessagingError::Transmission {
                entity: key,
                message: "injected send failure".to_string(),
            });
        }

        let targets = match path {
            EntityPath::Queue(name) => {
                state
                    .entities
                    .entry(name.clone())
                    .or_insert_with(|| EntityStore::new(false));
                vec![name.clone()]
            }
            EntityPath::Topic(name) => state
                .topics
                .get(name)
                .cloned()
                .ok_or_else(|| MessagingError::EntityNotFound {
                    entity: name.clone(),
                })?,
            EntityPath::Subscription { .. } => {
                return Err(ConfigurationError::Invalid {
                    message: format!("cannot send to subscription '{}'", key),
                }
                .into())
            }
        };

        for envelope in envelopes {
            let stored = StoredMessage {
                message_id: MessageId::new(),
                sequence_number: state.next_sequence_number(),
                envelope: envelope.clone(),
                delivery_count: 0,
                enqueued_at: Utc::now(),
                dead_letter_reason: None,
            };
            for target in &targets {
                state
                    .entity_mut(target)?
                    .ready
                    .insert(stored.sequence_number, stored.clone());
            }
        }

        state.transmissions.push(Transmission {
            entity: key,
            envelopes: envelopes.to_vec(),
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    fn take_messages(
        &self,
        handle: &MemoryReceiver,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        let mut state = self.write();
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(MessagingError::Connection {
                message: "injected receive failure".to_string(),
            });
        }

        let now = Instant::now();
        let entity = state.entity_mut(&handle.key)?;
        if entity.requires_session && handle.session_id.is_none() {
            return Err(ConfigurationError::Invalid {
                message: format!("entity '{}' requires a session receiver", handle.key),
            }
            .into());
        }

        entity.release_expired(now, self.config.max_delivery_count);
        let taken = entity.take_ready(max_messages, handle.session_id.as_deref());

        Ok(taken
            .into_iter()
            .map(|message| entity.lease(message, handle.id, self.config.lock_duration, now))
            .collect())
    }

    async fn receive(
        &self,
        handle: &MemoryReceiver,
        max_messages: usize,
        max_wait: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        loop {
            let notified = self.notify.notified();
            let received = self.take_messages(handle, max_messages)?;
            if !received.is_empty() {
                return Ok(received);
            }

            let Some(deadline) = deadline else {
                return Ok(received);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn peek(
        &self,
        handle: &MemoryReceiver,
        max_messages: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        let mut state = self.write();
        let entity = state.entity_mut(&handle.key)?;
        entity.release_expired(Instant::now(), self.config.max_delivery_count);

        let from = from_sequence_number.unwrap_or(i64::MIN);
        let mut visible: Vec<&StoredMessage> = entity
            .ready
            .values()
            .chain(entity.locked.values().map(|lease| &lease.message))
            .chain(entity.deferred.values())
            .filter(|message| message.sequence_number >= from)
            .filter(|message| message.in_session(handle.session_id.as_deref()))
            .collect();
        visible.sort_by_key(|message| message.sequence_number);

        Ok(visible
            .into_iter()
            .take(max_messages)
            .map(|message| message.to_received(None, None))
            .collect())
    }

    fn receive_deferred(
        &self,
        handle: &MemoryReceiver,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        let mut state = self.write();
        let now = Instant::now();
        let entity = state.entity_mut(&handle.key)?;

        if let Some(missing) = sequence_numbers
            .iter()
            .find(|sequence_number| !entity.deferred.contains_key(*sequence_number))
        {
            return Err(MessagingError::EntityNotFound {
                entity: format!("{} deferred message {}", handle.key, missing),
            });
        }

        let mut received = Vec::with_capacity(sequence_numbers.len());
        for sequence_number in sequence_numbers {
            if let Some(message) = entity.deferred.remove(sequence_number) {
                received.push(entity.lease(message, handle.id, self.config.lock_duration, now));
            }
        }
        Ok(received)
    }

    fn settle(
        &self,
        handle: &MemoryReceiver,
        lock_token: &LockToken,
        action: SettlementAction,
        reason: Option<&str>,
    ) -> Result<(), MessagingError> {
        let mut state = self.write();
        let max_delivery_count = self.config.max_delivery_count;
        let entity = state.entity_mut(&handle.key)?;
        entity.release_expired(Instant::now(), max_delivery_count);

        let lease = entity
            .locked
            .remove(lock_token)
            .ok_or_else(|| MessagingError::Settlement {
                action,
                lock_token: lock_token.to_string(),
                reason: "the lock was lost or has expired".to_string(),
            })?;

        let mut message = lease.message;
        match action {
            SettlementAction::Complete => {}
            SettlementAction::Abandon => entity.requeue(message, max_delivery_count),
            SettlementAction::DeadLetter => {
                message.dead_letter_reason = reason.map(str::to_string);
                entity.dead_letters.push(message);
            }
            SettlementAction::Defer => {
                entity.deferred.insert(message.sequence_number, message);
            }
        }
        drop(state);

        if action == SettlementAction::Abandon {
            self.notify.notify_waiters();
        }
        debug!(entity = %handle.key, lock_token = %lock_token, action = %action, "Lease settled");
        Ok(())
    }

    fn open_receiver(
        &self,
        path: &EntityPath,
        session: SessionRequest<'_>,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        let mut state = self.write();
        let key = state.receivable_key(path)?;
        let id = state.next_handle_id();

        let session_id = match session {
            SessionRequest::None => None,
            SessionRequest::Specific(session_id) => {
                let entity = state.entity_mut(&key)?;
                require_sessions(entity, &key)?;
                if entity.session_locks.contains_key(session_id) {
                    return Err(MessagingError::SessionLocked {
                        session_id: session_id.to_string(),
                    });
                }
                entity.session_locks.insert(session_id.to_string(), id);
                Some(session_id.to_string())
            }
            SessionRequest::Next => {
                let entity = state.entity_mut(&key)?;
                require_sessions(entity, &key)?;
                let next = entity
                    .ready
                    .values()
                    .filter_map(|message| message.envelope.session_id.as_deref())
                    .find(|session_id| !entity.session_locks.contains_key(*session_id))
                    .map(str::to_string)
                    .ok_or_else(|| MessagingError::SessionUnavailable {
                        entity: key.clone(),
                    })?;
                entity.session_locks.insert(next.clone(), id);
                Some(next)
            }
        };

        debug!(entity = %key, session_id = ?session_id, handle = id, "Receiver opened");
        Ok(Arc::new(MemoryReceiver {
            broker: self.clone(),
            key,
            id,
            session_id,
            closed: AtomicBool::new(false),
        }))
    }

    fn close_receiver(&self, handle: &MemoryReceiver) {
        let mut state = self.write();
        if let Some(entity) = state.entities.get_mut(&handle.key) {
            entity.release_owner(handle.id, handle.session_id.as_deref());
        }
        state.events.push(HandleEvent::ReceiverClosed {
            entity: handle.key.clone(),
            session_id: handle.session_id.clone(),
        });
        drop(state);

        self.notify.notify_waiters();
    }
}

enum SessionRequest<'a> {
    None,
    Specific(&'a str),
    Next,
}

fn require_sessions(entity: &EntityStore, key: &str) -> Result<(), MessagingError> {
    if !entity.requires_session {
        return Err(ConfigurationError::Invalid {
            message: format!("entity '{}' does not support sessions", key),
        }
        .into());
    }
    Ok(())
}

fn closed_error(kind: &str, entity: &str) -> MessagingError {
    MessagingError::Connection {
        message: format!("{} for '{}' is closed", kind, entity),
    }
}

// ============================================================================
// Broker Handles
// ============================================================================

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn BrokerClient>, MessagingError> {
        self.write().connections.push(credential.clone());
        Ok(Arc::new(MemoryClient {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl AdminConnector for InMemoryBroker {
    async fn connect_admin(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn AdminTransport>, MessagingError> {
        self.write().connections.push(credential.clone());
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl AdminTransport for InMemoryBroker {
    async fn subscription_runtime_properties(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<SubscriptionDetails, MessagingError> {
        let key = EntityPath::Subscription {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
        }
        .key();

        self.read(|state| -> Result<SubscriptionDetails, MessagingError> {
            let entity = state.entity(&key)?;
            Ok(SubscriptionDetails {
                active_message_count: (entity.ready.len() + entity.locked.len()) as u64,
                dead_letter_message_count: entity.dead_letters.len() as u64,
            })
        })
    }
}

/// Client handed out by [`InMemoryBroker::connect`]
struct MemoryClient {
    broker: InMemoryBroker,
    closed: AtomicBool,
}

impl MemoryClient {
    fn check_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection {
                message: "broker client is closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn create_sender(
        &self,
        entity: &EntityPath,
    ) -> Result<Arc<dyn TransportSender>, MessagingError> {
        self.check_open()?;
        if !entity.accepts_sends() {
            return Err(ConfigurationError::Invalid {
                message: format!("cannot send to subscription '{}'", entity),
            }
            .into());
        }

        Ok(Arc::new(MemorySender {
            broker: self.broker.clone(),
            key: entity.key(),
            path: entity.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_receiver(
        &self,
        entity: &EntityPath,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        self.check_open()?;
        self.broker.open_receiver(entity, SessionRequest::None)
    }

    async fn accept_session(
        &self,
        entity: &EntityPath,
        session_id: &str,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        self.check_open()?;
        self.broker
            .open_receiver(entity, SessionRequest::Specific(session_id))
    }

    async fn accept_next_session(
        &self,
        entity: &EntityPath,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        self.check_open()?;
        self.broker.open_receiver(entity, SessionRequest::Next)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.record_event(HandleEvent::ClientClosed);
        }
        Ok(())
    }
}

/// Send handle bound to one queue or topic
struct MemorySender {
    broker: InMemoryBroker,
    key: String,
    path: EntityPath,
    closed: AtomicBool,
}

impl MemorySender {
    fn check_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error("sender", &self.key));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSender for MemorySender {
    fn entity(&self) -> &str {
        &self.key
    }

    async fn create_message_batch(&self) -> Result<MessageBatch, MessagingError> {
        self.check_open()?;
        Ok(MessageBatch::new(self.broker.config.max_batch_size_bytes))
    }

    async fn send_message(
        &self,
        envelope: &WireEnvelope,
        _options: &SendOptions,
    ) -> Result<(), MessagingError> {
        self.check_open()?;
        self.broker
            .enqueue(&self.path, std::slice::from_ref(envelope))
    }

    async fn send_batch(
        &self,
        batch: &MessageBatch,
        _options: &SendOptions,
    ) -> Result<(), MessagingError> {
        self.check_open()?;
        if batch.size_in_bytes() > self.broker.config.max_batch_size_bytes {
            return Err(MessagingError::Transmission {
                entity: self.key.clone(),
                message: format!(
                    "batch of {} bytes exceeds the {} byte limit",
                    batch.size_in_bytes(),
                    self.broker.config.max_batch_size_bytes
                ),
            });
        }
        self.broker.enqueue(&self.path, batch.envelopes())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.take_close_failure(&self.key)?;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.record_event(HandleEvent::SenderClosed {
                entity: self.key.clone(),
            });
        }
        Ok(())
    }
}

/// Receive handle bound to one queue, subscription or session
struct MemoryReceiver {
    broker: InMemoryBroker,
    key: String,
    id: u64,
    session_id: Option<String>,
    closed: AtomicBool,
}

impl MemoryReceiver {
    fn check_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error("receiver", &self.key));
        }
        Ok(())
    }

    fn settle(
        &self,
        lock_token: &LockToken,
        action: SettlementAction,
        reason: Option<&str>,
    ) -> Result<(), MessagingError> {
        self.check_open()?;
        self.broker.settle(self, lock_token, action, reason)
    }
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    fn entity(&self) -> &str {
        &self.key
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn receive_messages(
        &self,
        max_messages: usize,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        self.check_open()?;
        self.broker
            .receive(self, max_messages, options.max_wait)
            .await
    }

    async fn peek_messages(
        &self,
        max_messages: usize,
        options: &PeekOptions,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        self.check_open()?;
        self.broker
            .peek(self, max_messages, options.from_sequence_number)
    }

    async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        self.check_open()?;
        self.broker.receive_deferred(self, sequence_numbers)
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), MessagingError> {
        self.settle(lock_token, SettlementAction::Complete, None)
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), MessagingError> {
        self.settle(lock_token, SettlementAction::Abandon, None)
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: Option<&str>,
    ) -> Result<(), MessagingError> {
        self.settle(lock_token, SettlementAction::DeadLetter, reason)
    }

    async fn defer(&self, lock_token: &LockToken) -> Result<(), MessagingError> {
        self.settle(lock_token, SettlementAction::Defer, None)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.take_close_failure(&self.key)?;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.close_receiver(self);
        }
        Ok(())
    }
}
