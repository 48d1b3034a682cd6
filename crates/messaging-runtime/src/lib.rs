//! # Messaging Runtime
//!
//! Reliable send, batch and settlement layer for peek-lock message brokers.
//!
//! This library provides:
//! - Schema validation and enrichment of outbound messages
//! - Retry with fixed or doubling backoff around every transmission
//! - Greedy, order-preserving batch packing with partial-success reporting
//! - Lease settlement (complete, abandon, dead-letter, defer) that can only
//!   happen once per lease
//! - Exclusive session binding and bounded-concurrency handler dispatch
//!
//! ## Module Organization
//!
//! - [`message`] - Domain messages, wire envelopes and enrichment
//! - [`schema`] - Outbound message validation
//! - [`retry`] - Retry policy for the transmission step
//! - [`sender`] - Single-message send path
//! - [`batch`] - Batch packing and the batch send path
//! - [`receiver`] - Receive, settlement, sessions and subscriptions
//! - [`lease`] - The settlement state machine of a leased message
//! - [`connection`] - Connection options, credentials and the connection capability
//! - [`transport`] - Traits a broker implementation provides
//! - [`admin`] - Entity runtime properties
//! - [`observer`] - Optional trace and exception hooks
//! - [`settings`] - Loading connection options from files and the environment
//! - [`error`] - Error types for all messaging operations
//! - [`providers`] - Broker implementations

pub mod admin;
pub mod batch;
pub mod connection;
pub mod error;
pub mod lease;
pub mod message;
pub mod observer;
pub mod providers;
pub mod receiver;
pub mod retry;
pub mod schema;
pub mod sender;
pub mod settings;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use admin::{AdminClient, SubscriptionDetails};
pub use batch::{BatchReceipt, MessageBatch, MessageBatchSender};
pub use connection::{Connection, ConnectionOptions, Credential, EntityType};
pub use error::{ConfigurationError, MessagingError, PartialBatchError, ValidationError};
pub use lease::{LeaseState, LeasedMessage, SettlementAction};
pub use message::{
    enrich, DomainMessage, LockToken, MessageId, PeekOptions, ReceiveOptions, ReceivedMessage,
    SendOptions, WireEnvelope,
};
pub use observer::{Observer, TracingObserver};
pub use receiver::{
    handler_fn, ErrorHandler, ErrorPolicy, MessageHandler, MessageReceiver, SessionBinding,
    SubscribeOptions, Subscription,
};
pub use retry::{retry, RetryPolicy, RetryState};
pub use schema::{MessageValidator, ValidationMode};
pub use sender::MessageSender;
pub use settings::load_options;
pub use transport::{BrokerClient, BrokerConnector, EntityPath, TransportReceiver, TransportSender};
