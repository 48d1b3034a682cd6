//! Message types for the send and receive paths including the wire envelope.
//!
//! A [`DomainMessage`] is what application code hands to a sender. It is
//! mapped exactly once into a [`WireEnvelope`] by [`enrich`], and the
//! envelope is what crosses the boundary to the broker.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Application property key carrying the message type
pub const TYPE_PROPERTY: &str = "type";

/// Application property key carrying the message source
pub const SOURCE_PROPERTY: &str = "source";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier assigned to a message by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token identifying the lease a receiver holds on a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate new random lock token
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get lock token as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "lock_token".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message produced by application code
///
/// `body` must be absent, `null` or a JSON object. Top-level fields the
/// schema does not know about are kept in `extra` so that the validator
/// can decide whether to accept them.
///
/// # Examples
///
/// ```rust
/// use messaging_runtime::message::DomainMessage;
/// use serde_json::json;
///
/// let message = DomainMessage::new("order.created", "checkout")
///     .with_body(json!({ "orderId": 42 }))
///     .with_correlation_id("req-1");
///
/// assert_eq!(message.message_type, "order.created");
/// assert_eq!(message.correlation_id.as_deref(), Some("req-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMessage {
    #[serde(default)]
    pub body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(rename = "type")]
    pub message_type: String,

    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DomainMessage {
    /// Create new message with the two required fields
    pub fn new(message_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            body: None,
            subject: None,
            message_type: message_type.into(),
            source: source.into(),
            correlation_id: None,
            session_id: None,
            metadata: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Set the message body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add session ID for ordered processing
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add a metadata entry carried as an application property
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add an ad-hoc top-level field
    pub fn with_extra_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Properties the broker exposes for routing and filtering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationProperties {
    #[serde(rename = "type")]
    pub message_type: String,

    pub source: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// The transport-level shape of a message
///
/// `body` is always serialized, as `null` when absent. The optional top-level
/// fields are omitted entirely when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub application_properties: ApplicationProperties,
}

impl WireEnvelope {
    /// Size of the envelope as the broker measures it
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }

    /// Message type carried in the application properties
    pub fn message_type(&self) -> &str {
        &self.application_properties.message_type
    }

    /// Message source carried in the application properties
    pub fn source(&self) -> &str {
        &self.application_properties.source
    }
}

/// Map a domain message into its wire envelope.
///
/// `type` and `source` always win over metadata entries with the same name.
/// Unknown top-level fields are not carried.
pub fn enrich(message: &DomainMessage) -> WireEnvelope {
    let extra = message
        .metadata
        .iter()
        .filter(|(key, _)| key.as_str() != TYPE_PROPERTY && key.as_str() != SOURCE_PROPERTY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    WireEnvelope {
        body: message.body.clone(),
        correlation_id: message.correlation_id.clone(),
        subject: message.subject.clone(),
        session_id: message.session_id.clone(),
        application_properties: ApplicationProperties {
            message_type: message.message_type.clone(),
            source: message.source.clone(),
            extra,
        },
    }
}

/// A message delivered by the broker with its delivery metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub sequence_number: i64,
    pub envelope: WireEnvelope,
    /// Present for leased deliveries, absent for peeked ones
    pub lock_token: Option<LockToken>,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
}

impl ReceivedMessage {
    /// Message body
    pub fn body(&self) -> Option<&Value> {
        self.envelope.body.as_ref()
    }

    /// Message type from the application properties
    pub fn message_type(&self) -> &str {
        self.envelope.message_type()
    }

    /// Session the message belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        self.envelope.session_id.as_deref()
    }

    /// Check if message has exceeded maximum delivery count
    pub fn has_exceeded_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count > max_count
    }

    /// Check if the lease on this message has run out
    pub fn is_lock_expired(&self) -> bool {
        match self.locked_until {
            Some(until) => Utc::now() >= until,
            None => false,
        }
    }
}

// ============================================================================
// Send and Receive Options
// ============================================================================

/// Options for a single send or batch send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Upper bound for one transmission attempt; a timed-out attempt is retried
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Create new send options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each transmission attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for receiving leased messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// How long to wait for the first message before returning empty
    pub max_wait: Option<Duration>,
}

impl ReceiveOptions {
    /// Create new receive options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum wait for messages
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// Options for peeking without taking a lease
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeekOptions {
    /// First sequence number to return
    pub from_sequence_number: Option<i64>,
}

impl PeekOptions {
    /// Create new peek options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start peeking at a sequence number
    pub fn from_sequence_number(mut self, sequence_number: i64) -> Self {
        self.from_sequence_number = Some(sequence_number);
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
