//! Connection configuration and the shared broker connection.
//!
//! Secure configuration handling with:
//! - Credential resolution into a tagged [`Credential`] variant
//! - Secret redaction in Debug output
//! - Validation before any broker call
//!
//! Senders, receivers and the admin client are all built on a [`Connection`]
//! rather than on a common base type.

use crate::error::{ConfigurationError, MessagingError};
use crate::retry::{RetryPolicy, DEFAULT_RETRIES};
use crate::transport::{BrokerClient, BrokerConnector, EntityPath, TransportReceiver, TransportSender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Flag appended to constructed connection strings for the local emulator
pub const EMULATOR_FLAG: &str = ";UseDevelopmentEmulator=true";

/// Default wait between send retries in milliseconds
pub const DEFAULT_RETRY_WAIT_IN_MS: u64 = 1000;

/// Default number of concurrent handler invocations
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 1;

// ============================================================================
// Entity Type
// ============================================================================

/// Kind of entity a connection targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    #[default]
    Queue,
    Topic,
    Subscription,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Topic => write!(f, "topic"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

// ============================================================================
// Connection Options
// ============================================================================

/// Connection options recognised by senders, receivers and the admin client
///
/// Field names are snake_case; the camelCase names used by existing
/// deployments are accepted as aliases.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Queue, topic or subscription name
    pub address: String,

    /// Connection name used in logs; defaults to `address`
    pub name: Option<String>,

    /// Direct connection string, takes precedence over host/username/password
    #[serde(alias = "connectionString")]
    pub connection_string: Option<String>,

    /// Broker namespace host
    pub host: Option<String>,

    /// Shared access key name
    pub username: Option<String>,

    /// Shared access key
    pub password: Option<String>,

    /// Authenticate with an identity instead of shared keys
    #[serde(alias = "useCredentialChain")]
    pub use_credential_chain: bool,

    /// Specific managed identity to use under the credential chain
    #[serde(alias = "managedIdentityClientId")]
    pub managed_identity_client_id: Option<String>,

    /// Target the local emulator
    #[serde(alias = "useEmulator")]
    pub use_emulator: bool,

    /// Entity kind
    #[serde(rename = "type", alias = "entity_type")]
    pub entity_type: EntityType,

    /// Owning topic, required for subscriptions
    pub topic: Option<String>,

    /// Send retries after the first attempt
    pub retries: u32,

    /// Wait before the first send retry
    #[serde(alias = "retryWaitInMs")]
    pub retry_wait_in_ms: u64,

    /// Double the wait after every failed retry
    #[serde(alias = "exponentialRetry")]
    pub exponential_retry: bool,

    /// Complete on handler success and abandon on handler failure
    #[serde(alias = "autoCompleteMessages")]
    pub auto_complete_messages: bool,

    /// Upper bound on concurrently running handlers
    #[serde(alias = "maxConcurrentCalls")]
    pub max_concurrent_calls: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            name: None,
            connection_string: None,
            host: None,
            username: None,
            password: None,
            use_credential_chain: false,
            managed_identity_client_id: None,
            use_emulator: false,
            entity_type: EntityType::Queue,
            topic: None,
            retries: DEFAULT_RETRIES,
            retry_wait_in_ms: DEFAULT_RETRY_WAIT_IN_MS,
            exponential_retry: false,
            auto_complete_messages: false,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

impl ConnectionOptions {
    /// Create options for a queue with default retry and dispatch settings
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the connection name used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Authenticate with a connection string
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Authenticate with a shared access key
    pub fn with_shared_key(
        mut self,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.host = Some(host.into());
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Authenticate with an identity, optionally a specific managed identity
    pub fn with_credential_chain(
        mut self,
        host: impl Into<String>,
        managed_identity_client_id: Option<String>,
    ) -> Self {
        self.host = Some(host.into());
        self.use_credential_chain = true;
        self.managed_identity_client_id = managed_identity_client_id;
        self
    }

    /// Target the local emulator
    pub fn with_emulator(mut self, use_emulator: bool) -> Self {
        self.use_emulator = use_emulator;
        self
    }

    /// Target a topic instead of a queue
    pub fn for_topic(mut self) -> Self {
        self.entity_type = EntityType::Topic;
        self
    }

    /// Target a subscription of `topic`; `address` is the subscription name
    pub fn for_subscription(mut self, topic: impl Into<String>) -> Self {
        self.entity_type = EntityType::Subscription;
        self.topic = Some(topic.into());
        self
    }

    /// Configure send retries
    pub fn with_retry(mut self, retries: u32, retry_wait_in_ms: u64, exponential: bool) -> Self {
        self.retries = retries;
        self.retry_wait_in_ms = retry_wait_in_ms;
        self.exponential_retry = exponential;
        self
    }

    /// Settle on handler result
    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete_messages = auto_complete;
        self
    }

    /// Bound concurrent handler invocations
    pub fn with_max_concurrent_calls(mut self, max_concurrent_calls: usize) -> Self {
        self.max_concurrent_calls = max_concurrent_calls;
        self
    }

    /// Name used in log lines, `name` if set, otherwise `address`
    pub fn connection_name(&self) -> &str {
        non_empty(&self.name).unwrap_or(&self.address)
    }

    /// Retry policy for the send paths
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_options(self)
    }

    /// Broker path of the configured entity
    pub fn entity_path(&self) -> Result<EntityPath, ConfigurationError> {
        Ok(match self.entity_type {
            EntityType::Queue => EntityPath::Queue(self.address.clone()),
            EntityType::Topic => EntityPath::Topic(self.address.clone()),
            EntityType::Subscription => EntityPath::Subscription {
                topic: self.required_topic()?.to_string(),
                subscription: self.address.clone(),
            },
        })
    }

    /// Resolve which credential the options describe.
    ///
    /// The credential chain wins when enabled, then a connection string, then
    /// host/username/password as a shared key.
    pub fn credential(&self) -> Result<Credential, ConfigurationError> {
        if self.use_credential_chain {
            let host = required(&self.host, "host")?.to_string();
            return Ok(match non_empty(&self.managed_identity_client_id) {
                Some(client_id) => Credential::ManagedIdentity {
                    host,
                    client_id: client_id.to_string(),
                },
                None => Credential::CredentialChain { host },
            });
        }

        if let Some(connection_string) = non_empty(&self.connection_string) {
            return Ok(Credential::ConnectionString(connection_string.to_string()));
        }

        if non_empty(&self.host).is_none() {
            return Err(ConfigurationError::Missing {
                key: "connection_string or host".to_string(),
            });
        }

        Ok(Credential::SharedKey {
            host: required(&self.host, "host")?.to_string(),
            key_name: required(&self.username, "username")?.to_string(),
            key: required(&self.password, "password")?.to_string(),
            use_emulator: self.use_emulator,
        })
    }

    /// Validate the options
    ///
    /// Checks that:
    /// - `address` is set
    /// - `topic` is set for subscriptions
    /// - `max_concurrent_calls` is at least 1
    /// - `retry_wait_in_ms` is positive
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.address.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "address".to_string(),
            });
        }

        if self.entity_type == EntityType::Subscription {
            self.required_topic()?;
        }

        if self.max_concurrent_calls == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrent_calls must be at least 1".to_string(),
            });
        }

        if self.retry_wait_in_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "retry_wait_in_ms must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    fn required_topic(&self) -> Result<&str, ConfigurationError> {
        required(&self.topic, "topic")
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("address", &self.address)
            .field("name", &self.name)
            .field(
                "connection_string",
                if self.connection_string.is_some() {
                    &"<REDACTED>"
                } else {
                    &"None"
                },
            )
            .field("host", &self.host)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() {
                    &"<REDACTED>"
                } else {
                    &"None"
                },
            )
            .field("use_credential_chain", &self.use_credential_chain)
            .field("managed_identity_client_id", &self.managed_identity_client_id)
            .field("use_emulator", &self.use_emulator)
            .field("entity_type", &self.entity_type)
            .field("topic", &self.topic)
            .field("retries", &self.retries)
            .field("retry_wait_in_ms", &self.retry_wait_in_ms)
            .field("exponential_retry", &self.exponential_retry)
            .field("auto_complete_messages", &self.auto_complete_messages)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, ConfigurationError> {
    non_empty(value).ok_or_else(|| ConfigurationError::Missing {
        key: key.to_string(),
    })
}

// ============================================================================
// Credential
// ============================================================================

/// How a connection authenticates against the broker
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ConnectionString(String),
    SharedKey {
        host: String,
        key_name: String,
        key: String,
        use_emulator: bool,
    },
    ManagedIdentity {
        host: String,
        client_id: String,
    },
    CredentialChain {
        host: String,
    },
}

impl Credential {
    /// Connection string for key-based credentials; `None` for identities
    ///
    /// # Examples
    ///
    /// ```rust
    /// use messaging_runtime::connection::Credential;
    ///
    /// let credential = Credential::SharedKey {
    ///     host: "ns.servicebus.windows.net".to_string(),
    ///     key_name: "RootManageSharedAccessKey".to_string(),
    ///     key: "secret".to_string(),
    ///     use_emulator: false,
    /// };
    ///
    /// assert_eq!(
    ///     credential.connection_string().as_deref(),
    ///     Some("Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=secret")
    /// );
    /// ```
    pub fn connection_string(&self) -> Option<String> {
        match self {
            Self::ConnectionString(value) => Some(value.clone()),
            Self::SharedKey {
                host,
                key_name,
                key,
                use_emulator,
            } => {
                let mut value = format!(
                    "Endpoint=sb://{}/;SharedAccessKeyName={};SharedAccessKey={}",
                    host, key_name, key
                );
                if *use_emulator {
                    value.push_str(EMULATOR_FLAG);
                }
                Some(value)
            }
            Self::ManagedIdentity { .. } | Self::CredentialChain { .. } => None,
        }
    }

    /// Namespace host when the credential names one directly
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::ConnectionString(_) => None,
            Self::SharedKey { host, .. }
            | Self::ManagedIdentity { host, .. }
            | Self::CredentialChain { host } => Some(host),
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionString(_) => "connection_string",
            Self::SharedKey { .. } => "shared_key",
            Self::ManagedIdentity { .. } => "managed_identity",
            Self::CredentialChain { .. } => "credential_chain",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionString(_) => f
                .debug_tuple("ConnectionString")
                .field(&"<REDACTED>")
                .finish(),
            Self::SharedKey {
                host,
                key_name,
                use_emulator,
                ..
            } => f
                .debug_struct("SharedKey")
                .field("host", host)
                .field("key_name", key_name)
                .field("key", &"<REDACTED>")
                .field("use_emulator", use_emulator)
                .finish(),
            Self::ManagedIdentity { host, client_id } => f
                .debug_struct("ManagedIdentity")
                .field("host", host)
                .field("client_id", client_id)
                .finish(),
            Self::CredentialChain { host } => {
                f.debug_struct("CredentialChain").field("host", host).finish()
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Shared broker connection injected into senders, receivers and the admin client
pub struct Connection {
    name: String,
    options: ConnectionOptions,
    entity: EntityPath,
    client: Arc<dyn BrokerClient>,
    closed: AtomicBool,
}

impl Connection {
    /// Validate `options`, resolve the credential and connect
    pub async fn open(
        options: ConnectionOptions,
        connector: &dyn BrokerConnector,
    ) -> Result<Self, MessagingError> {
        options.validate()?;
        let credential = options.credential()?;

        let client = connector.connect(&credential).await?;

        info!(
            connection = %options.connection_name(),
            credential = credential.kind(),
            entity_type = %options.entity_type,
            "Broker connection opened"
        );

        Self::from_client(options, client)
    }

    /// Wrap an already connected broker client
    pub fn from_client(
        options: ConnectionOptions,
        client: Arc<dyn BrokerClient>,
    ) -> Result<Self, MessagingError> {
        options.validate()?;
        let entity = options.entity_path()?;

        Ok(Self {
            name: options.connection_name().to_string(),
            options,
            entity,
            client,
            closed: AtomicBool::new(false),
        })
    }

    /// Connection name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Entity every handle of this connection is bound to
    pub fn entity(&self) -> &EntityPath {
        &self.entity
    }

    /// Open a send handle on the configured queue or topic
    pub async fn create_sender(&self) -> Result<Arc<dyn TransportSender>, MessagingError> {
        if !self.entity.accepts_sends() {
            return Err(ConfigurationError::Invalid {
                message: format!("cannot send to {} '{}'", self.options.entity_type, self.entity),
            }
            .into());
        }
        self.client.create_sender(&self.entity).await
    }

    /// Open a receive handle on the configured queue or subscription
    pub async fn create_receiver(&self) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        self.check_receivable()?;
        self.client.create_receiver(&self.entity).await
    }

    /// Lock a specific session on the configured entity
    pub async fn accept_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        self.check_receivable()?;
        self.client.accept_session(&self.entity, session_id).await
    }

    /// Lock the next available session on the configured entity
    pub async fn accept_next_session(&self) -> Result<Arc<dyn TransportReceiver>, MessagingError> {
        self.check_receivable()?;
        self.client.accept_next_session(&self.entity).await
    }

    /// Close the broker client. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.name, "Connection already closed");
            return Ok(());
        }
        self.client.close().await
    }

    /// Close the connection after a handle failed to open and hand back the
    /// open error
    pub(crate) async fn abort_open(&self, error: MessagingError) -> MessagingError {
        if let Err(close_err) = self.close().await {
            warn!(
                connection = %self.name,
                error = %close_err,
                "Failed to close connection after open failure"
            );
        }
        debug!(connection = %self.name, error = %error, "Handle open failed, connection closed");
        error
    }

    fn check_receivable(&self) -> Result<(), MessagingError> {
        if !self.entity.accepts_receives() {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "cannot receive from {} '{}'",
                    self.options.entity_type, self.entity
                ),
            }
            .into());
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
