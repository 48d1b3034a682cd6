//! Single-message send path: validate, enrich, transmit with retry.

use crate::connection::Connection;
use crate::error::MessagingError;
use crate::message::{enrich, DomainMessage, SendOptions, WireEnvelope};
use crate::observer::{track_exception, track_trace, Observer};
use crate::retry::RetryPolicy;
use crate::schema::{MessageValidator, ValidationMode};
use crate::transport::{bounded, TransportSender};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Send handle plus the connection that owns it.
///
/// Shared by [`MessageSender`] and [`crate::batch::MessageBatchSender`].
pub(crate) struct SendLink {
    pub(crate) name: String,
    pub(crate) connection: Connection,
    pub(crate) handle: Arc<dyn TransportSender>,
    pub(crate) retry: RetryPolicy,
    pub(crate) observer: Option<Arc<dyn Observer>>,
}

impl SendLink {
    pub(crate) async fn open(connection: Connection, suffix: &str) -> Result<Self, MessagingError> {
        let handle = match connection.create_sender().await {
            Ok(handle) => handle,
            Err(err) => return Err(connection.abort_open(err).await),
        };
        let retry = connection.options().retry_policy();

        Ok(Self {
            name: format!("{}-{}", connection.name(), suffix),
            connection,
            handle,
            retry,
            observer: None,
        })
    }

    pub(crate) fn trace(&self) {
        track_trace(self.observer.as_ref(), &self.name);
    }

    pub(crate) fn report(&self, error: &MessagingError) {
        track_exception(self.observer.as_ref(), error);
    }

    /// Release the send handle, then the connection, on every path
    pub(crate) async fn close(self) -> Result<(), MessagingError> {
        let handle_result = self.handle.close().await;
        if let Err(err) = &handle_result {
            warn!(connection = %self.name, error = %err, "Failed to close send handle");
        }

        let connection_result = self.connection.close().await;
        info!(connection = %self.name, "{} connection closed", self.name);

        handle_result.and(connection_result)
    }
}

/// Sends one message at a time
///
/// # Examples
///
/// ```rust
/// use messaging_runtime::connection::{Connection, ConnectionOptions};
/// use messaging_runtime::message::{DomainMessage, SendOptions};
/// use messaging_runtime::providers::memory::InMemoryBroker;
/// use messaging_runtime::sender::MessageSender;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let options = ConnectionOptions::new("orders").with_connection_string("Endpoint=sb://memory/");
/// let connection = Connection::open(options, &broker).await?;
/// let sender = MessageSender::open(connection).await?;
///
/// let envelope = sender
///     .send_message(DomainMessage::new("order.created", "checkout"), &SendOptions::default())
///     .await?;
/// assert_eq!(envelope.message_type(), "order.created");
///
/// sender.close().await?;
/// # Ok::<(), messaging_runtime::error::MessagingError>(())
/// # }).unwrap();
/// ```
pub struct MessageSender {
    link: SendLink,
}

impl MessageSender {
    /// Open a send handle on the connection's queue or topic
    pub async fn open(connection: Connection) -> Result<Self, MessagingError> {
        Ok(Self {
            link: SendLink::open(connection, "sender").await?,
        })
    }

    /// Attach an observer
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.link.observer = Some(observer);
        self
    }

    /// Replace the retry policy taken from the connection options
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.link.retry = retry;
        self
    }

    /// Connection name with the `-sender` suffix
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Validate, enrich and transmit one message.
    ///
    /// Returns the envelope that was transmitted. Schema failures are
    /// returned before any broker call; transmission failures are retried
    /// and the last one is returned once retries run out.
    pub async fn send_message(
        &self,
        message: DomainMessage,
        options: &SendOptions,
    ) -> Result<WireEnvelope, MessagingError> {
        MessageValidator::validate(&message, ValidationMode::Strict)?;
        let envelope = enrich(&message);
        self.link.trace();

        let handle = &self.link.handle;
        let outgoing = &envelope;
        let result = self
            .link
            .retry
            .run(move || bounded(options.timeout, handle.send_message(outgoing, options)))
            .await;

        match result {
            Ok(()) => {
                debug!(
                    connection = %self.link.name,
                    message_type = %envelope.message_type(),
                    "Message sent"
                );
                Ok(envelope)
            }
            Err(err) => {
                self.link.report(&err);
                Err(err)
            }
        }
    }

    /// Close the send handle and then the connection
    pub async fn close(self) -> Result<(), MessagingError> {
        self.link.close().await
    }
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
