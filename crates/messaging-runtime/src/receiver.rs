//! Receive path: peek, lease, settle, and handler subscriptions.
//!
//! A [`MessageReceiver`] holds exactly one active receive handle. Accepting a
//! session replaces that handle with one bound to the session and releases
//! the previous handle. Deliveries are wrapped as [`LeasedMessage`]s, so each
//! lease can be settled once and only once.
//!
//! [`MessageReceiver::subscribe`] starts a delivery loop that runs at most
//! `max_concurrent_calls` handler invocations at a time. Failures raised by
//! the loop are routed to the error handler; with the default
//! [`ErrorPolicy::Continue`] the loop keeps running after reporting them.

use crate::connection::{Connection, ConnectionOptions};
use crate::error::{ConfigurationError, MessagingError};
use crate::lease::LeasedMessage;
use crate::message::{PeekOptions, ReceiveOptions, ReceivedMessage};
use crate::observer::{track_exception, track_trace, Observer};
use crate::transport::TransportReceiver;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Default wait of one receive call inside the delivery loop
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Default pause after a failed receive before the loop tries again
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

// ============================================================================
// Handlers
// ============================================================================

/// Application callback invoked once per leased message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: LeasedMessage) -> anyhow::Result<()>;
}

/// [`MessageHandler`] backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(LeasedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_message(&self, message: LeasedMessage) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a message handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(LeasedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Receives failures raised while a subscription is running
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &MessagingError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&MessagingError) + Send + Sync,
{
    fn on_error(&self, error: &MessagingError) {
        self(error)
    }
}

// ============================================================================
// Subscription Options
// ============================================================================

/// What the delivery loop does after reporting a failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Report the failure and keep delivering
    #[default]
    Continue,

    /// Report the failure, stop delivering, and return it from
    /// [`Subscription::wait`]
    Propagate,
}

/// Dispatch settings of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Complete the lease when the handler succeeds, abandon it when it fails
    pub auto_complete_messages: bool,

    /// Upper bound on concurrent handler invocations
    pub max_concurrent_calls: usize,

    pub error_policy: ErrorPolicy,

    /// Maximum wait of each receive call
    pub receive_wait: Duration,

    /// Pause after a failed receive
    pub error_backoff: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_complete_messages: false,
            max_concurrent_calls: 1,
            error_policy: ErrorPolicy::Continue,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

impl SubscribeOptions {
    /// Take `autoCompleteMessages` and `maxConcurrentCalls` from the
    /// connection options
    pub fn from_connection_options(options: &ConnectionOptions) -> Self {
        Self {
            auto_complete_messages: options.auto_complete_messages,
            max_concurrent_calls: options.max_concurrent_calls.max(1),
            ..Self::default()
        }
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn with_receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

// ============================================================================
// Message Receiver
// ============================================================================

/// Session state of a receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBinding {
    Unbound,
    Bound(String),
}

struct ActiveHandle {
    handle: Arc<dyn TransportReceiver>,
    binding: SessionBinding,
}

type SharedHandle = Arc<RwLock<ActiveHandle>>;

fn current_handle(active: &SharedHandle) -> Arc<dyn TransportReceiver> {
    active
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .handle
        .clone()
}

struct RunningSubscription {
    stop: Arc<watch::Sender<bool>>,
    done: oneshot::Receiver<()>,
}

/// Receives and settles messages from a queue or subscription
///
/// # Examples
///
/// ```rust
/// use messaging_runtime::connection::{Connection, ConnectionOptions};
/// use messaging_runtime::message::ReceiveOptions;
/// use messaging_runtime::providers::memory::InMemoryBroker;
/// use messaging_runtime::receiver::MessageReceiver;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let options = ConnectionOptions::new("orders").with_connection_string("Endpoint=sb://memory/");
/// let receiver = MessageReceiver::open(Connection::open(options, &broker).await?).await?;
///
/// for message in receiver.receive_messages(10, &ReceiveOptions::default()).await? {
///     receiver.complete_message(&message).await?;
/// }
///
/// receiver.close().await?;
/// # Ok::<(), messaging_runtime::error::MessagingError>(())
/// # }).unwrap();
/// ```
pub struct MessageReceiver {
    name: String,
    connection: Connection,
    active: SharedHandle,
    observer: Option<Arc<dyn Observer>>,
    subscribe_options: SubscribeOptions,
    subscribed: Arc<AtomicBool>,
    running: Mutex<Option<RunningSubscription>>,
}

impl MessageReceiver {
    /// Open an unbound receive handle on the connection's queue or
    /// subscription
    pub async fn open(connection: Connection) -> Result<Self, MessagingError> {
        let handle = match connection.create_receiver().await {
            Ok(handle) => handle,
            Err(err) => return Err(connection.abort_open(err).await),
        };
        let subscribe_options = SubscribeOptions::from_connection_options(connection.options());

        Ok(Self {
            name: format!("{}-receiver", connection.name()),
            connection,
            active: Arc::new(RwLock::new(ActiveHandle {
                handle,
                binding: SessionBinding::Unbound,
            })),
            observer: None,
            subscribe_options,
            subscribed: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        })
    }

    /// Attach an observer
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replace the dispatch settings taken from the connection options
    pub fn with_subscribe_options(mut self, options: SubscribeOptions) -> Self {
        self.subscribe_options = options;
        self
    }

    /// Connection name with the `-receiver` suffix
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> SessionBinding {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .binding
            .clone()
    }

    /// Session the receiver is bound to, if any
    pub fn session_id(&self) -> Option<String> {
        match self.binding() {
            SessionBinding::Bound(session_id) => Some(session_id),
            SessionBinding::Unbound => None,
        }
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Bind the receiver to `session_id`.
    ///
    /// The new handle replaces the active one, which is then closed.
    /// Accepting the session the receiver is already bound to is a no-op.
    pub async fn accept_session(&self, session_id: &str) -> Result<(), MessagingError> {
        if self.binding() == SessionBinding::Bound(session_id.to_string()) {
            debug!(connection = %self.name, session_id = %session_id, "Session already bound");
            return Ok(());
        }

        let handle = self.connection.accept_session(session_id).await?;
        self.replace_handle(handle, session_id.to_string()).await;
        Ok(())
    }

    /// Bind the receiver to whichever session the broker hands out next
    pub async fn accept_next_session(&self) -> Result<String, MessagingError> {
        let handle = self.connection.accept_next_session().await?;
        let session_id = match handle.session_id() {
            Some(session_id) => session_id.to_string(),
            None => {
                if let Err(err) = handle.close().await {
                    warn!(
                        connection = %self.name,
                        error = %err,
                        "Failed to close sessionless receive handle"
                    );
                }
                return Err(MessagingError::SessionUnavailable {
                    entity: handle.entity().to_string(),
                });
            }
        };

        self.replace_handle(handle, session_id.clone()).await;
        Ok(session_id)
    }

    async fn replace_handle(&self, handle: Arc<dyn TransportReceiver>, session_id: String) {
        let previous = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(
                &mut *active,
                ActiveHandle {
                    handle,
                    binding: SessionBinding::Bound(session_id.clone()),
                },
            )
        };

        if let Err(err) = previous.handle.close().await {
            warn!(connection = %self.name, error = %err, "Failed to close replaced receive handle");
        }
        info!(connection = %self.name, session_id = %session_id, "Session accepted");
    }

    // ------------------------------------------------------------------------
    // Receive and settle
    // ------------------------------------------------------------------------

    /// Browse up to `max_messages` without leasing them
    pub async fn peek_messages(
        &self,
        max_messages: usize,
        options: &PeekOptions,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        current_handle(&self.active)
            .peek_messages(max_messages, options)
            .await
    }

    /// Lease up to `max_messages`
    pub async fn receive_messages(
        &self,
        max_messages: usize,
        options: &ReceiveOptions,
    ) -> Result<Vec<LeasedMessage>, MessagingError> {
        let handle = current_handle(&self.active);
        let received = handle.receive_messages(max_messages, options).await?;
        lease_all(received, &handle)
    }

    /// Lease deferred messages by sequence number
    pub async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<LeasedMessage>, MessagingError> {
        let handle = current_handle(&self.active);
        let received = handle.receive_deferred_messages(sequence_numbers).await?;
        lease_all(received, &handle)
    }

    pub async fn complete_message(&self, message: &LeasedMessage) -> Result<(), MessagingError> {
        message.complete().await
    }

    pub async fn abandon_message(&self, message: &LeasedMessage) -> Result<(), MessagingError> {
        message.abandon().await
    }

    pub async fn dead_letter_message(
        &self,
        message: &LeasedMessage,
        reason: Option<&str>,
    ) -> Result<(), MessagingError> {
        message.dead_letter(reason).await
    }

    pub async fn defer_message(&self, message: &LeasedMessage) -> Result<(), MessagingError> {
        message.defer().await
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Start delivering leased messages to `handler`.
    ///
    /// Without an `on_error` handler failures are logged and forwarded to the
    /// observer. Only one subscription may run per receiver.
    pub fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
        on_error: Option<Arc<dyn ErrorHandler>>,
    ) -> Result<Subscription, MessagingError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(ConfigurationError::Invalid {
                message: format!("receiver '{}' already has an active subscription", self.name),
            }
            .into());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let (done_tx, done_rx) = oneshot::channel();

        let dispatcher = Arc::new(Dispatcher {
            name: self.name.clone(),
            active: self.active.clone(),
            handler,
            on_error,
            observer: self.observer.clone(),
            options: self.subscribe_options.clone(),
        });

        info!(
            connection = %self.name,
            max_concurrent_calls = self.subscribe_options.max_concurrent_calls,
            auto_complete = self.subscribe_options.auto_complete_messages,
            "Subscription started"
        );
        let subscribed = self.subscribed.clone();
        let task = tokio::spawn(async move {
            let result = dispatcher.run(stop_rx).await;
            subscribed.store(false, Ordering::SeqCst);
            drop(done_tx);
            result
        });

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunningSubscription {
            stop: stop.clone(),
            done: done_rx,
        });

        Ok(Subscription {
            name: self.name.clone(),
            stop,
            task,
        })
    }

    /// Stop any subscription, close the receive handle and then the
    /// connection
    pub async fn close(self) -> Result<(), MessagingError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.stop.send_replace(true);
            // Resolves once the delivery loop has drained
            let _ = running.done.await;
        }

        let handle_result = current_handle(&self.active).close().await;
        if let Err(err) = &handle_result {
            warn!(connection = %self.name, error = %err, "Failed to close receive handle");
        }

        let connection_result = self.connection.close().await;
        info!(connection = %self.name, "{} connection closed", self.name);

        handle_result.and(connection_result)
    }
}

fn lease_all(
    received: Vec<ReceivedMessage>,
    handle: &Arc<dyn TransportReceiver>,
) -> Result<Vec<LeasedMessage>, MessagingError> {
    received
        .into_iter()
        .map(|message| LeasedMessage::from_received(message, handle.clone()))
        .collect()
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle of a running delivery loop
pub struct Subscription {
    name: String,
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<(), MessagingError>>,
}

impl Subscription {
    /// Ask the loop to stop receiving. In-flight handlers still finish.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end.
    ///
    /// Returns the failure that stopped it under [`ErrorPolicy::Propagate`].
    pub async fn wait(self) -> Result<(), MessagingError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(MessagingError::Subscription {
                entity: self.name,
                message: format!("delivery loop failed: {}", err),
            }),
        }
    }

    /// Stop the loop and wait for in-flight handlers
    pub async fn close(self) -> Result<(), MessagingError> {
        self.stop();
        self.wait().await
    }
}

// ============================================================================
// Delivery Loop
// ============================================================================

struct Dispatcher {
    name: String,
    active: SharedHandle,
    handler: Arc<dyn MessageHandler>,
    on_error: Option<Arc<dyn ErrorHandler>>,
    observer: Option<Arc<dyn Observer>>,
    options: SubscribeOptions,
}

impl Dispatcher {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<(), MessagingError> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_calls.max(1)));
        let receive_options = ReceiveOptions::new().with_max_wait(self.options.receive_wait);
        let mut in_flight: JoinSet<Result<(), MessagingError>> = JoinSet::new();
        let mut outcome = Ok(());

        'delivery: while !*stop.borrow() {
            let permit = tokio::select! {
                biased;
                _ = stop.changed() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = self.reap(joined) {
                        outcome = Err(err);
                        break;
                    }
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let handle = current_handle(&self.active);
            let capacity = 1 + permits.available_permits();
            let received = tokio::select! {
                biased;
                _ = stop.changed() => break,
                received = handle.receive_messages(capacity, &receive_options) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(err) => {
                    drop(permit);
                    let err = MessagingError::Subscription {
                        entity: handle.entity().to_string(),
                        message: err.to_string(),
                    };
                    self.report(&err);
                    if self.options.error_policy == ErrorPolicy::Propagate {
                        outcome = Err(err);
                        break;
                    }

                    tokio::select! {
                        biased;
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(self.options.error_backoff) => {}
                    }
                    continue;
                }
            };

            let mut first = Some(permit);
            for message in messages {
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break 'delivery,
                    },
                };

                match LeasedMessage::from_received(message, handle.clone()) {
                    Ok(leased) => {
                        in_flight.spawn(self.clone().dispatch(leased, permit));
                    }
                    Err(err) => {
                        self.report(&err);
                        if self.options.error_policy == ErrorPolicy::Propagate {
                            outcome = Err(err);
                            break 'delivery;
                        }
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = self.reap(joined) {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        info!(connection = %self.name, "Subscription stopped");
        outcome
    }

    /// Run the handler for one lease and settle it when auto-complete is on
    async fn dispatch(
        self: Arc<Self>,
        leased: LeasedMessage,
        _permit: OwnedSemaphorePermit,
    ) -> Result<(), MessagingError> {
        track_trace(self.observer.as_ref(), &self.name);
        let message_id = leased.message().message_id.to_string();

        match self.handler.on_message(leased.clone()).await {
            Ok(()) => {
                if self.options.auto_complete_messages && !leased.is_settled() {
                    leased.complete().await?;
                }
                debug!(connection = %self.name, message_id = %message_id, "Message handled");
                Ok(())
            }
            Err(err) => {
                if self.options.auto_complete_messages && !leased.is_settled() {
                    if let Err(abandon_err) = leased.abandon().await {
                        warn!(
                            connection = %self.name,
                            message_id = %message_id,
                            error = %abandon_err,
                            "Failed to abandon message after handler error"
                        );
                    }
                }
                Err(MessagingError::Handler {
                    message_id,
                    reason: format!("{:#}", err),
                })
            }
        }
    }

    /// Report a finished handler; returns the error only when it must stop
    /// the loop
    fn reap(
        &self,
        joined: Result<Result<(), MessagingError>, JoinError>,
    ) -> Result<(), MessagingError> {
        let err = match joined {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err,
            Err(join_error) => MessagingError::Subscription {
                entity: self.name.clone(),
                message: format!("handler task failed: {}", join_error),
            },
        };

        self.report(&err);
        match self.options.error_policy {
            ErrorPolicy::Continue => Ok(()),
            ErrorPolicy::Propagate => Err(err),
        }
    }

    fn report(&self, err: &MessagingError) {
        match &self.on_error {
            Some(handler) => handler.on_error(err),
            None => {
                error!(connection = %self.name, error = %err, "Subscription error");
                track_exception(self.observer.as_ref(), err);
            }
        }
    }
}

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;
