//! Common test utilities for messaging-runtime integration tests
//!
//! This module provides:
//! - Tracing setup for test output
//! - A recording observer
//! - Builders for connection options and messages

use messaging_runtime::providers::InMemoryBroker;
use messaging_runtime::{
    Connection, ConnectionOptions, DomainMessage, LeasedMessage, MessagingError, Observer,
};
use serde_json::json;
use std::sync::{Arc, Mutex, Once};
use tracing::debug;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
///
/// Honors `RUST_LOG`; defaults to `messaging_runtime=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("messaging_runtime=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Recording Observer
// ============================================================================

/// Observer that keeps every trace label and exception message
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingObserver {
    traces: Mutex<Vec<String>>,
    exceptions: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn traces(&self) -> Vec<String> {
        self.traces.lock().unwrap().clone()
    }

    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().unwrap().clone()
    }
}

impl Observer for RecordingObserver {
    fn on_trace(&self, label: &str) {
        self.traces.lock().unwrap().push(label.to_string());
    }

    fn on_exception(&self, error: &MessagingError) {
        debug!(error = %error, "Recorded exception");
        self.exceptions.lock().unwrap().push(error.to_string());
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Options for `address` with a connection string the in-memory broker accepts
#[allow(dead_code)]
pub fn options(address: &str) -> ConnectionOptions {
    ConnectionOptions::new(address).with_connection_string("Endpoint=sb://memory/")
}

#[allow(dead_code)]
pub async fn connect(broker: &InMemoryBroker, options: ConnectionOptions) -> Connection {
    debug!(
        address = %options.address,
        entity_type = %options.entity_type,
        "Opening test connection"
    );
    Connection::open(options, broker).await.unwrap()
}

/// Message with body `{"n": n}`
#[allow(dead_code)]
pub fn numbered(n: u64) -> DomainMessage {
    DomainMessage::new("order.created", "checkout").with_body(json!({ "n": n }))
}

#[allow(dead_code)]
pub fn number_of(message: &LeasedMessage) -> u64 {
    message
        .message()
        .body()
        .and_then(|body| body["n"].as_u64())
        .unwrap()
}
