//! Optional observability hooks.
//!
//! Components receive an `Option<Arc<dyn Observer>>` at construction. When
//! none is configured every hook is a no-op.

use crate::error::MessagingError;
use std::sync::Arc;
use tracing::{debug, error};

/// Sink for traces and exceptions raised by senders and receivers
pub trait Observer: Send + Sync {
    /// Called when a message passes through a component, labelled with the
    /// component's connection name
    fn on_trace(&self, label: &str);

    /// Called when a component reports a failure
    fn on_exception(&self, error: &MessagingError);
}

/// Forward a trace to the observer if one is configured
pub fn track_trace(observer: Option<&Arc<dyn Observer>>, label: &str) {
    if let Some(observer) = observer {
        observer.on_trace(label);
    }
}

/// Forward an exception to the observer if one is configured
pub fn track_exception(observer: Option<&Arc<dyn Observer>>, error: &MessagingError) {
    if let Some(observer) = observer {
        observer.on_exception(error);
    }
}

/// Observer that writes to the `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_trace(&self, label: &str) {
        debug!(label = %label, "trace");
    }

    fn on_exception(&self, error: &MessagingError) {
        error!(error = %error, transient = error.is_transient(), "exception");
    }
}

#[cfg(test)]
#[path = "observer_tests.rs"]
mod tests;
