//! Size-bounded batch packing.
//!
//! [`MessageBatchSender::send_batch`] greedily fills broker batches in input
//! order and flushes each one through the retry policy as soon as the next
//! message does not fit. A message too large for an empty batch aborts the
//! call; batches flushed before that point stay sent.

use crate::connection::Connection;
use crate::error::{MessagingError, PartialBatchError};
use crate::message::{enrich, DomainMessage, SendOptions, WireEnvelope};
use crate::observer::Observer;
use crate::retry::RetryPolicy;
use crate::schema::{MessageValidator, ValidationMode};
use crate::sender::SendLink;
use crate::transport::bounded;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// Message Batch
// ============================================================================

/// Append-only accumulator with a byte capacity set by the broker
///
/// Not safe for concurrent packing; one writer at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBatch {
    max_size_in_bytes: usize,
    size_in_bytes: usize,
    envelopes: Vec<WireEnvelope>,
}

impl MessageBatch {
    /// Create an empty batch with the given capacity
    pub fn new(max_size_in_bytes: usize) -> Self {
        Self {
            max_size_in_bytes,
            size_in_bytes: 0,
            envelopes: Vec::new(),
        }
    }

    /// Append `envelope` if it fits.
    ///
    /// Returns `Ok(false)` when the batch has no room left for it.
    pub fn try_add_message(&mut self, envelope: &WireEnvelope) -> Result<bool, MessagingError> {
        let size = envelope.encoded_len()?;
        let next = self.size_in_bytes.saturating_add(size);
        if next > self.max_size_in_bytes {
            return Ok(false);
        }

        self.size_in_bytes = next;
        self.envelopes.push(envelope.clone());
        Ok(true)
    }

    pub fn count(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Encoded size of the envelopes added so far
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn max_size_in_bytes(&self) -> usize {
        self.max_size_in_bytes
    }

    pub fn envelopes(&self) -> &[WireEnvelope] {
        &self.envelopes
    }

    pub fn into_envelopes(self) -> Vec<WireEnvelope> {
        self.envelopes
    }
}

// ============================================================================
// Batch Sender
// ============================================================================

/// Outcome of a batch send that ran to completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Messages accepted by the broker
    pub transmitted_messages: usize,

    /// Batches accepted by the broker
    pub batches_flushed: usize,
}

impl BatchReceipt {
    fn record(&mut self, batch: &MessageBatch) {
        self.transmitted_messages += batch.count();
        self.batches_flushed += 1;
    }

    fn abort(self, source: MessagingError) -> PartialBatchError {
        PartialBatchError {
            transmitted_messages: self.transmitted_messages,
            batches_flushed: self.batches_flushed,
            source,
        }
    }
}

/// Sends ordered sequences of messages in as few round trips as fit
///
/// Concurrent `send_batch` calls on one instance must be serialized by the
/// caller.
pub struct MessageBatchSender {
    link: SendLink,
}

impl MessageBatchSender {
    /// Open a send handle on the connection's queue or topic
    pub async fn open(connection: Connection) -> Result<Self, MessagingError> {
        Ok(Self {
            link: SendLink::open(connection, "batch-sender").await?,
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

    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Pack `messages` into broker batches and transmit them in order.
    ///
    /// Every message is validated in allow-unknown mode and enriched before
    /// it is appended. On failure the returned [`PartialBatchError`] reports
    /// how much was already transmitted.
    pub async fn send_batch(
        &self,
        messages: Vec<DomainMessage>,
        options: &SendOptions,
    ) -> Result<BatchReceipt, PartialBatchError> {
        let mut receipt = BatchReceipt::default();
        if messages.is_empty() {
            return Ok(receipt);
        }

        let mut batch = self.new_batch().await.map_err(|e| self.fail(receipt, e))?;

        for (position, message) in messages.iter().enumerate() {
            MessageValidator::validate(message, ValidationMode::AllowUnknown)
                .map_err(|e| self.fail(receipt, e.into()))?;
            let envelope = enrich(message);
            self.link.trace();

            if batch
                .try_add_message(&envelope)
                .map_err(|e| self.fail(receipt, e))?
            {
                continue;
            }

            if !batch.is_empty() {
                self.flush(&batch, options)
                    .await
                    .map_err(|e| self.fail(receipt, e))?;
                receipt.record(&batch);

                batch = self.new_batch().await.map_err(|e| self.fail(receipt, e))?;
                if batch
                    .try_add_message(&envelope)
                    .map_err(|e| self.fail(receipt, e))?
                {
                    continue;
                }
            }

            return Err(self.fail(
                receipt,
                MessagingError::Oversize {
                    position,
                    max_size_in_bytes: batch.max_size_in_bytes(),
                },
            ));
        }

        if !batch.is_empty() {
            self.flush(&batch, options)
                .await
                .map_err(|e| self.fail(receipt, e))?;
            receipt.record(&batch);
        }

        info!(
            connection = %self.link.name,
            messages = receipt.transmitted_messages,
            batches = receipt.batches_flushed,
            "Batch send complete"
        );
        Ok(receipt)
    }

    /// Close the send handle and then the connection
    pub async fn close(self) -> Result<(), MessagingError> {
        self.link.close().await
    }

    async fn new_batch(&self) -> Result<MessageBatch, MessagingError> {
        self.link.handle.create_message_batch().await
    }

    async fn flush(&self, batch: &MessageBatch, options: &SendOptions) -> Result<(), MessagingError> {
        let handle = &self.link.handle;
        self.link
            .retry
            .run(move || bounded(options.timeout, handle.send_batch(batch, options)))
            .await?;

        debug!(
            connection = %self.link.name,
            count = batch.count(),
            size_in_bytes = batch.size_in_bytes(),
            "Batch flushed"
        );
        Ok(())
    }

    fn fail(&self, receipt: BatchReceipt, error: MessagingError) -> PartialBatchError {
        if error.is_structural() {
            warn!(
                connection = %self.link.name,
                transmitted = receipt.transmitted_messages,
                error = %error,
                "Batch send rejected a message"
            );
        } else {
            error!(
                connection = %self.link.name,
                transmitted = receipt.transmitted_messages,
                batches = receipt.batches_flushed,
                error = %error,
                "Batch send failed"
            );
        }
        self.link.report(&error);
        receipt.abort(error)
    }
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
