//! Tests for batch packing and the batch sender.

use super::*;
use crate::connection::ConnectionOptions;
use crate::providers::memory::{InMemoryBroker, InMemoryBrokerConfig};
use serde_json::json;

fn numbered(n: u32) -> DomainMessage {
    DomainMessage::new("T", "S").with_body(json!({ "n": n }))
}

fn encoded_len(message: &DomainMessage) -> usize {
    enrich(message).encoded_len().unwrap()
}

fn bodies(envelopes: &[WireEnvelope]) -> Vec<u64> {
    envelopes
        .iter()
        .map(|envelope| envelope.body.as_ref().and_then(|b| b["n"].as_u64()).unwrap())
        .collect()
}

/// Broker whose batches hold exactly `fit` single-digit numbered messages
fn broker_fitting(fit: usize) -> InMemoryBroker {
    InMemoryBroker::with_config(InMemoryBrokerConfig {
        max_batch_size_bytes: encoded_len(&numbered(1)) * fit,
        ..InMemoryBrokerConfig::default()
    })
}

async fn open_batch_sender(broker: &InMemoryBroker) -> MessageBatchSender {
    let options = ConnectionOptions::new("orders")
        .with_connection_string("Endpoint=sb://memory/")
        .with_retry(1, 50, false);
    let connection = Connection::open(options, broker).await.unwrap();
    MessageBatchSender::open(connection).await.unwrap()
}

// ============================================================================
// Message Batch Tests
// ============================================================================

mod message_batch_tests {
    use super::*;

    #[test]
    fn test_new_batch_is_empty() {
        let batch = MessageBatch::new(1024);

        assert!(batch.is_empty());
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.size_in_bytes(), 0);
        assert_eq!(batch.max_size_in_bytes(), 1024);
    }

    /// Verify the batch accepts envelopes until the capacity is reached.
    #[test]
    fn test_try_add_respects_capacity() {
        let envelope = enrich(&numbered(1));
        let size = envelope.encoded_len().unwrap();
        let mut batch = MessageBatch::new(size * 2);

        assert!(batch.try_add_message(&envelope).unwrap());
        assert!(batch.try_add_message(&envelope).unwrap());
        assert!(!batch.try_add_message(&envelope).unwrap());

        assert_eq!(batch.count(), 2);
        assert_eq!(batch.size_in_bytes(), size * 2);
    }

    #[test]
    fn test_envelope_larger_than_capacity_is_refused() {
        let envelope = enrich(&numbered(1));
        let mut batch = MessageBatch::new(envelope.encoded_len().unwrap() - 1);

        assert!(!batch.try_add_message(&envelope).unwrap());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_into_envelopes_keeps_insertion_order() {
        let mut batch = MessageBatch::new(4096);
        for n in [3, 1, 2] {
            batch.try_add_message(&enrich(&numbered(n))).unwrap();
        }

        assert_eq!(bodies(batch.envelopes()), vec![3, 1, 2]);
        assert_eq!(bodies(&batch.into_envelopes()), vec![3, 1, 2]);
    }
}

// ============================================================================
// Batch Sender Tests
// ============================================================================

mod batch_sender_tests {
    use super::*;

    /// Verify batches are packed greedily in input order.
    #[tokio::test]
    async fn test_packs_greedily_in_order() {
        // Arrange
        let broker = broker_fitting(2);
        let sender = open_batch_sender(&broker).await;

        // Act
        let receipt = sender
            .send_batch(vec![numbered(1), numbered(2), numbered(3)], &SendOptions::default())
            .await
            .unwrap();

        // Assert
        assert_eq!(
            receipt,
            BatchReceipt {
                transmitted_messages: 3,
                batches_flushed: 2,
            }
        );
        let transmissions = broker.transmissions();
        assert_eq!(transmissions.len(), 2);
        assert_eq!(bodies(&transmissions[0].envelopes), vec![1, 2]);
        assert_eq!(bodies(&transmissions[1].envelopes), vec![3]);
    }

    #[tokio::test]
    async fn test_single_message_capacity_sends_one_batch_each() {
        let broker = broker_fitting(1);
        let sender = open_batch_sender(&broker).await;

        let receipt = sender
            .send_batch(vec![numbered(1), numbered(2), numbered(3)], &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt.batches_flushed, 3);
        assert_eq!(
            broker
                .transmissions()
                .iter()
                .map(|t| bodies(&t.envelopes))
                .collect::<Vec<_>>(),
            vec![vec![1], vec![2], vec![3]]
        );
    }

    #[tokio::test]
    async fn test_empty_input_sends_nothing() {
        let broker = InMemoryBroker::new();
        let sender = open_batch_sender(&broker).await;

        let receipt = sender
            .send_batch(Vec::new(), &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt, BatchReceipt::default());
        assert_eq!(broker.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unknown_fields_are_allowed_and_dropped() {
        let broker = InMemoryBroker::new();
        let sender = open_batch_sender(&broker).await;

        sender
            .send_batch(
                vec![numbered(1).with_extra_field("priority", json!("high"))],
                &SendOptions::default(),
            )
            .await
            .unwrap();

        let sent = &broker.transmissions()[0].envelopes[0];
        assert!(!serde_json::to_string(sent).unwrap().contains("priority"));
    }

    /// Verify an oversize first message aborts before any transmission.
    #[tokio::test]
    async fn test_oversize_message_aborts_without_sending() {
        // Arrange
        let broker = broker_fitting(1);
        let sender = open_batch_sender(&broker).await;
        let oversize = DomainMessage::new("T", "S").with_body(json!({ "n": 1, "pad": "x".repeat(64) }));

        // Act
        let err = sender
            .send_batch(vec![oversize, numbered(2)], &SendOptions::default())
            .await
            .unwrap_err();

        // Assert
        assert_eq!(err.transmitted_messages, 0);
        assert_eq!(err.batches_flushed, 0);
        assert!(matches!(
            err.source,
            MessagingError::Oversize { position: 0, .. }
        ));
        assert!(broker.transmissions().is_empty());
    }

    /// Verify batches flushed before an oversize message stay sent.
    #[tokio::test]
    async fn test_oversize_after_flush_keeps_earlier_batches() {
        let broker = broker_fitting(1);
        let sender = open_batch_sender(&broker).await;
        let oversize = DomainMessage::new("T", "S").with_body(json!({ "n": 9, "pad": "x".repeat(64) }));

        let err = sender
            .send_batch(vec![numbered(1), oversize, numbered(3)], &SendOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.transmitted_messages, 1);
        assert_eq!(err.batches_flushed, 1);
        assert!(matches!(
            err.source,
            MessagingError::Oversize { position: 1, .. }
        ));
        let transmissions = broker.transmissions();
        assert_eq!(transmissions.len(), 1);
        assert_eq!(bodies(&transmissions[0].envelopes), vec![1]);
    }

    #[tokio::test]
    async fn test_invalid_message_reports_progress() {
        let broker = broker_fitting(1);
        let sender = open_batch_sender(&broker).await;

        let err = sender
            .send_batch(
                vec![numbered(1), numbered(2), DomainMessage::new("T", "")],
                &SendOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err.source, MessagingError::Validation(_)));
        assert_eq!(err.transmitted_messages, 1);
        assert_eq!(broker.transmissions().len(), 1);
    }

    /// Verify a flush is retried and counted once when it succeeds.
    #[tokio::test(start_paused = true)]
    async fn test_flush_is_retried() {
        let broker = broker_fitting(2);
        let sender = open_batch_sender(&broker).await;
        broker.fail_next_sends(1);

        let receipt = sender
            .send_batch(vec![numbered(1), numbered(2)], &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(receipt.batches_flushed, 1);
        assert_eq!(broker.send_attempts(), 2);
        assert_eq!(broker.transmissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_failure_after_retries_is_partial() {
        let broker = broker_fitting(1);
        let sender = open_batch_sender(&broker).await;

        let first = sender
            .send_batch(vec![numbered(1)], &SendOptions::default())
            .await
            .unwrap();
        broker.fail_next_sends(2);
        let err = sender
            .send_batch(vec![numbered(2), numbered(3)], &SendOptions::default())
            .await
            .unwrap_err();

        assert_eq!(first.transmitted_messages, 1);
        assert_eq!(err.transmitted_messages, 0);
        assert!(matches!(err.source, MessagingError::Transmission { .. }));
    }

    #[tokio::test]
    async fn test_sender_name_has_suffix() {
        let broker = InMemoryBroker::new();

        let sender = open_batch_sender(&broker).await;

        assert_eq!(sender.name(), "orders-batch-sender");
    }
}
