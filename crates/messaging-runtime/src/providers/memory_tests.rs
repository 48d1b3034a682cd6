//! Tests for the in-memory broker.

use super::*;
use crate::message::{enrich, DomainMessage};
use serde_json::json;

fn credential() -> Credential {
    Credential::ConnectionString("Endpoint=sb://memory/".to_string())
}

async fn client(broker: &InMemoryBroker) -> Arc<dyn BrokerClient> {
    broker.connect(&credential()).await.unwrap()
}

fn envelope(n: u32) -> WireEnvelope {
    enrich(&DomainMessage::new("T", "S").with_body(json!({ "n": n })))
}

fn session_envelope(session_id: &str, n: u32) -> WireEnvelope {
    enrich(
        &DomainMessage::new("T", "S")
            .with_body(json!({ "n": n }))
            .with_session_id(session_id),
    )
}

fn queue(name: &str) -> EntityPath {
    EntityPath::Queue(name.to_string())
}

fn body_numbers(messages: &[ReceivedMessage]) -> Vec<u64> {
    messages
        .iter()
        .map(|message| message.body().and_then(|body| body["n"].as_u64()).unwrap())
        .collect()
}

async fn send_all(client: &Arc<dyn BrokerClient>, path: &EntityPath, envelopes: &[WireEnvelope]) {
    let sender = client.create_sender(path).await.unwrap();
    for envelope in envelopes {
        sender
            .send_message(envelope, &SendOptions::default())
            .await
            .unwrap();
    }
}

// ============================================================================
// Queue Tests
// ============================================================================

mod queue_tests {
    use super::*;

    /// Verify messages are leased in send order with increasing sequence numbers.
    #[tokio::test]
    async fn test_receive_in_send_order() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1), envelope(2), envelope(3)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();

        let received = receiver
            .receive_messages(10, &ReceiveOptions::default())
            .await
            .unwrap();

        assert_eq!(body_numbers(&received), vec![1, 2, 3]);
        assert!(received.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
        assert!(received.iter().all(|m| m.lock_token.is_some() && m.delivery_count == 1));
        assert_eq!(broker.active_message_count("orders"), 3);
    }

    #[tokio::test]
    async fn test_complete_removes_message() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        let received = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();

        receiver
            .complete(received[0].lock_token.as_ref().unwrap())
            .await
            .unwrap();

        assert_eq!(broker.active_message_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_settling_unknown_lock_fails() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();

        let result = receiver.complete(&LockToken::new()).await;

        assert!(matches!(result, Err(MessagingError::Settlement { .. })));
    }

    #[tokio::test]
    async fn test_abandon_redelivers_with_higher_delivery_count() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        let first = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();

        receiver
            .abandon(first[0].lock_token.as_ref().unwrap())
            .await
            .unwrap();
        let second = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();

        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_count, 2);
        assert_ne!(second[0].lock_token, first[0].lock_token);
    }

    /// Verify abandoning past the maximum delivery count dead-letters the message.
    #[tokio::test]
    async fn test_max_delivery_count_dead_letters() {
        let broker = InMemoryBroker::with_config(InMemoryBrokerConfig {
            max_delivery_count: 2,
            ..InMemoryBrokerConfig::default()
        });
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();

        for _ in 0..2 {
            let received = receiver
                .receive_messages(1, &ReceiveOptions::default())
                .await
                .unwrap();
            receiver
                .abandon(received[0].lock_token.as_ref().unwrap())
                .await
                .unwrap();
        }

        let dead = broker.dead_letter_messages("orders");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(MAX_DELIVERY_COUNT_EXCEEDED));
        assert_eq!(broker.active_message_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_records_reason() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        let received = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();

        receiver
            .dead_letter(received[0].lock_token.as_ref().unwrap(), Some("poison"))
            .await
            .unwrap();

        let dead = broker.dead_letter_messages("orders");
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("poison"));
    }

    /// Verify deferred messages are only retrievable by sequence number.
    #[tokio::test]
    async fn test_defer_and_receive_deferred() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        let received = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();
        let sequence_number = received[0].sequence_number;

        receiver
            .defer(received[0].lock_token.as_ref().unwrap())
            .await
            .unwrap();

        assert!(receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(broker.deferred_message_count("orders"), 1);

        let deferred = receiver
            .receive_deferred_messages(&[sequence_number])
            .await
            .unwrap();
        assert_eq!(deferred.len(), 1);
        assert!(deferred[0].lock_token.is_some());
        assert_eq!(broker.deferred_message_count("orders"), 0);
        assert!(matches!(
            receiver.receive_deferred_messages(&[sequence_number]).await,
            Err(MessagingError::EntityNotFound { .. })
        ));
    }

    /// Verify an expired lease returns the message to the queue.
    #[tokio::test(start_paused = true)]
    async fn test_lock_expiry_releases_message() {
        let broker = InMemoryBroker::with_config(InMemoryBrokerConfig {
            lock_duration: Duration::from_secs(5),
            ..InMemoryBrokerConfig::default()
        });
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        let first = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let expired = receiver
            .complete(first[0].lock_token.as_ref().unwrap())
            .await;
        assert!(matches!(expired, Err(MessagingError::Settlement { .. })));
        let again = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .unwrap();
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_peek_does_not_lease() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        send_all(&client, &queue("orders"), &[envelope(1), envelope(2), envelope(3)]).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();

        let peeked = receiver
            .peek_messages(2, &PeekOptions::default())
            .await
            .unwrap();
        let from_third = receiver
            .peek_messages(10, &PeekOptions::new().from_sequence_number(peeked[1].sequence_number + 1))
            .await
            .unwrap();
        let leased = receiver
            .receive_messages(10, &ReceiveOptions::default())
            .await
            .unwrap();

        assert_eq!(body_numbers(&peeked), vec![1, 2]);
        assert!(peeked.iter().all(|m| m.lock_token.is_none()));
        assert_eq!(body_numbers(&from_third), vec![3]);
        assert_eq!(leased.len(), 3);
        assert!(leased.iter().all(|m| m.delivery_count == 1));
    }

    /// Verify a waiting receive wakes up when a message arrives.
    #[tokio::test(start_paused = true)]
    async fn test_receive_waits_for_message() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        let sender = client.create_sender(&queue("orders")).await.unwrap();

        let waiting = tokio::spawn(async move {
            receiver
                .receive_messages(1, &ReceiveOptions::new().with_max_wait(Duration::from_secs(30)))
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        sender
            .send_message(&envelope(7), &SendOptions::default())
            .await
            .unwrap();

        let received = waiting.await.unwrap().unwrap();
        assert_eq!(body_numbers(&received), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_returns_empty_after_max_wait() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();

        let received = receiver
            .receive_messages(1, &ReceiveOptions::new().with_max_wait(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(received.is_empty());
    }
}

// ============================================================================
// Topic Tests
// ============================================================================

mod topic_tests {
    use super::*;

    #[tokio::test]
    async fn test_topic_fans_out_to_every_subscription() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", &["audit", "billing"]);
        let client = client(&broker).await;

        send_all(&client, &EntityPath::Topic("events".to_string()), &[envelope(1)]).await;

        assert_eq!(broker.active_message_count("events/subscriptions/audit"), 1);
        assert_eq!(broker.active_message_count("events/subscriptions/billing"), 1);
        assert_eq!(broker.transmissions().len(), 1);
        assert_eq!(broker.transmissions()[0].entity, "events");
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_found() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let sender = client
            .create_sender(&EntityPath::Topic("missing".to_string()))
            .await
            .unwrap();

        let result = sender.send_message(&envelope(1), &SendOptions::default()).await;

        assert!(matches!(result, Err(MessagingError::EntityNotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_subscription_cannot_be_received() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;

        let result = client
            .create_receiver(&EntityPath::Subscription {
                topic: "events".to_string(),
                subscription: "missing".to_string(),
            })
            .await;

        assert!(matches!(result, Err(MessagingError::EntityNotFound { .. })));
    }
}

// ============================================================================
// Session Tests
// ============================================================================

mod session_tests {
    use super::*;

    async fn session_queue(broker: &InMemoryBroker) -> Arc<dyn BrokerClient> {
        broker.create_session_queue("jobs");
        let client = client(broker).await;
        send_all(
            &client,
            &queue("jobs"),
            &[
                session_envelope("A", 1),
                session_envelope("B", 2),
                session_envelope("A", 3),
            ],
        )
        .await;
        client
    }

    #[tokio::test]
    async fn test_session_receiver_only_sees_its_session() {
        let broker = InMemoryBroker::new();
        let client = session_queue(&broker).await;

        let receiver = client.accept_session(&queue("jobs"), "A").await.unwrap();
        let received = receiver
            .receive_messages(10, &ReceiveOptions::default())
            .await
            .unwrap();

        assert_eq!(receiver.session_id(), Some("A"));
        assert_eq!(body_numbers(&received), vec![1, 3]);
    }

    /// Verify a locked session cannot be accepted by a second receiver.
    #[tokio::test]
    async fn test_session_lock_is_exclusive() {
        let broker = InMemoryBroker::new();
        let client = session_queue(&broker).await;
        let _holder = client.accept_session(&queue("jobs"), "A").await.unwrap();

        let result = client.accept_session(&queue("jobs"), "A").await;

        assert!(matches!(
            result,
            Err(MessagingError::SessionLocked { ref session_id }) if session_id == "A"
        ));
        assert_eq!(broker.locked_sessions("jobs"), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_accept_next_session_skips_locked_sessions() {
        let broker = InMemoryBroker::new();
        let client = session_queue(&broker).await;
        let _holder = client.accept_session(&queue("jobs"), "A").await.unwrap();

        let next = client.accept_next_session(&queue("jobs")).await.unwrap();

        assert_eq!(next.session_id(), Some("B"));
        assert!(matches!(
            client.accept_next_session(&queue("jobs")).await,
            Err(MessagingError::SessionUnavailable { .. })
        ));
    }

    /// Verify closing a session receiver releases the session and its leases.
    #[tokio::test]
    async fn test_close_releases_session_and_leases() {
        let broker = InMemoryBroker::new();
        let client = session_queue(&broker).await;
        let first = client.accept_session(&queue("jobs"), "A").await.unwrap();
        first
            .receive_messages(10, &ReceiveOptions::default())
            .await
            .unwrap();

        first.close().await.unwrap();
        let second = client.accept_session(&queue("jobs"), "A").await.unwrap();
        let received = second
            .receive_messages(10, &ReceiveOptions::default())
            .await
            .unwrap();

        assert_eq!(body_numbers(&received), vec![1, 3]);
        assert!(broker.handle_events().contains(&HandleEvent::ReceiverClosed {
            entity: "jobs".to_string(),
            session_id: Some("A".to_string()),
        }));
    }

    #[tokio::test]
    async fn test_session_entity_rejects_plain_receive() {
        let broker = InMemoryBroker::new();
        let client = session_queue(&broker).await;
        let receiver = client.create_receiver(&queue("jobs")).await.unwrap();

        let result = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await;

        assert!(matches!(result, Err(MessagingError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_plain_queue_rejects_sessions() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;

        let result = client.accept_session(&queue("orders"), "A").await;

        assert!(matches!(result, Err(MessagingError::Configuration(_))));
    }
}

// ============================================================================
// Fault Injection and Records Tests
// ============================================================================

mod records_tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_send_failures_are_counted() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let sender = client.create_sender(&queue("orders")).await.unwrap();
        broker.fail_next_sends(2);

        let first = sender.send_message(&envelope(1), &SendOptions::default()).await;
        let second = sender.send_message(&envelope(1), &SendOptions::default()).await;
        let third = sender.send_message(&envelope(1), &SendOptions::default()).await;

        assert!(matches!(first, Err(MessagingError::Transmission { .. })));
        assert!(second.is_err());
        assert!(third.is_ok());
        assert_eq!(broker.send_attempts(), 3);
        assert_eq!(broker.transmissions().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_receive_failure() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        broker.fail_next_receives(1);

        let result = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await;

        assert!(matches!(result, Err(MessagingError::Connection { .. })));
        assert!(receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .is_ok());
    }

    /// Verify an injected close failure leaves the handle open so a later
    /// close releases it.
    #[tokio::test]
    async fn test_injected_close_failure_keeps_handle_open() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();
        broker.fail_next_handle_closes(1);

        let first = receiver.close().await;
        let still_open = receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await;
        let second = receiver.close().await;

        assert!(matches!(first, Err(MessagingError::Connection { .. })));
        assert!(still_open.is_ok());
        assert!(second.is_ok());
        assert_eq!(
            broker.handle_events(),
            vec![HandleEvent::ReceiverClosed {
                entity: "orders".to_string(),
                session_id: None
            }]
        );
    }

    #[tokio::test]
    async fn test_batches_are_capped_by_configured_size() {
        let broker = InMemoryBroker::with_config(InMemoryBrokerConfig {
            max_batch_size_bytes: 512,
            ..InMemoryBrokerConfig::default()
        });
        let client = client(&broker).await;
        let sender = client.create_sender(&queue("orders")).await.unwrap();

        let mut batch = sender.create_message_batch().await.unwrap();
        batch.try_add_message(&envelope(1)).unwrap();
        sender.send_batch(&batch, &SendOptions::default()).await.unwrap();

        assert_eq!(batch.max_size_in_bytes(), 512);
        assert_eq!(broker.transmissions()[0].envelopes.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_handles_reject_calls_and_record_events() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let sender = client.create_sender(&queue("orders")).await.unwrap();
        let receiver = client.create_receiver(&queue("orders")).await.unwrap();

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
        client.close().await.unwrap();

        assert!(sender
            .send_message(&envelope(1), &SendOptions::default())
            .await
            .is_err());
        assert!(receiver
            .receive_messages(1, &ReceiveOptions::default())
            .await
            .is_err());
        assert!(client.create_receiver(&queue("orders")).await.is_err());
        assert_eq!(
            broker.handle_events(),
            vec![
                HandleEvent::SenderClosed {
                    entity: "orders".to_string()
                },
                HandleEvent::ReceiverClosed {
                    entity: "orders".to_string(),
                    session_id: None
                },
                HandleEvent::ClientClosed,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_records_credentials() {
        let broker = InMemoryBroker::new();

        client(&broker).await;

        assert_eq!(broker.connections(), vec![credential()]);
    }
}
