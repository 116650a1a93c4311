//! Integration tests for [`RedpandaMessageBus`] against a real Kafka broker.
//!
//! Covered:
//! - Keyed publish and per-aggregate order on the consumer side
//! - Redelivery after a transient nack
//! - Dead-lettering after a permanent nack
//! - Unsettled offsets are not committed across subscriptions
//!
//! # Running These Tests
//!
//! Ignored by default: they need Docker and take 15-60 seconds each to
//! start Kafka.
//!
//! ```bash
//! cargo test -p bidstream-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use bidstream_core::envelope::{AggregateId, EventEnvelope, SequenceNumber};
use bidstream_core::event_bus::{
    Delivery, DeliveryStream, MessageBus, NackReason, SubscriptionConfig,
};
use bidstream_core::fault::{DeadLetter, DeadLetterSink, FaultError};
use bidstream_core::retry::RetryPolicy;
use bidstream_redpanda::RedpandaMessageBus;
use bidstream_testing::fixtures;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<DeadLetter>>>);

impl RecordingSink {
    fn letters(&self) -> Vec<DeadLetter> {
        self.0.lock().unwrap().clone()
    }
}

impl DeadLetterSink for RecordingSink {
    fn dead_letter(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>> {
        self.0.lock().unwrap().push(letter);
        Box::pin(async { Ok(()) })
    }
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Publish a warmup envelope until the broker accepts it.
async fn wait_for_kafka_ready(brokers: &str) {
    let warmup = fixtures::created(AggregateId::new(), 1);
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = RedpandaMessageBus::builder()
            .brokers(brokers)
            .timeout(Duration::from_secs(2))
            .build()
        {
            if bus.publish("warmup-topic", &warmup).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn bus(brokers: &str) -> RedpandaMessageBus {
    RedpandaMessageBus::builder()
        .brokers(brokers)
        .drain_timeout(Duration::from_secs(2))
        .build()
        .expect("Failed to create bus")
}

fn config(group: &str, sink: &RecordingSink) -> SubscriptionConfig {
    SubscriptionConfig::new(group, Arc::new(sink.clone())).with_redelivery(
        RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(200))
            .build(),
    )
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match stream.next().await {
                Some(Ok(delivery)) => return delivery,
                // Broker hiccups while the group forms surface as stream errors.
                Some(Err(_)) => {}
                None => panic!("delivery stream ended"),
            }
        }
    })
    .await
    .expect("Timeout waiting for delivery")
}

async fn publish_all(bus: &RedpandaMessageBus, topic: &str, envelopes: &[EventEnvelope]) {
    for envelope in envelopes {
        bus.publish(topic, envelope).await.expect("Failed to publish");
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn envelopes_of_one_aggregate_arrive_in_order() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers);
    let sink = RecordingSink::default();
    let id = AggregateId::new();
    let envelopes = vec![
        fixtures::created(id, 1),
        fixtures::mileage(id, 2, 10_000),
        fixtures::mileage(id, 3, 20_000),
    ];
    publish_all(&bus, "ordered-events", &envelopes).await;

    let mut stream = bus
        .subscribe("ordered-events", config("search", &sink))
        .await
        .expect("Failed to subscribe");

    let mut sequences = Vec::new();
    for _ in 0..envelopes.len() {
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.envelope().aggregate_id, id);
        assert_eq!(delivery.attempt(), 1);
        sequences.push(delivery.envelope().sequence);
        delivery.ack();
    }

    assert_eq!(
        sequences,
        vec![SequenceNumber::new(1), SequenceNumber::new(2), SequenceNumber::new(3)]
    );
    assert!(sink.letters().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn transient_nack_is_redelivered_with_next_attempt() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers);
    let sink = RecordingSink::default();
    let envelope = fixtures::created(AggregateId::new(), 1);
    publish_all(&bus, "retry-events", std::slice::from_ref(&envelope)).await;

    let mut stream = bus
        .subscribe("retry-events", config("search", &sink))
        .await
        .expect("Failed to subscribe");

    let first = next_delivery(&mut stream).await;
    first.nack(NackReason::Transient("search db down".to_string()));

    let second = next_delivery(&mut stream).await;
    assert_eq!(second.envelope(), &envelope);
    assert_eq!(second.attempt(), 2);
    second.ack();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn permanent_nack_goes_to_the_dead_letter_sink() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers);
    let sink = RecordingSink::default();
    let envelope = fixtures::created(AggregateId::new(), 1);
    publish_all(&bus, "poison-events", std::slice::from_ref(&envelope)).await;

    let mut stream = bus
        .subscribe("poison-events", config("search", &sink))
        .await
        .expect("Failed to subscribe");

    next_delivery(&mut stream)
        .await
        .nack(NackReason::Permanent("bad payload".to_string()));

    let arrived = bidstream_testing::wait_until(Duration::from_secs(10), || {
        !sink.letters().is_empty()
    })
    .await;
    assert!(arrived, "dead letter never reached the sink");

    let letter = &sink.letters()[0];
    assert_eq!(letter.envelope_id, envelope.envelope_id);
    assert_eq!(letter.original_topic, "poison-events");
    assert_eq!(letter.consumer_group.as_deref(), Some("search"));
    assert_eq!(letter.last_error, "bad payload");
    assert_eq!(EventEnvelope::from_bytes(&letter.raw_envelope).unwrap(), envelope);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unsettled_deliveries_come_back_to_the_next_member() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers);
    let sink = RecordingSink::default();
    let id = AggregateId::new();
    let envelopes = vec![fixtures::created(id, 1), fixtures::mileage(id, 2, 5)];
    publish_all(&bus, "handover-events", &envelopes).await;

    let mut stream = bus
        .subscribe("handover-events", config("search", &sink))
        .await
        .expect("Failed to subscribe");
    next_delivery(&mut stream).await.ack();
    let unsettled = next_delivery(&mut stream).await;
    assert_eq!(unsettled.envelope().sequence, SequenceNumber::new(2));

    // Member goes away with the second delivery still in hand.
    drop(stream);
    drop(unsettled);
    tokio::time::sleep(Duration::from_secs(8)).await;

    let mut stream = bus
        .subscribe("handover-events", config("search", &sink))
        .await
        .expect("Failed to resubscribe");
    let redelivered = next_delivery(&mut stream).await;

    assert_eq!(redelivered.envelope(), &envelopes[1]);
    redelivered.ack();
}
