//! In-memory message bus for fast, deterministic tests.
//!
//! Mirrors the semantics the production bus provides:
//! - every topic keeps its full log, so a consumer group subscribing late
//!   starts from the earliest message
//! - each message goes to exactly one subscriber per consumer group
//! - transient nacks are redelivered after the policy's backoff
//! - permanent nacks, exhausted messages and undecodable bytes go to the
//!   dead-letter sink, which is retried until it accepts them
//!
//! Fault injection: [`InMemoryMessageBus::fail_next_publishes`] and
//! [`InMemoryMessageBus::publish_raw`].

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use async_stream::stream;
use bidstream_core::envelope::{EnvelopeId, EventEnvelope};
use bidstream_core::event_bus::{
    Acknowledger, BusError, Delivery, DeliveryStream, MessageBus, NackReason, Settlement,
    SubscriptionConfig,
};
use bidstream_core::fault::{DeadLetter, DeadLetterSink};
use bidstream_core::retry::RetryPolicy;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A message queued for one consumer group.
#[derive(Debug, Clone)]
struct Queued {
    raw: Vec<u8>,
    offset: usize,
    attempt: u32,
}

/// Per consumer group counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Deliveries handed out, redeliveries included.
    pub delivered: u64,
    /// Envelope ids acknowledged, in settlement order.
    pub acked: Vec<EnvelopeId>,
    /// Transient nacks (explicit or dropped deliveries).
    pub transient_nacks: u64,
    /// Messages handed to the dead-letter sink.
    pub dead_lettered: u64,
    /// Deliveries handed out and not yet settled.
    pub in_flight: u64,
}

struct Group {
    tx: mpsc::UnboundedSender<Queued>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
}

#[derive(Default)]
struct BusState {
    logs: HashMap<String, Vec<Vec<u8>>>,
    groups: HashMap<(String, String), Group>,
    stats: HashMap<String, GroupStats>,
    publish_failures: VecDeque<BusError>,
}

/// In-memory [`MessageBus`].
///
/// # Example
///
/// ```
/// use bidstream_testing::InMemoryMessageBus;
///
/// let bus = InMemoryMessageBus::new();
/// assert!(bus.published("auction-events").is_empty());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with `error`.
    pub fn fail_next_publishes(&self, count: usize, error: &BusError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.publish_failures.push_back(error.clone());
        }
    }

    /// Append arbitrary bytes to a topic, bypassing envelope validation.
    pub fn publish_raw(&self, topic: &str, raw: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        append(&mut state, topic, raw);
    }

    /// Decodable envelopes in a topic's log, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<EventEnvelope> {
        let state = self.state.lock().unwrap();
        state
            .logs
            .get(topic)
            .map(|log| {
                log.iter()
                    .filter_map(|raw| EventEnvelope::from_bytes(raw).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Counters for a consumer group.
    #[must_use]
    pub fn stats(&self, consumer_group: &str) -> GroupStats {
        let state = self.state.lock().unwrap();
        state.stats.get(consumer_group).cloned().unwrap_or_default()
    }
}

fn append(state: &mut BusState, topic: &str, raw: Vec<u8>) {
    let log = state.logs.entry(topic.to_string()).or_default();
    let offset = log.len();
    log.push(raw.clone());
    for ((group_topic, _), group) in &state.groups {
        if group_topic == topic {
            let _ = group.tx.send(Queued {
                raw: raw.clone(),
                offset,
                attempt: 1,
            });
        }
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let encoded = envelope
            .check_schema()
            .and_then(|()| envelope.to_bytes())
            .map_err(|e| BusError::permanent(topic.clone(), e.to_string()));

        Box::pin(async move {
            let raw = encoded?;
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.publish_failures.pop_front() {
                return Err(error);
            }
            append(&mut state, &topic, raw);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>> {
        let topic = topic.to_string();

        Box::pin(async move {
            let (rx, tx) = {
                let mut state = self.state.lock().unwrap();
                let key = (topic.clone(), config.consumer_group.clone());
                if !state.groups.contains_key(&key) {
                    let (tx, rx) = mpsc::unbounded_channel();
                    for (offset, raw) in state.logs.get(&topic).into_iter().flatten().enumerate() {
                        let _ = tx.send(Queued {
                            raw: raw.clone(),
                            offset,
                            attempt: 1,
                        });
                    }
                    state.groups.insert(
                        key.clone(),
                        Group {
                            tx,
                            rx: Arc::new(tokio::sync::Mutex::new(rx)),
                        },
                    );
                }
                let group = &state.groups[&key];
                (Arc::clone(&group.rx), group.tx.clone())
            };

            let state = Arc::clone(&self.state);
            let deliveries = stream! {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(queued) = next else { break };

                    let acker = InMemoryAcker {
                        raw: queued.raw.clone(),
                        offset: queued.offset,
                        attempt: queued.attempt,
                        topic: topic.clone(),
                        group: config.consumer_group.clone(),
                        redelivery: config.redelivery.clone(),
                        sink: Arc::clone(&config.dead_letters),
                        requeue: tx.clone(),
                        state: Arc::clone(&state),
                    };

                    match EventEnvelope::from_bytes(&queued.raw) {
                        Ok(envelope) => {
                            {
                                let mut state = state.lock().unwrap();
                                let stats = state.stats.entry(config.consumer_group.clone()).or_default();
                                stats.delivered += 1;
                                stats.in_flight += 1;
                            }
                            yield Ok(Delivery::new(
                                envelope,
                                topic.clone(),
                                config.consumer_group.clone(),
                                queued.attempt,
                                Box::new(acker),
                            ));
                        }
                        Err(e) => acker.dead_letter(format!("undecodable message: {e}"), false),
                    }
                }
            };

            Ok(Box::pin(deliveries) as DeliveryStream)
        })
    }
}

struct InMemoryAcker {
    raw: Vec<u8>,
    offset: usize,
    attempt: u32,
    topic: String,
    group: String,
    redelivery: RetryPolicy,
    sink: Arc<dyn DeadLetterSink>,
    requeue: mpsc::UnboundedSender<Queued>,
    state: Arc<Mutex<BusState>>,
}

impl InMemoryAcker {
    fn stats<R>(&self, f: impl FnOnce(&mut GroupStats) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.stats.entry(self.group.clone()).or_default())
    }

    fn redeliver(self) {
        let delay = self.redelivery.delay_for_attempt(self.attempt.saturating_sub(1));
        let queued = Queued {
            raw: self.raw,
            offset: self.offset,
            attempt: self.attempt + 1,
        };
        let requeue = self.requeue;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(queued);
                });
            }
            Err(_) => {
                let _ = requeue.send(queued);
            }
        }
    }

    /// Hand the message to the sink, retrying until it is accepted.
    fn dead_letter(self, error: String, was_delivered: bool) {
        self.stats(|s| {
            s.dead_lettered += 1;
            if was_delivered {
                s.in_flight = s.in_flight.saturating_sub(1);
            }
        });

        let origin = format!("{}/0/{}", self.topic, self.offset);
        let letter = DeadLetter::from_raw(
            self.raw,
            &origin,
            self.topic,
            Some(self.group),
            self.attempt,
            error,
            Utc::now(),
        );
        let sink = self.sink;
        let policy = self.redelivery;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut retry = 0;
                    while let Err(e) = sink.dead_letter(letter.clone()).await {
                        tracing::warn!(error = %e, "Dead-letter sink failed, retrying");
                        let delay = policy.delay_for_attempt(retry).min(Duration::from_millis(50));
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                });
            }
            Err(_) => {
                if let Err(e) = futures::executor::block_on(sink.dead_letter(letter)) {
                    tracing::error!(error = %e, "Dead-letter sink failed outside a runtime");
                }
            }
        }
    }
}

impl Acknowledger for InMemoryAcker {
    fn settle(self: Box<Self>, settlement: Settlement) {
        match settlement {
            Settlement::Ack => {
                let id = EventEnvelope::from_bytes(&self.raw).map(|e| e.envelope_id).ok();
                self.stats(|s| {
                    s.in_flight = s.in_flight.saturating_sub(1);
                    s.acked.extend(id);
                });
            }
            Settlement::Nack(NackReason::Transient(reason))
                if !self.redelivery.is_exhausted(self.attempt) =>
            {
                tracing::debug!(attempt = self.attempt, reason = %reason, "Redelivering");
                self.stats(|s| {
                    s.transient_nacks += 1;
                    s.in_flight = s.in_flight.saturating_sub(1);
                });
                self.redeliver();
            }
            Settlement::Nack(NackReason::Transient(reason)) => {
                self.stats(|s| s.transient_nacks += 1);
                self.dead_letter(format!("attempts exhausted: {reason}"), true);
            }
            Settlement::Nack(NackReason::Permanent(reason)) => self.dead_letter(reason, true),
        }
    }
}
