//! One consumer-group subscription: the task that owns the Kafka consumer.
//!
//! The task reads messages, hands them out as [`Delivery`] values and reacts
//! to their settlement:
//!
//! - **ack**: the offset is settled and the commit watermark may advance
//! - **transient nack**: redelivered after the policy's backoff, until the
//!   attempt budget is spent
//! - **permanent nack / exhausted / undecodable**: handed to the dead-letter
//!   sink, retried until the sink accepts it, then settled
//!
//! Offsets are committed only up to the lowest unsettled one, so a crash
//! replays every message that was not acknowledged or dead-lettered.

use crate::offsets::OffsetTracker;
use bidstream_core::envelope::EventEnvelope;
use bidstream_core::event_bus::{
    Acknowledger, BusError, Delivery, DeliveryStream, NackReason, Settlement, SubscriptionConfig,
};
use bidstream_core::fault::DeadLetter;
use chrono::Utc;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Upper bound between dead-letter sink retries.
const MAX_SINK_BACKOFF: Duration = Duration::from_secs(5);

/// A message as read from its partition.
#[derive(Debug, Clone)]
struct Record {
    partition: i32,
    offset: i64,
    raw: Vec<u8>,
    attempt: u32,
}

impl Record {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            partition: message.partition(),
            offset: message.offset(),
            raw: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attempt: 1,
        }
    }
}

enum Control {
    Settled(Record, Settlement),
    Redeliver(Record),
    DeadLettered(Record),
}

struct RedpandaAcker {
    record: Record,
    control: mpsc::UnboundedSender<Control>,
}

impl Acknowledger for RedpandaAcker {
    fn settle(self: Box<Self>, settlement: Settlement) {
        let Self { record, control } = *self;
        // The task outlives every delivery it hands out unless it was torn
        // down, in which case the offset stays uncommitted.
        let _ = control.send(Control::Settled(record, settlement));
    }
}

/// Settings for one subscription task.
pub(crate) struct Subscription {
    pub(crate) topic: String,
    pub(crate) config: SubscriptionConfig,
    pub(crate) buffer_size: usize,
    pub(crate) drain_timeout: Duration,
}

/// Start the subscription task and return its delivery stream.
pub(crate) fn spawn(consumer: StreamConsumer, subscription: Subscription) -> DeliveryStream {
    let (tx, mut rx) = mpsc::channel(subscription.buffer_size);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let task = Task {
        topic: subscription.topic,
        config: subscription.config,
        drain_timeout: subscription.drain_timeout,
        tx,
        control: control_tx,
        offsets: OffsetTracker::new(),
        abandoned: 0,
        closing_at: None,
    };
    tokio::spawn(task.run(consumer, control_rx));

    let stream = async_stream::stream! {
        while let Some(result) = rx.recv().await {
            yield result;
        }
    };
    Box::pin(stream)
}

struct Task {
    topic: String,
    config: SubscriptionConfig,
    drain_timeout: Duration,
    tx: mpsc::Sender<Result<Delivery, BusError>>,
    control: mpsc::UnboundedSender<Control>,
    offsets: OffsetTracker,
    /// Unsettled offsets given up on during shutdown.
    abandoned: usize,
    closing_at: Option<Instant>,
}

impl Task {
    async fn run(mut self, consumer: StreamConsumer, mut control_rx: mpsc::UnboundedReceiver<Control>) {
        let deliveries = self.tx.clone();

        loop {
            if self.closing_at.is_some() && self.offsets.in_flight() <= self.abandoned {
                break;
            }
            let deadline = self
                .closing_at
                .map_or_else(Instant::now, |at| at + self.drain_timeout);
            let open = self.closing_at.is_none();

            tokio::select! {
                Some(control) = control_rx.recv() => self.on_control(&consumer, control).await,
                message = consumer.recv(), if open => match message {
                    Ok(message) => {
                        let record = Record::from_message(&message);
                        self.offsets.track(record.partition, record.offset);
                        self.dispatch(record).await;
                    }
                    Err(e) => {
                        tracing::warn!(topic = %self.topic, error = %e, "Failed to receive message");
                        let _ = self.tx.send(Err(BusError::transient(&self.topic, e.to_string()))).await;
                    }
                },
                () = deliveries.closed(), if open => {
                    tracing::info!(
                        topic = %self.topic,
                        consumer_group = %self.config.consumer_group,
                        in_flight = self.offsets.in_flight(),
                        "Subscriber gone, draining in-flight deliveries"
                    );
                    self.closing_at = Some(Instant::now());
                }
                () = tokio::time::sleep_until(deadline), if !open => {
                    tracing::warn!(
                        topic = %self.topic,
                        consumer_group = %self.config.consumer_group,
                        unsettled = self.offsets.in_flight(),
                        "Drain timed out; unsettled messages will be redelivered"
                    );
                    break;
                }
            }
        }

        tracing::debug!(topic = %self.topic, "Subscription task exiting");
    }

    async fn on_control(&mut self, consumer: &StreamConsumer, control: Control) {
        match control {
            Control::Settled(record, Settlement::Ack) => self.settle(consumer, &record),
            Control::Settled(record, Settlement::Nack(NackReason::Transient(reason)))
                if !self.config.redelivery.is_exhausted(record.attempt) =>
            {
                self.schedule_redelivery(record, &reason);
            }
            Control::Settled(record, Settlement::Nack(NackReason::Transient(reason))) => {
                self.dead_letter(record, format!("attempts exhausted: {reason}"));
            }
            Control::Settled(record, Settlement::Nack(NackReason::Permanent(reason))) => {
                self.dead_letter(record, reason);
            }
            Control::Redeliver(record) => {
                if self.closing_at.is_some() {
                    self.abandoned += 1;
                } else {
                    self.dispatch(record).await;
                }
            }
            Control::DeadLettered(record) => self.settle(consumer, &record),
        }
    }

    /// Hand a record to the subscriber, or dead-letter it if it does not decode.
    async fn dispatch(&mut self, record: Record) {
        let envelope = match EventEnvelope::from_bytes(&record.raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dead_letter(record, format!("undecodable message: {e}"));
                return;
            }
        };

        let delivery = Delivery::new(
            envelope,
            self.topic.clone(),
            self.config.consumer_group.clone(),
            record.attempt,
            Box::new(RedpandaAcker {
                record,
                control: self.control.clone(),
            }),
        );

        // A closed channel drops the delivery, which settles it as a
        // transient nack; the drain logic picks it up from there.
        let _ = self.tx.send(Ok(delivery)).await;
    }

    fn schedule_redelivery(&mut self, record: Record, reason: &str) {
        if self.closing_at.is_some() {
            self.abandoned += 1;
            return;
        }

        let delay = self
            .config
            .redelivery
            .delay_for_attempt(record.attempt.saturating_sub(1));
        tracing::debug!(
            topic = %self.topic,
            partition = record.partition,
            offset = record.offset,
            attempt = record.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason = %reason,
            "Scheduling redelivery"
        );
        metrics::counter!("bus_redeliveries_total", "topic" => self.topic.clone()).increment(1);

        let control = self.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let next = Record {
                attempt: record.attempt + 1,
                ..record
            };
            let _ = control.send(Control::Redeliver(next));
        });
    }

    /// Persist through the sink, retrying until it accepts, then settle.
    fn dead_letter(&self, record: Record, error: String) {
        tracing::warn!(
            topic = %self.topic,
            consumer_group = %self.config.consumer_group,
            partition = record.partition,
            offset = record.offset,
            attempt = record.attempt,
            error = %error,
            "Dead-lettering message"
        );
        metrics::counter!("bus_dead_letters_total", "topic" => self.topic.clone()).increment(1);

        let origin = format!("{}/{}/{}", self.topic, record.partition, record.offset);
        let letter = DeadLetter::from_raw(
            record.raw.clone(),
            &origin,
            self.topic.clone(),
            Some(self.config.consumer_group.clone()),
            record.attempt,
            error,
            Utc::now(),
        );
        let sink = std::sync::Arc::clone(&self.config.dead_letters);
        let policy = self.config.redelivery.clone();
        let control = self.control.clone();

        tokio::spawn(async move {
            let mut retry = 0;
            while let Err(e) = sink.dead_letter(letter.clone()).await {
                let delay = policy.delay_for_attempt(retry).min(MAX_SINK_BACKOFF);
                tracing::error!(
                    envelope_id = %letter.envelope_id,
                    error = %e,
                    retry,
                    "Dead-letter sink failed, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            let _ = control.send(Control::DeadLettered(record));
        });
    }

    fn settle(&mut self, consumer: &StreamConsumer, record: &Record) {
        let Some(next) = self.offsets.complete(record.partition, record.offset) else {
            return;
        };

        let mut offsets = TopicPartitionList::new();
        let commit = offsets
            .add_partition_offset(&self.topic, record.partition, Offset::Offset(next))
            .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

        if let Err(e) = commit {
            tracing::warn!(
                topic = %self.topic,
                partition = record.partition,
                offset = next,
                error = %e,
                "Failed to commit offset (messages may be redelivered)"
            );
        }
    }
}
