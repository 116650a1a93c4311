//! End-to-end propagation: outbox, relay, bus, consumer, read model and the
//! fault path, all in memory.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use bidstream_core::auction::{AuctionDeleted, AuctionStatus, AuctionUpdated};
use bidstream_core::envelope::{AggregateId, EventKind, SequenceNumber};
use bidstream_core::event_bus::MessageBus;
use bidstream_core::fault::FaultStatus;
use bidstream_core::AUCTION_EVENTS_TOPIC;
use bidstream_runtime::retry::RetryPolicy;
use bidstream_runtime::{
    ConsumerConfig, FaultHandler, OutboxPublisher, OutboxRelay, ProjectionConsumer, RelayConfig,
    SearchProjector,
};
use bidstream_testing::helpers::init_tracing;
use bidstream_testing::{
    fixtures, test_clock, wait_until, FixedClock, InMemoryFaultStore, InMemoryMessageBus,
    InMemoryOutbox, InMemorySearchItemStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const GROUP: &str = "search-service";
const WAIT: Duration = Duration::from_secs(3);

struct System {
    outbox: Arc<InMemoryOutbox>,
    bus: Arc<InMemoryMessageBus>,
    search: Arc<InMemorySearchItemStore>,
    faults: Arc<InMemoryFaultStore>,
    handler: Arc<FaultHandler>,
    clock: FixedClock,
    publisher: OutboxPublisher,
    relay: OutboxRelay,
}

impl System {
    fn new() -> Self {
        init_tracing();
        let clock = test_clock();
        let outbox = Arc::new(InMemoryOutbox::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let faults = Arc::new(InMemoryFaultStore::new());
        let handler = Arc::new(
            FaultHandler::new(faults.clone(), bus.clone(), Arc::new(clock.clone()))
                .with_publish_policy(fast_policy(3)),
        );
        let (relay, _) = OutboxRelay::new(
            outbox.clone(),
            bus.clone(),
            handler.clone(),
            Arc::new(clock.clone()),
            RelayConfig::default(),
        );

        Self {
            outbox,
            bus,
            search: Arc::new(InMemorySearchItemStore::new()),
            faults,
            handler,
            publisher: OutboxPublisher::new(Arc::new(clock.clone())),
            clock,
            relay,
        }
    }

    fn start_consumer(&self, max_attempts: u32) -> (JoinHandle<()>, watch::Sender<bool>) {
        let projector = SearchProjector::new(self.search.clone(), Arc::new(self.clock.clone()));
        let config = ConsumerConfig::default()
            .workers(4)
            .apply_timeout(Duration::from_secs(1))
            .redelivery(fast_policy(max_attempts));
        let (consumer, shutdown) =
            ProjectionConsumer::new(projector, self.bus.clone(), self.handler.clone(), config);

        let task = tokio::spawn(async move {
            consumer.run().await.unwrap();
        });
        (task, shutdown)
    }

    async fn commit<E>(&self, id: AggregateId, event: &E)
    where
        E: bidstream_core::auction::AuctionEvent + Sync,
    {
        let mut uow = self.outbox.begin();
        self.publisher.record(&mut uow, id, event).await.unwrap();
        uow.commit().unwrap();
    }

    async fn wait_for_sequence(&self, id: AggregateId, sequence: u64) -> bool {
        let search = self.search.clone();
        wait_until(WAIT, move || {
            search
                .item(id)
                .is_some_and(|item| item.last_applied == SequenceNumber::new(sequence))
        })
        .await
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(2))
        .max_delay(Duration::from_millis(10))
        .build()
}

async fn stop(task: JoinHandle<()>, shutdown: &watch::Sender<bool>) {
    shutdown.send(true).unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn committed_changes_reach_the_read_model() {
    let system = System::new();
    let id = AggregateId::new();
    let (task, shutdown) = system.start_consumer(5);

    system.commit(id, &fixtures::auction()).await;
    system
        .commit(
            id,
            &AuctionUpdated {
                make: Some("Ford".into()),
                status: Some(AuctionStatus::Live),
                ..AuctionUpdated::default()
            },
        )
        .await;
    assert_eq!(system.relay.drain_once().await.unwrap().published, 2);

    assert!(system.wait_for_sequence(id, 2).await);
    let item = system.search.item(id).unwrap();
    assert_eq!(item.make, "Ford");
    assert_eq!(item.status, AuctionStatus::Live);

    stop(task, &shutdown).await;
    let stats = system.bus.stats(GROUP);
    assert_eq!(stats.acked.len(), 2);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn deletion_propagates_and_duplicates_are_absorbed() {
    let system = System::new();
    let id = AggregateId::new();
    let (task, shutdown) = system.start_consumer(5);

    system.commit(id, &fixtures::auction()).await;
    system.commit(id, &AuctionDeleted {}).await;
    system.relay.drain_once().await.unwrap();

    // The relay crashed before marking: everything goes out again.
    for envelope in system.bus.published(AUCTION_EVENTS_TOPIC) {
        system.bus.publish(AUCTION_EVENTS_TOPIC, &envelope).await.unwrap();
    }

    let bus = system.bus.clone();
    assert!(wait_until(WAIT, || bus.stats(GROUP).acked.len() == 4).await);
    assert!(system.search.item(id).is_none());
    assert_eq!(system.search.tombstone(id), Some(SequenceNumber::new(2)));
    assert!(system.faults.entries().is_empty());

    stop(task, &shutdown).await;
}

#[tokio::test]
async fn reordered_delivery_converges() {
    let system = System::new();
    let id = AggregateId::new();

    for envelope in [
        fixtures::mileage(id, 3, 30_000),
        fixtures::mileage(id, 2, 20_000),
        fixtures::created(id, 1),
        fixtures::mileage(id, 4, 40_000),
    ] {
        system.bus.publish(AUCTION_EVENTS_TOPIC, &envelope).await.unwrap();
    }
    let (task, shutdown) = system.start_consumer(5);

    assert!(system.wait_for_sequence(id, 4).await);
    assert_eq!(system.search.item(id).unwrap().mileage, 40_000);
    assert!(system.search.stashed_sequences(id).is_empty());

    stop(task, &shutdown).await;
}

#[tokio::test]
async fn poison_message_does_not_block_other_aggregates() {
    let system = System::new();
    let poisoned = AggregateId::new();
    let healthy = AggregateId::new();
    let poison = fixtures::envelope(
        poisoned,
        EventKind::Created,
        1,
        serde_json::json!({ "make": ["not", "a", "string"] }),
    );

    system.bus.publish(AUCTION_EVENTS_TOPIC, &poison).await.unwrap();
    system.bus.publish(AUCTION_EVENTS_TOPIC, &fixtures::created(healthy, 1)).await.unwrap();
    system
        .bus
        .publish(AUCTION_EVENTS_TOPIC, &fixtures::mileage(healthy, 2, 7))
        .await
        .unwrap();
    let (task, shutdown) = system.start_consumer(5);

    assert!(system.wait_for_sequence(healthy, 2).await);
    let faults = system.faults.clone();
    assert!(wait_until(WAIT, || faults.entries().len() == 1).await);

    let fault = &system.faults.entries()[0];
    assert_eq!(fault.envelope_id, poison.envelope_id);
    assert_eq!(fault.consumer_group.as_deref(), Some(GROUP));
    assert_eq!(fault.attempts, 1);
    assert!(system.search.item(poisoned).is_none());

    stop(task, &shutdown).await;
}

#[tokio::test]
async fn transient_store_failure_is_retried_by_redelivery() {
    let system = System::new();
    let id = AggregateId::new();
    system.search.fail_next_writes(2);

    system.bus.publish(AUCTION_EVENTS_TOPIC, &fixtures::created(id, 1)).await.unwrap();
    let (task, shutdown) = system.start_consumer(5);

    assert!(system.wait_for_sequence(id, 1).await);
    assert_eq!(system.bus.stats(GROUP).transient_nacks, 2);
    assert!(system.faults.entries().is_empty());

    stop(task, &shutdown).await;
}

#[tokio::test]
async fn exhausted_message_can_be_replayed_once_the_store_recovers() {
    let system = System::new();
    let id = AggregateId::new();
    let created = fixtures::created(id, 1);
    system.search.fail_next_writes(3);

    system.bus.publish(AUCTION_EVENTS_TOPIC, &created).await.unwrap();
    let (task, shutdown) = system.start_consumer(3);

    let faults = system.faults.clone();
    assert!(wait_until(WAIT, || faults.pending().len() == 1).await);
    assert!(system.search.item(id).is_none());
    assert_eq!(system.faults.entries()[0].attempts, 3);

    let replayed = system.handler.replay(created.envelope_id).await.unwrap();
    assert_eq!(replayed.envelope_id, created.envelope_id);

    assert!(system.wait_for_sequence(id, 1).await);
    let entry = system.handler.get(created.envelope_id).await.unwrap().unwrap();
    assert_eq!(entry.status, FaultStatus::Replayed);
    assert_eq!(system.handler.count_pending().await.unwrap(), 0);

    stop(task, &shutdown).await;
}

#[tokio::test]
async fn shutdown_stops_intake_and_settles_everything_delivered() {
    let system = System::new();
    let id = AggregateId::new();
    let (task, shutdown) = system.start_consumer(5);

    system.bus.publish(AUCTION_EVENTS_TOPIC, &fixtures::created(id, 1)).await.unwrap();
    assert!(system.wait_for_sequence(id, 1).await);

    stop(task, &shutdown).await;
    system
        .bus
        .publish(AUCTION_EVENTS_TOPIC, &fixtures::mileage(id, 2, 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = system.bus.stats(GROUP);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.acked.len(), 1);
    assert_eq!(system.search.item(id).unwrap().last_applied, SequenceNumber::FIRST);

    // A restarted consumer picks up where the group left off.
    let (task, shutdown) = system.start_consumer(5);
    assert!(system.wait_for_sequence(id, 2).await);
    stop(task, &shutdown).await;
}
