//! Apply-algorithm tests for the search projector.
//!
//! Drives [`SearchProjector`] directly against the in-memory store; bus and
//! consumer concerns are covered in `propagation_tests.rs`.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use bidstream_core::auction::{AuctionStatus, AuctionUpdated};
use bidstream_core::environment::Clock;
use bidstream_core::envelope::{AggregateId, EventEnvelope, EventKind, SequenceNumber};
use bidstream_core::fault::FaultStatus;
use bidstream_core::projection::{ApplyError, ApplyOutcome, ReadState, SearchItem, SearchItemStore};
use bidstream_core::AUCTION_EVENTS_TOPIC;
use bidstream_runtime::{FaultHandler, SearchProjector, StashExpiry};
use bidstream_testing::{
    fixtures, properties, test_clock, FixedClock, InMemoryFaultStore, InMemoryMessageBus,
    InMemorySearchItemStore,
};
use chrono::Duration;
use proptest::prelude::*;
use std::sync::Arc;

fn projector() -> (SearchProjector<InMemorySearchItemStore>, Arc<InMemorySearchItemStore>, FixedClock) {
    let store = Arc::new(InMemorySearchItemStore::new());
    let clock = test_clock();
    let projector = SearchProjector::new(Arc::clone(&store), Arc::new(clock.clone()));
    (projector, store, clock)
}

fn fault_handler(clock: &FixedClock) -> FaultHandler {
    FaultHandler::new(
        Arc::new(InMemoryFaultStore::new()),
        Arc::new(InMemoryMessageBus::new()),
        Arc::new(clock.clone()),
    )
}

const GROUP: &str = "search-service";

fn seq(n: u64) -> SequenceNumber {
    SequenceNumber::new(n)
}

fn live_patch() -> AuctionUpdated {
    AuctionUpdated {
        make: Some("Ford".into()),
        status: Some(AuctionStatus::Live),
        ..AuctionUpdated::default()
    }
}

#[tokio::test]
async fn created_then_updated_in_order() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    let outcome = projector
        .apply(&fixtures::updated(id, 2, &live_patch()))
        .await
        .unwrap();

    assert!(matches!(outcome, ApplyOutcome::Applied { sequence, .. } if sequence == seq(2)));
    let item = store.item(id).unwrap();
    assert_eq!(item.make, "Ford");
    assert_eq!(item.status, AuctionStatus::Live);
    assert_eq!(item.last_applied, seq(2));
}

#[tokio::test]
async fn update_before_create_converges_to_in_order_state() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();
    let update = fixtures::mileage(id, 2, 61_000);

    let first = projector.apply(&update).await.unwrap();
    assert_eq!(first, ApplyOutcome::Buffered { awaiting: seq(1) });
    assert!(store.item(id).is_none());

    let second = projector.apply(&fixtures::created(id, 1)).await.unwrap();
    assert!(matches!(second, ApplyOutcome::Applied { replayed: 1, .. }));

    let (in_order, in_order_store, _) = self::projector();
    in_order.apply(&fixtures::created(id, 1)).await.unwrap();
    in_order.apply(&update).await.unwrap();

    assert_eq!(store.item(id), in_order_store.item(id));
    assert!(store.stashed_sequences(id).is_empty());
}

#[tokio::test]
async fn deleting_twice_is_a_successful_no_op() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();
    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&fixtures::mileage(id, 2, 10)).await.unwrap();

    let delete = fixtures::deleted(id, 3);
    let first = projector.apply(&delete).await.unwrap();
    let second = projector.apply(&delete).await.unwrap();

    assert!(matches!(first, ApplyOutcome::Applied { .. }));
    assert!(matches!(second, ApplyOutcome::Skipped { last_applied, .. } if last_applied == seq(3)));
    assert!(store.item(id).is_none());
    assert_eq!(store.tombstone(id), Some(seq(3)));
}

#[tokio::test]
async fn duplicate_create_is_skipped() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();
    let created = fixtures::created(id, 1);

    projector.apply(&created).await.unwrap();
    let writes = store.write_count();
    let outcome = projector.apply(&created).await.unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome::Skipped {
            last_applied: seq(1),
            conflict: None,
        }
    );
    assert_eq!(store.items().len(), 1);
    assert_eq!(store.write_count(), writes);
}

#[tokio::test]
async fn late_envelopes_cannot_resurrect_a_deleted_auction() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::deleted(id, 3)).await.unwrap();
    let stale_create = projector.apply(&fixtures::created(id, 1)).await.unwrap();
    let stale_update = projector.apply(&fixtures::mileage(id, 2, 5)).await.unwrap();

    assert!(matches!(
        stale_create,
        ApplyOutcome::Skipped { conflict: Some(ref c), .. } if c.existing == seq(3) && c.kind == EventKind::Created
    ));
    assert!(matches!(stale_update, ApplyOutcome::Skipped { conflict: None, .. }));
    assert!(store.item(id).is_none());
}

#[tokio::test]
async fn fresh_create_after_delete_recreates_the_item() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&fixtures::mileage(id, 2, 10)).await.unwrap();
    projector.apply(&fixtures::deleted(id, 3)).await.unwrap();
    let outcome = projector.apply(&fixtures::created(id, 4)).await.unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            sequence: seq(4),
            replayed: 0,
            conflict: None,
        }
    );
    let item = store.item(id).unwrap();
    assert_eq!(item.last_applied, seq(4));
    assert_eq!(item.mileage, fixtures::auction().mileage);
    assert_eq!(store.tombstone(id), None);
}

#[tokio::test]
async fn update_stashed_ahead_of_recreate_is_replayed() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&fixtures::deleted(id, 3)).await.unwrap();

    let early = projector.apply(&fixtures::mileage(id, 5, 55)).await.unwrap();
    assert_eq!(early, ApplyOutcome::Buffered { awaiting: seq(4) });
    assert!(store.item(id).is_none());

    let outcome = projector.apply(&fixtures::created(id, 4)).await.unwrap();

    assert!(matches!(outcome, ApplyOutcome::Applied { sequence, replayed: 1, .. } if sequence == seq(5)));
    let item = store.item(id).unwrap();
    assert_eq!(item.mileage, 55);
    assert_eq!(item.last_applied, seq(5));
    assert!(store.stashed_sequences(id).is_empty());
}

#[tokio::test]
async fn create_over_a_live_record_is_reported_as_conflict() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    let outcome = projector.apply(&fixtures::created(id, 2)).await.unwrap();

    assert!(matches!(
        outcome,
        ApplyOutcome::Applied { conflict: Some(ref c), .. } if c.incoming == seq(2) && c.existing == seq(1)
    ));
    assert_eq!(store.item(id).unwrap().last_applied, seq(2));
}

#[tokio::test]
async fn stash_replays_only_the_contiguous_run() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&fixtures::mileage(id, 3, 30)).await.unwrap();
    projector.apply(&fixtures::mileage(id, 5, 50)).await.unwrap();

    let outcome = projector.apply(&fixtures::mileage(id, 2, 20)).await.unwrap();

    assert!(matches!(outcome, ApplyOutcome::Applied { sequence, replayed: 1, .. } if sequence == seq(3)));
    assert_eq!(store.item(id).unwrap().mileage, 30);
    assert_eq!(store.stashed_sequences(id), vec![seq(5)]);
}

#[tokio::test]
async fn delete_drops_pending_stash() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();

    projector.apply(&fixtures::mileage(id, 2, 20)).await.unwrap();
    projector.apply(&fixtures::deleted(id, 3)).await.unwrap();

    assert!(store.stashed_sequences(id).is_empty());
    assert!(matches!(
        store.load(id).await.unwrap(),
        ReadState::Deleted { last_applied, .. } if last_applied == seq(3)
    ));
}

#[tokio::test]
async fn store_failure_is_transient_and_leaves_state_untouched() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();
    store.fail_next_writes(1);

    let err = projector.apply(&fixtures::created(id, 1)).await.unwrap_err();

    assert!(matches!(err, ApplyError::Transient(_)));
    assert!(store.item(id).is_none());

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    assert!(store.item(id).is_some());
}

#[tokio::test]
async fn read_failure_is_transient() {
    let (projector, store, _) = projector();
    store.fail_next_reads(1);

    let err = projector
        .apply(&fixtures::created(AggregateId::new(), 1))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::Transient(_)));
}

#[tokio::test]
async fn malformed_payload_is_permanent() {
    let (projector, store, _) = projector();
    let id = AggregateId::new();
    let envelope = fixtures::envelope(id, EventKind::Created, 1, serde_json::json!({ "make": 7 }));

    let err = projector.apply(&envelope).await.unwrap_err();

    assert!(matches!(err, ApplyError::Permanent(_)));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn unsupported_schema_is_permanent() {
    let (projector, _, _) = projector();
    let mut envelope = fixtures::created(AggregateId::new(), 1);
    envelope.schema_version += 1;

    let err = projector.apply(&envelope).await.unwrap_err();

    assert!(matches!(err, ApplyError::Permanent(_)));
}

#[tokio::test]
async fn sequence_beyond_storable_range_is_permanent() {
    let (projector, store, _) = projector();
    let mut envelope = fixtures::mileage(AggregateId::new(), 2, 10);
    envelope.sequence = SequenceNumber::MAX.next();

    let err = projector.apply(&envelope).await.unwrap_err();

    assert!(matches!(err, ApplyError::Permanent(ref m) if m.contains("storable")));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn tombstone_outlives_retention() {
    let (projector, store, clock) = projector();
    let handler = fault_handler(&clock);
    let id = AggregateId::new();
    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&fixtures::deleted(id, 2)).await.unwrap();

    clock.advance(Duration::days(8));
    projector
        .expire_stash(clock.now() - Duration::days(7), &handler, AUCTION_EVENTS_TOPIC, GROUP)
        .await
        .unwrap();
    let stale = projector.apply(&fixtures::created(id, 1)).await.unwrap();

    assert!(matches!(stale, ApplyOutcome::Skipped { last_applied, .. } if last_applied == seq(2)));
    assert!(store.item(id).is_none());
    assert_eq!(store.tombstone(id), Some(seq(2)));
}

#[tokio::test]
async fn gap_outliving_retention_is_dead_lettered_and_replay_converges() {
    let (projector, store, clock) = projector();
    let handler = fault_handler(&clock);
    let id = AggregateId::new();
    let stranded = fixtures::mileage(id, 3, 30);

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&stranded).await.unwrap();

    clock.advance(Duration::days(8));
    let report = projector
        .expire_stash(clock.now() - Duration::days(7), &handler, AUCTION_EVENTS_TOPIC, GROUP)
        .await
        .unwrap();

    assert_eq!(
        report,
        StashExpiry {
            dead_lettered: 1,
            superseded: 0,
        }
    );
    assert!(store.stashed_sequences(id).is_empty());
    let entry = handler.get(stranded.envelope_id).await.unwrap().unwrap();
    assert_eq!(entry.status, FaultStatus::Pending);
    assert_eq!(entry.consumer_group.as_deref(), Some(GROUP));
    assert!(entry.last_error.starts_with("unreconciled gap"));
    assert_eq!(entry.decode().unwrap(), stranded);

    projector.apply(&fixtures::mileage(id, 2, 20)).await.unwrap();
    let replayed = handler.replay(stranded.envelope_id).await.unwrap();
    projector.apply(&replayed).await.unwrap();

    let item = store.item(id).unwrap();
    assert_eq!(item.mileage, 30);
    assert_eq!(item.last_applied, seq(3));
}

#[tokio::test]
async fn stash_expiry_keeps_fresh_entries_and_drops_superseded_ones() {
    let (projector, store, clock) = projector();
    let handler = fault_handler(&clock);
    let id = AggregateId::new();
    let waiting = AggregateId::new();

    projector.apply(&fixtures::created(id, 1)).await.unwrap();
    projector.apply(&fixtures::mileage(id, 2, 20)).await.unwrap();
    store.stash(&fixtures::mileage(id, 2, 20), clock.now()).await.unwrap();

    clock.advance(Duration::days(8));
    projector.apply(&fixtures::mileage(waiting, 3, 30)).await.unwrap();

    let report = projector
        .expire_stash(clock.now() - Duration::days(7), &handler, AUCTION_EVENTS_TOPIC, GROUP)
        .await
        .unwrap();

    assert_eq!(
        report,
        StashExpiry {
            dead_lettered: 0,
            superseded: 1,
        }
    );
    assert!(store.stashed_sequences(id).is_empty());
    assert_eq!(store.stashed_sequences(waiting), vec![seq(3)]);
    assert_eq!(handler.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn stash_expiry_stops_on_store_failure_and_keeps_the_entry() {
    let (projector, store, clock) = projector();
    let handler = fault_handler(&clock);
    let id = AggregateId::new();
    let stranded = fixtures::mileage(id, 4, 40);
    projector.apply(&stranded).await.unwrap();

    clock.advance(Duration::days(8));
    store.fail_next_reads(1);
    let cutoff = clock.now() - Duration::days(7);

    assert!(projector
        .expire_stash(cutoff, &handler, AUCTION_EVENTS_TOPIC, GROUP)
        .await
        .is_err());
    assert_eq!(store.stashed_sequences(id), vec![seq(4)]);

    let report = projector
        .expire_stash(cutoff, &handler, AUCTION_EVENTS_TOPIC, GROUP)
        .await
        .unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(handler.get(stranded.envelope_id).await.unwrap().is_some());
}

fn apply_all(envelopes: &[EventEnvelope]) -> Option<SearchItem> {
    let (projector, store, _) = projector();
    tokio_test::block_on(async {
        for envelope in envelopes {
            projector.apply(envelope).await.unwrap();
        }
    });
    envelopes.first().and_then(|e| store.item(e.aggregate_id))
}

/// `Created(1)` then mileage updates. With `delete_at`, the auction is
/// deleted at that sequence and created again right after it.
fn history(id: AggregateId, len: u64, delete_at: Option<u64>) -> Vec<EventEnvelope> {
    (1..=len)
        .map(|n| {
            if n == 1 {
                fixtures::created(id, 1)
            } else if Some(n) == delete_at {
                fixtures::deleted(id, n)
            } else if Some(n - 1) == delete_at {
                fixtures::created(id, n)
            } else {
                fixtures::mileage(id, n, i32::try_from(n * 1_000).unwrap())
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn any_delivery_order_converges_to_in_order_state(
        order in properties::delivery_order(8),
        delete_at in prop::option::of(2u64..=8),
    ) {
        let id = AggregateId::new();
        let len = order.iter().copied().max().unwrap();
        let history = history(id, len, delete_at);

        let expected = apply_all(&history);
        let delivered: Vec<EventEnvelope> = order
            .iter()
            .map(|n| history[usize::try_from(*n - 1).unwrap()].clone())
            .collect();
        let actual = apply_all(&delivered);

        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn any_order_ending_in_delete_leaves_no_record(order in properties::delivery_order(6)) {
        let id = AggregateId::new();
        let len = order.iter().copied().max().unwrap();
        let mut history = history(id, len, None);
        history.push(fixtures::deleted(id, len + 1));

        let mut delivered: Vec<EventEnvelope> = order
            .iter()
            .map(|n| history[usize::try_from(*n - 1).unwrap()].clone())
            .collect();
        delivered.insert(delivered.len() / 2, history[history.len() - 1].clone());

        prop_assert_eq!(apply_all(&delivered), None);
    }
}
