//! Property-based invariant tests for the synchronized collection and the
//! history loader.
//!
//! These tests verify invariants that must hold for any interleaving of
//! merges:
//!
//! 1. No two items share an id after any sequence of live merges, history
//!    pages, tentative inserts, confirmations and rollbacks.
//! 2. A pending item is never an alias of a confirmed server id.
//! 3. Confirming a tentative item without a competing echo keeps the length.
//! 4. Rolling back a tentative item restores the prior length.
//! 5. Paging a history in order yields non-decreasing timestamps and ends
//!    with `has_more == false`.

use std::{collections::HashSet, sync::Arc};

use chrono::DateTime;
use proptest::prelude::*;
use serde_json::{Value, json};
use tether_core::{
    CollectionItem, CollectionOrder, CollectionScope, Entity, EntityPayload, HistoryPage,
    IgnoreReason, LoadOutcome, ManualClock, PaginatedHistoryLoader, SyncContext, SyncedCollection,
    Table, TentativeEntity,
};
use tether_platform::{InMemorySessionProvider, RecordingNotificationSink};

// ── Helpers ─────────────────────────────────────────────────────────────

const OWN_USER: &str = "u1";

fn server_entity(n: u8) -> Entity {
    Entity {
        id: format!("srv{n}"),
        author_id: if n % 2 == 0 { OWN_USER } else { "u2" }.to_owned(),
        created_at_ms: u64::from(n) * 10,
        payload: EntityPayload::Message {
            conversation_id: "c1".to_owned(),
            text: format!("m{}", n % 3),
        },
    }
}

fn tentative(slot: u8) -> TentativeEntity {
    TentativeEntity::new(
        format!("temp-{slot}"),
        OWN_USER,
        1_000 + u64::from(slot),
        EntityPayload::Message {
            conversation_id: "c1".to_owned(),
            text: format!("m{}", slot % 3),
        },
    )
}

#[derive(Debug, Clone)]
enum Op {
    Live { server: u8 },
    Page { servers: Vec<u8> },
    Tentative { slot: u8 },
    Confirm { slot: u8, server: u8 },
    Rollback { slot: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12).prop_map(|server| Op::Live { server }),
        prop::collection::vec(0u8..12, 0..5).prop_map(|servers| Op::Page { servers }),
        (0u8..4).prop_map(|slot| Op::Tentative { slot }),
        (0u8..4, 0u8..12).prop_map(|(slot, server)| Op::Confirm { slot, server }),
        (0u8..4).prop_map(|slot| Op::Rollback { slot }),
    ]
}

fn apply(collection: &mut SyncedCollection, op: &Op) {
    match op {
        Op::Live { server } => {
            collection.merge_live(server_entity(*server), Some(OWN_USER));
        }
        Op::Page { servers } => {
            let mut page: Vec<Entity> = servers.iter().copied().map(server_entity).collect();
            page.sort_by_key(|entity| entity.created_at_ms);
            collection.merge_history(page);
        }
        Op::Tentative { slot } => {
            let _ = collection.insert_tentative(tentative(*slot));
        }
        Op::Confirm { slot, server } => {
            let _ = collection.confirm_tentative(&format!("temp-{slot}"), server_entity(*server));
        }
        Op::Rollback { slot } => {
            let _ = collection.remove_tentative(&format!("temp-{slot}"));
        }
    }
}

fn assert_unique(collection: &SyncedCollection) -> Result<(), TestCaseError> {
    let mut seen = HashSet::new();
    for item in collection.items() {
        prop_assert!(seen.insert(item.id().to_owned()), "duplicate id {}", item.id());
    }
    Ok(())
}

fn context() -> SyncContext {
    SyncContext::with_clock(
        Arc::new(InMemorySessionProvider::signed_in(OWN_USER)),
        Arc::new(RecordingNotificationSink::default()),
        Arc::new(ManualClock::new(0)),
    )
}

fn history_row(index: usize, created_at_secs: i64) -> Value {
    let created_at = DateTime::from_timestamp(created_at_secs, 0)
        .expect("valid timestamp")
        .to_rfc3339();
    json!({
        "id": format!("h{index}"),
        "conversation_id": "c1",
        "sender_id": "u2",
        "text": format!("history {index}"),
        "created_at": created_at,
    })
}

// ═════════════════════════════════════════════════════════════════════════
// 1-2. Dedup and alias invariants under arbitrary interleavings
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn ids_stay_unique_under_any_interleaving(ops in prop::collection::vec(op_strategy(), 0..60)) {
        for order in [CollectionOrder::Chronological, CollectionOrder::NewestFirst] {
            let mut collection = SyncedCollection::new(order);
            for op in &ops {
                apply(&mut collection, op);
                assert_unique(&collection)?;
                for item in collection.items().iter().filter(|item| item.pending) {
                    prop_assert_eq!(
                        collection.resolve(item.id()),
                        item.id(),
                        "pending item {} already settled",
                        item.id()
                    );
                }
            }
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3-4. Settlement keeps length; rollback restores it
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn confirm_keeps_position_and_length(
        history in prop::collection::vec(0u8..12, 0..8),
        slot in 0u8..4,
    ) {
        let mut collection = SyncedCollection::new(CollectionOrder::Chronological);
        let mut page: Vec<Entity> = history.iter().copied().map(server_entity).collect();
        page.sort_by_key(|entity| entity.created_at_ms);
        collection.merge_history(page);

        let position = collection.insert_tentative(tentative(slot)).expect("fresh temp id");
        let before = collection.len();
        let confirmed = Entity {
            id: "srv-confirmed".to_owned(),
            author_id: OWN_USER.to_owned(),
            created_at_ms: 5_000,
            payload: tentative(slot).payload,
        };
        collection
            .confirm_tentative(&format!("temp-{slot}"), confirmed.clone())
            .expect("confirm");

        prop_assert_eq!(collection.len(), before);
        let item: &CollectionItem = &collection.items()[position];
        prop_assert_eq!(item.id(), "srv-confirmed");
        prop_assert!(!item.pending);
        prop_assert_eq!(&item.entity.payload, &confirmed.payload);
    }

    #[test]
    fn rollback_restores_length(ops in prop::collection::vec(op_strategy(), 0..20)) {
        let mut collection = SyncedCollection::new(CollectionOrder::Chronological);
        for op in &ops {
            if !matches!(op, Op::Tentative { .. } | Op::Confirm { .. } | Op::Rollback { .. }) {
                apply(&mut collection, op);
            }
        }
        let before = collection.len();
        collection
            .insert_tentative(TentativeEntity::new("temp-x", OWN_USER, 1, tentative(0).payload))
            .expect("fresh temp id");
        collection.remove_tentative("temp-x").expect("rollback");

        prop_assert_eq!(collection.len(), before);
        prop_assert!(!collection.contains("temp-x"));
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Pagination monotonicity and termination
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn paging_in_order_is_monotonic_and_terminates(
        total in 0usize..80,
        page_size in 1u16..12,
        live_every in 1usize..5,
    ) {
        // Row i was created at i / 2 seconds, so timestamps repeat.
        let rows: Vec<Value> = (0..total).map(|i| history_row(i, (i / 2) as i64)).collect();
        let mut collection = SyncedCollection::new(CollectionOrder::Chronological);
        let mut loader = PaginatedHistoryLoader::new(
            context(),
            CollectionScope::eq(Table::Messages, "conversation_id", "c1"),
            page_size,
            100,
        );

        let mut fetches = 0usize;
        let mut request = loader.begin_initial().expect("first load");
        loop {
            let size = usize::from(request.page_size);
            let start = request.page_index as usize * size;
            let page_rows: Vec<Value> = rows
                .iter()
                .rev()
                .skip(start)
                .take(size)
                .cloned()
                .collect();
            fetches += 1;
            let outcome = loader
                .finish(&mut collection, request.page_index, Ok(HistoryPage { rows: page_rows, has_more: None }))
                .expect("page merges");
            prop_assert!(
                matches!(outcome, LoadOutcome::Loaded { .. }),
                "unexpected outcome {:?}",
                outcome
            );

            if fetches % live_every == 0 {
                collection.merge_live(
                    Entity {
                        id: format!("live{fetches}"),
                        author_id: "u2".to_owned(),
                        created_at_ms: 10_000_000 + fetches as u64,
                        payload: EntityPayload::Message {
                            conversation_id: "c1".to_owned(),
                            text: "live".to_owned(),
                        },
                    },
                    Some(OWN_USER),
                );
            }

            let timestamps: Vec<u64> = collection
                .items()
                .iter()
                .map(|item| item.entity.created_at_ms)
                .collect();
            prop_assert!(
                timestamps.windows(2).all(|pair| pair[0] <= pair[1]),
                "timestamps out of order: {:?}",
                timestamps
            );
            assert_unique(&collection)?;

            match loader.begin_more() {
                Ok(next) => request = next,
                Err(reason) => {
                    prop_assert_eq!(reason, IgnoreReason::Exhausted);
                    break;
                }
            }
        }

        let size = usize::from(page_size);
        prop_assert_eq!(fetches, total / size + 1);
        prop_assert!(!loader.has_more());
        let history_items = collection
            .items()
            .iter()
            .filter(|item| item.id().starts_with('h'))
            .count();
        prop_assert_eq!(history_items, total);
    }
}
