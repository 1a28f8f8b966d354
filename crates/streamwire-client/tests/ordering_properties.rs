//! Property-based tests for the ordering engine.
//!
//! These verify the delivery invariants for ALL arrival interleavings,
//! not just specific examples: whatever order and duplication a chain's
//! messages arrive in, the delivered sequence is strictly increasing by
//! ref and free of duplicates.

#![allow(clippy::unwrap_used)]

use std::time::Instant;

use proptest::prelude::*;
use streamwire_client::orderer::{ChainAction, OrderedChains};
use streamwire_proto::{Address, MessageId, MessageRef, StreamMessage};

fn chain_message(ts: i64, prev: Option<i64>) -> StreamMessage {
    let id = MessageId {
        stream_id: "s".to_string(),
        partition: 0,
        timestamp_ms: ts,
        sequence_number: 0,
        publisher_id: Address::new([1; 20]),
        msg_chain_id: "chain".to_string(),
    };
    StreamMessage::new(id, prev.map(|p| MessageRef::new(p, 0)), format!("m{ts}"))
}

/// A fully linked chain of `len` messages with ascending timestamps.
fn linked_chain(len: i64) -> Vec<StreamMessage> {
    (1..=len)
        .map(|ts| chain_message(ts, if ts == 1 { None } else { Some(ts - 1) }))
        .collect()
}

fn delivered_refs(actions: &[ChainAction]) -> Vec<MessageRef> {
    actions
        .iter()
        .filter_map(|a| match a {
            ChainAction::Deliver(m) => Some(m.message_ref()),
            _ => None,
        })
        .collect()
}

/// Strategy: an arrival order over a chain, with repeats.
fn arrival_order(len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..len, 1..len * 3)
}

proptest! {
    /// Delivered refs are strictly increasing with no duplicates for any
    /// interleaving of in-order, out-of-order, and repeated messages.
    #[test]
    fn delivery_is_strictly_increasing(
        len in 2_i64..10,
        order in arrival_order(9),
    ) {
        let chain = linked_chain(len);
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();

        let mut seen = Vec::new();
        for index in order {
            let Some(msg) = chain.get(index) else { continue };
            seen.extend(delivered_refs(&engine.add(msg.clone(), now)));
        }

        for window in seen.windows(2) {
            prop_assert!(window[0] < window[1]);
        }
    }

    /// An in-order feed delivers every message exactly once, in order.
    #[test]
    fn in_order_feed_is_complete(len in 1_i64..50) {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();

        let mut seen = Vec::new();
        for msg in linked_chain(len) {
            seen.extend(delivered_refs(&engine.add(msg, now)));
        }

        let expected: Vec<_> = (1..=len).map(|ts| MessageRef::new(ts, 0)).collect();
        prop_assert_eq!(seen, expected);
        prop_assert!(!engine.has_open_gaps());
    }

    /// Duplicated in-order feeds change nothing: same complete delivery.
    #[test]
    fn duplicates_are_idempotent(len in 1_i64..20) {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();

        let mut seen = Vec::new();
        for msg in linked_chain(len) {
            seen.extend(delivered_refs(&engine.add(msg.clone(), now)));
            // Immediate replay of the same message.
            seen.extend(delivered_refs(&engine.add(msg, now)));
        }
        prop_assert_eq!(seen.len() as i64, len);
    }

    /// A single missing message splits delivery into a prefix before the
    /// gap; supplying it releases everything that was withheld.
    #[test]
    fn gap_fill_releases_withheld_suffix(len in 3_i64..20, missing in 2_i64..19) {
        prop_assume!(missing < len);
        let chain = linked_chain(len);
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();

        let mut seen = Vec::new();
        for msg in &chain {
            if msg.id.timestamp_ms == missing {
                continue;
            }
            seen.extend(delivered_refs(&engine.add(msg.clone(), now)));
        }
        prop_assert_eq!(seen.len() as i64, missing - 1);

        let withheld = chain[(missing - 1) as usize].clone();
        let released = delivered_refs(&engine.add(withheld, now));
        prop_assert_eq!(released.len() as i64, len - missing + 1);
        prop_assert!(!engine.has_open_gaps());
    }
}
