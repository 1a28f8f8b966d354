//! Per-chain message ordering and gap recovery.
//!
//! One publisher may run several independent ordered chains in a stream
//! partition; each (publisher, chain id) pair gets its own state. The
//! engine delivers strictly increasing `MessageRef`s per chain, withholds
//! messages past a gap while a resend is in flight, and retries resend
//! requests with linear backoff against deadlines checked on tick.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use streamwire_proto::{Address, MessageRef, StreamMessage};
use tracing::debug;

/// Resend attempts before a gap is declared unfillable.
pub const MAX_GAP_REQUESTS: u32 = 10;

/// Base wait between resend attempts; attempt `n` waits `n` times this.
pub const GAP_FILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one ordered chain within a stream partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainKey {
    /// Publisher owning the chain.
    pub publisher: Address,
    /// The publisher's chain token.
    pub msg_chain_id: String,
}

impl ChainKey {
    fn of(msg: &StreamMessage) -> Self {
        Self { publisher: msg.id.publisher_id, msg_chain_id: msg.id.msg_chain_id.clone() }
    }
}

/// Output of the ordering engine, executed by the subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainAction {
    /// The message is next in its chain; pass it downstream.
    Deliver(StreamMessage),
    /// Ask the transport to refill a detected gap.
    RequestResend {
        /// Publisher owning the gapped chain.
        publisher: Address,
        /// Chain the gap occurred on.
        msg_chain_id: String,
        /// Last delivered ref (exclusive bound).
        from: MessageRef,
        /// Predecessor named by the withheld message (inclusive bound).
        to: MessageRef,
    },
    /// Resend retries were exhausted; the gap is being skipped.
    GapFailed {
        /// Publisher owning the gapped chain.
        publisher: Address,
        /// Chain the gap occurred on.
        msg_chain_id: String,
        /// Exclusive bound of the abandoned gap.
        from: MessageRef,
        /// Inclusive bound of the abandoned gap.
        to: MessageRef,
    },
}

struct Gap<I> {
    from: MessageRef,
    to: MessageRef,
    attempts: u32,
    next_retry_at: I,
}

struct ChainState<I> {
    last_delivered: Option<MessageRef>,
    /// Messages withheld past a gap, keyed by their own ref.
    pending: BTreeMap<MessageRef, StreamMessage>,
    gap: Option<Gap<I>>,
}

impl<I> Default for ChainState<I> {
    fn default() -> Self {
        Self { last_delivered: None, pending: BTreeMap::new(), gap: None }
    }
}

/// Ordering engine over all chains of one (stream, partition) subscription.
pub struct OrderedChains<I> {
    chains: HashMap<ChainKey, ChainState<I>>,
    max_gap_requests: u32,
    gap_fill_timeout: Duration,
}

impl<I: Copy + Ord + std::ops::Add<Duration, Output = I>> OrderedChains<I> {
    /// Engine with default retry limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MAX_GAP_REQUESTS, GAP_FILL_TIMEOUT)
    }

    /// Engine with explicit retry limits, for tests and tuning.
    #[must_use]
    pub fn with_config(max_gap_requests: u32, gap_fill_timeout: Duration) -> Self {
        Self { chains: HashMap::new(), max_gap_requests, gap_fill_timeout }
    }

    /// Feed one message in; get deliveries and gap-recovery requests out.
    pub fn add(&mut self, msg: StreamMessage, now: I) -> Vec<ChainAction> {
        let key = ChainKey::of(&msg);
        let state = self.chains.entry(key.clone()).or_default();
        let msg_ref = msg.message_ref();

        // Duplicates and stale refs never re-deliver, not even when a
        // history reset (previous_ref = None) claims them.
        if state.last_delivered.is_some_and(|last| msg_ref <= last) {
            debug!(publisher = %key.publisher, chain = key.msg_chain_id,
                   "dropping duplicate or stale message");
            return Vec::new();
        }
        if state.pending.contains_key(&msg_ref) {
            return Vec::new();
        }

        let chainable = match (msg.previous_ref, state.last_delivered) {
            // First message seen, or an explicit producer history reset.
            (None, _) | (Some(_), None) => true,
            (Some(prev), Some(last)) => prev <= last,
        };

        let mut actions = Vec::new();
        if chainable {
            state.last_delivered = Some(msg_ref);
            state.gap = None;
            actions.push(ChainAction::Deliver(msg));
            Self::drain_pending(state, &mut actions);
        } else {
            state.pending.insert(msg_ref, msg);
        }

        // (Re)detect the gap against whatever is still withheld.
        actions.extend(Self::schedule_gap(
            &key,
            state,
            now,
            self.gap_fill_timeout,
        ));
        actions
    }

    /// Check retry deadlines; emit retries and gap failures that are due.
    pub fn tick(&mut self, now: I) -> Vec<ChainAction> {
        let mut actions = Vec::new();
        for (key, state) in &mut self.chains {
            let Some(gap) = state.gap.as_mut() else { continue };
            if now < gap.next_retry_at {
                continue;
            }
            if gap.attempts >= self.max_gap_requests {
                debug!(publisher = %key.publisher, chain = key.msg_chain_id,
                       attempts = gap.attempts, "gap fill retries exhausted, skipping ahead");
                actions.push(ChainAction::GapFailed {
                    publisher: key.publisher,
                    msg_chain_id: key.msg_chain_id.clone(),
                    from: gap.from,
                    to: gap.to,
                });
                state.gap = None;
                // Skip ahead: everything withheld goes out in ref order so
                // the chain resumes instead of deadlocking.
                Self::force_drain(state, &mut actions);
                continue;
            }
            gap.attempts += 1;
            gap.next_retry_at = now + self.gap_fill_timeout * gap.attempts;
            actions.push(ChainAction::RequestResend {
                publisher: key.publisher,
                msg_chain_id: key.msg_chain_id.clone(),
                from: gap.from,
                to: gap.to,
            });
        }
        actions
    }

    /// Last delivered ref per chain, for handing over to a fresh engine.
    pub fn snapshot(&self) -> Vec<(ChainKey, MessageRef)> {
        self.chains
            .iter()
            .filter_map(|(key, state)| state.last_delivered.map(|last| (key.clone(), last)))
            .collect()
    }

    /// Engine preloaded with another engine's chain positions, so gap
    /// detection continues across a historical-to-live handover.
    #[must_use]
    pub fn from_snapshot(
        snapshot: Vec<(ChainKey, MessageRef)>,
        max_gap_requests: u32,
        gap_fill_timeout: Duration,
    ) -> Self {
        let mut engine = Self::with_config(max_gap_requests, gap_fill_timeout);
        for (key, last) in snapshot {
            engine
                .chains
                .insert(key, ChainState { last_delivered: Some(last), ..ChainState::default() });
        }
        engine
    }

    /// Configured retry limit, carried across snapshots.
    pub fn max_gap_requests(&self) -> u32 {
        self.max_gap_requests
    }

    /// Configured retry base timeout, carried across snapshots.
    pub fn gap_fill_timeout(&self) -> Duration {
        self.gap_fill_timeout
    }

    /// Drop all chain state, cancelling outstanding retry deadlines.
    pub fn clear(&mut self) {
        self.chains.clear();
    }

    /// Whether any chain is waiting on a gap fill.
    pub fn has_open_gaps(&self) -> bool {
        self.chains.values().any(|state| state.gap.is_some())
    }

    // Deliver withheld messages that became chainable after an advance.
    fn drain_pending(state: &mut ChainState<I>, actions: &mut Vec<ChainAction>) {
        loop {
            // Anything at or below the delivery point is a stale duplicate.
            while let Some(entry) = state.pending.first_entry() {
                if state.last_delivered.is_some_and(|last| *entry.key() <= last) {
                    entry.remove();
                } else {
                    break;
                }
            }
            let Some(entry) = state.pending.first_entry() else { break };
            let chainable = match entry.get().previous_ref {
                None => true,
                Some(prev) => state.last_delivered.is_some_and(|last| prev <= last),
            };
            if !chainable {
                break;
            }
            let (msg_ref, msg) = entry.remove_entry();
            state.last_delivered = Some(msg_ref);
            actions.push(ChainAction::Deliver(msg));
        }
    }

    // Deliver everything withheld regardless of chaining, after a gap is
    // abandoned.
    fn force_drain(state: &mut ChainState<I>, actions: &mut Vec<ChainAction>) {
        while let Some((msg_ref, msg)) = state.pending.pop_first() {
            state.last_delivered = Some(msg_ref);
            actions.push(ChainAction::Deliver(msg));
        }
    }

    // If messages are still withheld, open (or reopen) a gap from the
    // delivery point to the first withheld message's named predecessor,
    // and issue the first resend request immediately.
    fn schedule_gap(
        key: &ChainKey,
        state: &mut ChainState<I>,
        now: I,
        timeout: Duration,
    ) -> Vec<ChainAction> {
        if state.gap.is_some() {
            return Vec::new();
        }
        let (Some(last), Some((_, first))) = (state.last_delivered, state.pending.first_key_value())
        else {
            return Vec::new();
        };
        // A withheld first message always names a predecessor; a None
        // previous_ref would have been delivered as a reset.
        let Some(to) = first.previous_ref else {
            return Vec::new();
        };
        state.gap = Some(Gap { from: last, to, attempts: 1, next_retry_at: now + timeout });
        vec![ChainAction::RequestResend {
            publisher: key.publisher,
            msg_chain_id: key.msg_chain_id.clone(),
            from: last,
            to,
        }]
    }
}

impl<I: Copy + Ord + std::ops::Add<Duration, Output = I>> Default for OrderedChains<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use streamwire_proto::MessageId;

    use super::*;

    fn msg(ts: i64, prev: Option<i64>) -> StreamMessage {
        chain_msg("chain", ts, prev)
    }

    fn chain_msg(chain: &str, ts: i64, prev: Option<i64>) -> StreamMessage {
        let id = MessageId {
            stream_id: "s".to_string(),
            partition: 0,
            timestamp_ms: ts,
            sequence_number: 0,
            publisher_id: Address::new([1; 20]),
            msg_chain_id: chain.to_string(),
        };
        StreamMessage::new(id, prev.map(|p| MessageRef::new(p, 0)), format!("m{ts}"))
    }

    fn delivered(actions: &[ChainAction]) -> Vec<i64> {
        actions
            .iter()
            .filter_map(|a| match a {
                ChainAction::Deliver(m) => Some(m.id.timestamp_ms),
                _ => None,
            })
            .collect()
    }

    fn resends(actions: &[ChainAction]) -> Vec<(i64, i64)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ChainAction::RequestResend { from, to, .. } => {
                    Some((from.timestamp_ms, to.timestamp_ms))
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn in_order_messages_deliver_immediately() {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();
        assert_eq!(delivered(&engine.add(msg(1, None), now)), vec![1]);
        assert_eq!(delivered(&engine.add(msg(2, Some(1)), now)), vec![2]);
        assert_eq!(delivered(&engine.add(msg(3, Some(2)), now)), vec![3]);
    }

    #[test]
    fn gap_withholds_and_requests_resend() {
        // Refs [1,2,4,5] with 3 missing: deliver 1 and 2, withhold 4 and 5,
        // issue exactly one request for (2,4]; ref 3 releases 3, 4, 5.
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();

        engine.add(msg(1, None), now);
        engine.add(msg(2, Some(1)), now);
        let a4 = engine.add(msg(4, Some(3)), now);
        assert!(delivered(&a4).is_empty());
        assert_eq!(resends(&a4), vec![(2, 3)]);
        let a5 = engine.add(msg(5, Some(4)), now);
        assert!(delivered(&a5).is_empty());
        assert!(resends(&a5).is_empty());

        let a3 = engine.add(msg(3, Some(2)), now);
        assert_eq!(delivered(&a3), vec![3, 4, 5]);
        assert!(!engine.has_open_gaps());
    }

    #[test]
    fn duplicates_never_redeliver() {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();
        engine.add(msg(1, None), now);
        engine.add(msg(2, Some(1)), now);
        assert!(engine.add(msg(2, Some(1)), now).is_empty());
        assert!(engine.add(msg(1, None), now).is_empty());
    }

    #[test]
    fn history_reset_delivers_without_gap_check() {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();
        engine.add(msg(1, None), now);
        // The producer restarted and dropped its chain history.
        let actions = engine.add(msg(10, None), now);
        assert_eq!(delivered(&actions), vec![10]);
        assert!(resends(&actions).is_empty());
    }

    #[test]
    fn retries_back_off_linearly_then_fail_once() {
        let mut engine: OrderedChains<Instant> =
            OrderedChains::with_config(2, Duration::from_secs(5));
        let t0 = Instant::now();

        engine.add(msg(1, None), t0);
        let first = engine.add(msg(3, Some(2)), t0);
        assert_eq!(resends(&first).len(), 1);

        // First deadline at t0+5s; the retry reschedules at +10s more.
        assert!(engine.tick(t0 + Duration::from_secs(4)).is_empty());
        let retry = engine.tick(t0 + Duration::from_secs(5));
        assert_eq!(resends(&retry).len(), 1);

        let exhausted = engine.tick(t0 + Duration::from_secs(15));
        assert_eq!(
            exhausted
                .iter()
                .filter(|a| matches!(a, ChainAction::GapFailed { .. }))
                .count(),
            1
        );
        // The withheld message goes out so the chain resumes.
        assert_eq!(delivered(&exhausted), vec![3]);

        // Processing continues normally afterwards.
        let next = engine.add(msg(4, Some(3)), t0 + Duration::from_secs(16));
        assert_eq!(delivered(&next), vec![4]);
        assert!(engine.tick(t0 + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn chains_are_independent() {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();
        engine.add(chain_msg("a", 1, None), now);
        let gapped = engine.add(chain_msg("a", 3, Some(2)), now);
        assert!(delivered(&gapped).is_empty());

        // Chain b is unaffected by a's open gap.
        let other = engine.add(chain_msg("b", 1, None), now);
        assert_eq!(delivered(&other), vec![1]);
    }

    #[test]
    fn partial_fill_reopens_narrowed_gap() {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();
        engine.add(msg(1, None), now);
        engine.add(msg(5, Some(4)), now);

        // 2 arrives but 3..4 is still missing: new request for (2,4].
        let actions = engine.add(msg(2, Some(1)), now);
        assert_eq!(delivered(&actions), vec![2]);
        assert_eq!(resends(&actions), vec![(2, 4)]);
    }

    #[test]
    fn snapshot_preloads_chain_positions() {
        let mut engine: OrderedChains<Instant> = OrderedChains::new();
        let now = Instant::now();
        engine.add(msg(1, None), now);
        engine.add(msg(2, Some(1)), now);

        let mut live = OrderedChains::from_snapshot(
            engine.snapshot(),
            engine.max_gap_requests(),
            engine.gap_fill_timeout(),
        );
        // A live message chaining off the historical position delivers.
        assert_eq!(delivered(&live.add(msg(3, Some(2)), now)), vec![3]);
        // A stale historical ref is recognized as a duplicate.
        assert!(live.add(msg(2, Some(1)), now).is_empty());
    }
}
