//! Queue of messages awaiting group keys.
//!
//! Encrypted messages whose key has not arrived yet are parked here before
//! the ordering engine sees them. Each (publisher, chain) pair holds an
//! independent FIFO; draining is front-blocking per chain, so a message
//! whose key is still missing blocks everything queued behind it on the
//! same chain — releasing a later message first would let it skip the
//! ordering engine's gap detection.

use std::collections::{HashMap, VecDeque};

use streamwire_proto::{Address, StreamMessage};
use tracing::trace;

/// Per-subscription holding area for messages that cannot be decrypted yet.
#[derive(Default)]
pub struct DecryptQueue {
    /// publisher → chain id → queued messages in arrival order.
    chains: HashMap<Address, HashMap<String, VecDeque<StreamMessage>>>,
    len: usize,
}

impl DecryptQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a message until its group key arrives.
    pub fn enqueue(&mut self, msg: StreamMessage) {
        trace!(
            publisher = %msg.id.publisher_id,
            chain = %msg.id.msg_chain_id,
            key_id = msg.group_key_id.as_deref().unwrap_or(""),
            "queueing message awaiting group key"
        );
        self.chains
            .entry(msg.id.publisher_id)
            .or_default()
            .entry(msg.id.msg_chain_id.clone())
            .or_default()
            .push_back(msg);
        self.len += 1;
    }

    /// Release the longest decryptable prefix of each of a publisher's
    /// chains, given the key ids now available.
    ///
    /// Front-blocking: a chain stops releasing at its first message whose
    /// key is still missing. Released messages keep arrival order within
    /// their chain.
    pub fn drain_unlocked(
        &mut self,
        publisher: Address,
        available_key_ids: &[String],
    ) -> Vec<StreamMessage> {
        let mut released = Vec::new();
        if let Some(chains) = self.chains.get_mut(&publisher) {
            for queue in chains.values_mut() {
                while let Some(front) = queue.front() {
                    let unlocked = front
                        .group_key_id
                        .as_ref()
                        .is_some_and(|id| available_key_ids.contains(id));
                    if !unlocked {
                        break;
                    }
                    if let Some(msg) = queue.pop_front() {
                        self.len -= 1;
                        released.push(msg);
                    }
                }
            }
            chains.retain(|_, queue| !queue.is_empty());
        }
        self.cleanup(publisher);
        released
    }

    /// Drop a publisher's queued messages that name any of the given key
    /// ids. Used when the publisher refuses to serve those keys; later
    /// messages on the chain become drainable.
    pub fn discard_keys(&mut self, publisher: Address, key_ids: &[String]) -> Vec<StreamMessage> {
        let mut dropped = Vec::new();
        if let Some(chains) = self.chains.get_mut(&publisher) {
            for queue in chains.values_mut() {
                let before = queue.len();
                let (kept, removed): (VecDeque<_>, VecDeque<_>) =
                    std::mem::take(queue).into_iter().partition(|m| {
                        !m.group_key_id.as_ref().is_some_and(|id| key_ids.contains(id))
                    });
                *queue = kept;
                self.len -= before - queue.len();
                dropped.extend(removed);
            }
            chains.retain(|_, queue| !queue.is_empty());
        }
        self.cleanup(publisher);
        dropped
    }

    /// Drop everything, returning how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.chains.clear();
        self.len = 0;
        dropped
    }

    /// Whether any message is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total queued messages across all publishers and chains.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Publishers that currently have queued messages.
    pub fn publishers(&self) -> Vec<Address> {
        self.chains.keys().copied().collect()
    }

    fn cleanup(&mut self, publisher: Address) {
        if self.chains.get(&publisher).is_some_and(HashMap::is_empty) {
            self.chains.remove(&publisher);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use streamwire_proto::{EncryptionType, MessageId, StreamMessage};

    use super::*;

    fn msg(seq: i64, key_id: &str) -> StreamMessage {
        let id = MessageId {
            stream_id: "s".to_string(),
            partition: 0,
            timestamp_ms: 1000,
            sequence_number: seq,
            publisher_id: Address::new([1; 20]),
            msg_chain_id: "chain".to_string(),
        };
        let mut m = StreamMessage::new(id, None, "cipher".to_string());
        m.encryption_type = EncryptionType::Aes;
        m.group_key_id = Some(key_id.to_string());
        m
    }

    fn ids(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| (*k).to_string()).collect()
    }

    #[test]
    fn drain_is_front_blocking() {
        let mut queue = DecryptQueue::new();
        queue.enqueue(msg(0, "a"));
        queue.enqueue(msg(1, "b"));
        queue.enqueue(msg(2, "a"));

        // Only m1 unlocks: m3 is stuck behind m2 even though its key is here.
        let first = queue.drain_unlocked(Address::new([1; 20]), &ids(&["a"]));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id.sequence_number, 0);

        let rest = queue.drain_unlocked(Address::new([1; 20]), &ids(&["a", "b"]));
        assert_eq!(
            rest.iter().map(|m| m.id.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn chains_drain_independently() {
        let mut queue = DecryptQueue::new();
        let mut other = msg(0, "b");
        other.id.msg_chain_id = "other".to_string();
        queue.enqueue(msg(0, "a"));
        queue.enqueue(other);

        let released = queue.drain_unlocked(Address::new([1; 20]), &ids(&["b"]));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id.msg_chain_id, "other");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn discard_unblocks_later_messages() {
        let mut queue = DecryptQueue::new();
        queue.enqueue(msg(0, "gone"));
        queue.enqueue(msg(1, "a"));

        let dropped = queue.discard_keys(Address::new([1; 20]), &ids(&["gone"]));
        assert_eq!(dropped.len(), 1);

        let released = queue.drain_unlocked(Address::new([1; 20]), &ids(&["a"]));
        assert_eq!(released.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn unknown_publisher_drains_nothing() {
        let mut queue = DecryptQueue::new();
        queue.enqueue(msg(0, "a"));
        assert!(queue.drain_unlocked(Address::new([9; 20]), &ids(&["a"])).is_empty());
        assert_eq!(queue.len(), 1);
    }
}
