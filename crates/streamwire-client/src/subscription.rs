//! Per-(stream, partition) subscription state machine.
//!
//! Composes the ordering engine, decryption queue, and group key store
//! into one pipeline. Every inbound message passes: signature
//! verification, embedded key-rotation install, decryption-queue
//! admission, the ordering engine, then decryption, and finally a
//! `Deliver` action. Control signals (resend requests, key requests)
//! flow back out as actions.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use streamwire_crypto::{ExchangeKeyPair, GroupKey, cipher, signing};
use streamwire_proto::{
    Address, EncryptionType, MessageRef, MessageType, ResendFilter, ResendRequest, StreamMessage,
};
use tracing::{debug, warn};

use crate::{
    decrypt_queue::DecryptQueue,
    env::Environment,
    error::StreamError,
    event::{DeliveryKind, SubscribeOptions, SubscriberAction},
    key_store::GroupKeyStore,
    orderer::{ChainAction, OrderedChains},
};

/// Lifecycle of a subscription. Linear; a re-subscribe creates a new
/// instance rather than cycling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe sent, awaiting transport acknowledgement.
    Subscribing,
    /// Live and receiving.
    Subscribed,
    /// Teardown in progress.
    Unsubscribing,
    /// Terminal.
    Unsubscribed,
}

/// Historical-resend phase of a Historical or Combined subscription.
struct ResendState {
    /// Live messages held back until the resend finishes.
    buffer: Vec<StreamMessage>,
    /// The transport is still serving the resend.
    active: bool,
    /// Resend served, but encrypted backlog still blocks "done".
    done_pending: bool,
    /// Hand chain positions to a fresh engine when done (Combined mode).
    combined: bool,
}

/// One (stream, partition) subscription and its pipeline state.
pub struct Subscription<I> {
    stream_id: String,
    partition: u32,
    state: SubscriptionState,
    orderer: OrderedChains<I>,
    queue: DecryptQueue,
    resend: Option<ResendState>,
    /// request id → publisher asked, for routing key errors.
    pending_key_requests: HashMap<String, Address>,
    /// Key ids already asked for, to avoid duplicate requests.
    requested_key_ids: HashSet<String>,
}

impl<I: Copy + Ord + std::ops::Add<Duration, Output = I>> Subscription<I> {
    /// Create a subscription in `Subscribing` state. Returns the historical
    /// resend request to issue, if the mode calls for one.
    pub fn new(
        stream_id: String,
        partition: u32,
        options: SubscribeOptions,
    ) -> (Self, Option<ResendRequest>) {
        let (resend, request) = match options.delivery {
            DeliveryKind::RealTime => (None, None),
            DeliveryKind::Historical(request) => (
                Some(ResendState {
                    buffer: Vec::new(),
                    active: true,
                    done_pending: false,
                    combined: false,
                }),
                Some(request),
            ),
            DeliveryKind::Combined(request) => (
                Some(ResendState {
                    buffer: Vec::new(),
                    active: true,
                    done_pending: false,
                    combined: true,
                }),
                Some(request),
            ),
        };
        let subscription = Self {
            stream_id,
            partition,
            state: SubscriptionState::Subscribing,
            orderer: OrderedChains::new(),
            queue: DecryptQueue::new(),
            resend,
            pending_key_requests: HashMap::new(),
            requested_key_ids: HashSet::new(),
        };
        (subscription, request)
    }

    /// Stream this subscription is bound to.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Partition this subscription is bound to.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Whether a historical resend is still unfinished.
    pub fn is_resending(&self) -> bool {
        self.resend.is_some()
    }

    /// Transport acknowledged the subscribe.
    pub fn ack(&mut self) {
        if self.state == SubscriptionState::Subscribing {
            self.state = SubscriptionState::Subscribed;
        }
    }

    /// Route one inbound message through the pipeline. `live` is false for
    /// messages arriving in answer to a resend request.
    pub fn handle_message<E: Environment<Instant = I>>(
        &mut self,
        msg: StreamMessage,
        live: bool,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        if matches!(
            self.state,
            SubscriptionState::Unsubscribing | SubscriptionState::Unsubscribed
        ) {
            return Vec::new();
        }
        // Live messages wait out an unfinished historical resend.
        if live && let Some(resend) = self.resend.as_mut() {
            resend.buffer.push(msg);
            return Vec::new();
        }
        self.process_inbound(msg, env, key_pair, store)
    }

    /// The transport finished serving the historical resend.
    pub fn resend_complete<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let Some(resend) = self.resend.as_mut() else {
            return Vec::new();
        };
        resend.active = false;
        if self.queue.is_empty() {
            self.finish_resend(env, key_pair, store)
        } else {
            // Encrypted backlog still awaits keys; "done" fires when it
            // drains.
            resend.done_pending = true;
            Vec::new()
        }
    }

    /// Keys for this stream landed in the store; release what they unlock.
    pub fn keys_available<E: Environment<Instant = I>>(
        &mut self,
        request_id: Option<&str>,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        if let Some(id) = request_id {
            self.pending_key_requests.remove(id);
        }
        let available = store.key_ids(&self.stream_id);
        self.requested_key_ids.retain(|id| !available.contains(id));

        let mut actions = Vec::new();
        for publisher in self.queue.publishers() {
            let drained = self.queue.drain_unlocked(publisher, &available);
            for msg in drained {
                actions.extend(self.run_chain(msg, env, store));
            }
        }
        actions.extend(self.maybe_finish_resend(env, key_pair, store));
        actions
    }

    /// A publisher refused to serve some keys; drop what they would have
    /// unlocked and let the rest of those chains proceed.
    pub fn keys_refused<E: Environment<Instant = I>>(
        &mut self,
        request_id: &str,
        group_key_ids: &[String],
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let Some(publisher) = self.pending_key_requests.remove(request_id) else {
            return Vec::new();
        };
        for id in group_key_ids {
            self.requested_key_ids.remove(id);
        }

        let mut actions = Vec::new();
        for msg in self.queue.discard_keys(publisher, group_key_ids) {
            actions.push(SubscriberAction::ReportError(StreamError::UnableToDecrypt {
                stream_id: self.stream_id.clone(),
                group_key_id: msg.group_key_id.unwrap_or_default(),
            }));
        }
        actions.extend(self.maybe_finish_resend(env, key_pair, store));
        actions
    }

    /// Drive resend-retry deadlines.
    pub fn tick<E: Environment<Instant = I>>(
        &mut self,
        now: I,
        env: &E,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        if self.state == SubscriptionState::Unsubscribed {
            return Vec::new();
        }
        let chain_actions = self.orderer.tick(now);
        self.apply_chain_actions(chain_actions, env, store)
    }

    /// Tear the subscription down. Idempotent; queued messages are
    /// discarded, never delivered, and retry deadlines are cancelled.
    pub fn unsubscribe(&mut self) -> Vec<SubscriberAction> {
        if self.state == SubscriptionState::Unsubscribed {
            return Vec::new();
        }
        self.state = SubscriptionState::Unsubscribing;
        let dropped = self.queue.clear();
        self.orderer.clear();
        self.resend = None;
        self.pending_key_requests.clear();
        self.requested_key_ids.clear();
        self.state = SubscriptionState::Unsubscribed;
        vec![SubscriberAction::Log {
            message: format!(
                "unsubscribed from {} partition {} ({dropped} queued messages discarded)",
                self.stream_id, self.partition
            ),
        }]
    }

    // Pipeline: state → signature → key rotation → admission → chain.
    fn process_inbound<E: Environment<Instant = I>>(
        &mut self,
        msg: StreamMessage,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        if msg.message_type != MessageType::Message {
            debug!(message_type = ?msg.message_type, "ignoring non-data message on data path");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.signature_ok(&msg) {
            warn!(stream_id = self.stream_id, publisher = %msg.id.publisher_id,
                  "dropping message with invalid signature");
            actions.push(SubscriberAction::ReportError(StreamError::InvalidSignature {
                stream_id: self.stream_id.clone(),
                publisher: msg.id.publisher_id,
            }));
            return actions;
        }

        // An embedded rotation may unlock queued messages, including the
        // carrying message itself.
        actions.extend(self.install_announced_key(&msg, env, key_pair, store));

        if msg.encryption_type == EncryptionType::Aes {
            let Some(key_id) = msg.group_key_id.clone() else {
                warn!(stream_id = self.stream_id, "dropping AES message without a key id");
                actions.push(SubscriberAction::Log {
                    message: format!(
                        "dropped malformed AES message without key id in {}",
                        self.stream_id
                    ),
                });
                return actions;
            };
            if store.get(&self.stream_id, &key_id).is_none() {
                let publisher = msg.id.publisher_id;
                self.queue.enqueue(msg);
                actions.extend(self.request_key(publisher, key_id, env, key_pair));
                return actions;
            }
        } else if msg.encryption_type == EncryptionType::Rsa {
            // RSA protects key-exchange payloads, not data messages.
            actions.push(SubscriberAction::ReportError(StreamError::UnableToDecrypt {
                stream_id: self.stream_id.clone(),
                group_key_id: msg.group_key_id.clone().unwrap_or_default(),
            }));
            return actions;
        }

        actions.extend(self.run_chain(msg, env, store));
        actions.extend(self.maybe_finish_resend(env, key_pair, store));
        actions
    }

    fn signature_ok(&self, msg: &StreamMessage) -> bool {
        let Some(signature) = &msg.signature else {
            // Unsigned messages are accepted; policy hooks live upstream.
            return true;
        };
        let payload = msg.signature_payload();
        signing::verify(&payload, signature, msg.id.publisher_id.as_bytes()).unwrap_or(false)
    }

    // Install a rotation announcement: the new key travels AES-wrapped
    // under the key that encrypts the carrying message.
    fn install_announced_key<E: Environment<Instant = I>>(
        &mut self,
        msg: &StreamMessage,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let Some(announced) = &msg.new_group_key else {
            return Vec::new();
        };
        let Some(wrap_id) = &msg.group_key_id else {
            return Vec::new();
        };
        let Some(wrap_key) = store.get(&self.stream_id, wrap_id) else {
            // The wrapping key is itself missing; the rotated key will be
            // requested when a message needs it.
            debug!(stream_id = self.stream_id, key_id = announced.id, wrap_id,
                   "skipping key announcement, wrapping key not held");
            return Vec::new();
        };

        let installed = cipher::decrypt(&announced.ciphertext_hex, wrap_key)
            .ok()
            .and_then(|secret| GroupKey::new(announced.id.clone(), &secret).ok());
        let Some(key) = installed else {
            warn!(stream_id = self.stream_id, key_id = announced.id,
                  "announced group key failed to unwrap");
            return vec![SubscriberAction::Log {
                message: format!(
                    "could not unwrap announced group key {} in {}",
                    announced.id, self.stream_id
                ),
            }];
        };
        if let Err(e) = store.add(&self.stream_id, key) {
            // Re-announcements of a known key are routine.
            debug!(stream_id = self.stream_id, error = %e, "announced key already held");
            return Vec::new();
        }
        self.keys_available(None, env, key_pair, store)
    }

    fn request_key<E: Environment<Instant = I>>(
        &mut self,
        publisher: Address,
        key_id: String,
        env: &E,
        key_pair: &ExchangeKeyPair,
    ) -> Vec<SubscriberAction> {
        if self.requested_key_ids.contains(&key_id) {
            return Vec::new();
        }
        let pem = match key_pair.public_key_pem() {
            Ok(pem) => pem,
            Err(e) => {
                warn!(error = %e, "could not render exchange public key");
                return vec![SubscriberAction::Log {
                    message: format!("group key request skipped, no exchange key: {e}"),
                }];
            },
        };
        let request_id = request_id(env);
        self.requested_key_ids.insert(key_id.clone());
        self.pending_key_requests.insert(request_id.clone(), publisher);
        vec![SubscriberAction::RequestGroupKey {
            stream_id: self.stream_id.clone(),
            publisher,
            request_id,
            group_key_ids: vec![key_id],
            rsa_public_key_pem: pem,
        }]
    }

    // Ordering engine step plus decryption of whatever it releases.
    fn run_chain<E: Environment<Instant = I>>(
        &mut self,
        msg: StreamMessage,
        env: &E,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let chain_actions = self.orderer.add(msg, env.now());
        self.apply_chain_actions(chain_actions, env, store)
    }

    fn apply_chain_actions<E: Environment<Instant = I>>(
        &mut self,
        chain_actions: Vec<ChainAction>,
        env: &E,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        for chain_action in chain_actions {
            match chain_action {
                ChainAction::Deliver(msg) => actions.push(self.deliver(msg, store)),
                ChainAction::RequestResend { publisher, msg_chain_id, from, to } => {
                    let filter = ResendFilter {
                        publisher_id: publisher.to_hex(),
                        msg_chain_id,
                    };
                    // `from` is the last delivered ref; the wire range is
                    // inclusive, so ask from the next sequence number on.
                    let first_missing = MessageRef {
                        timestamp_ms: from.timestamp_ms,
                        sequence_number: from.sequence_number + 1,
                    };
                    match ResendRequest::range(first_missing, to, Some(filter)) {
                        Ok(request) => actions.push(SubscriberAction::SendResendRequest {
                            stream_id: self.stream_id.clone(),
                            partition: self.partition,
                            request_id: request_id(env),
                            request,
                        }),
                        Err(e) => {
                            warn!(error = %e, "gap bounds were not a valid resend range");
                        },
                    }
                },
                ChainAction::GapFailed { publisher, msg_chain_id, from, to } => {
                    actions.push(SubscriberAction::ReportError(StreamError::GapFillFailed {
                        publisher,
                        msg_chain_id,
                        from,
                        to,
                    }));
                },
            }
        }
        actions
    }

    // Decrypt a message the ordering engine released and emit `Deliver`.
    fn deliver(&self, mut msg: StreamMessage, store: &GroupKeyStore) -> SubscriberAction {
        if msg.encryption_type == EncryptionType::Aes {
            let decrypted = msg
                .group_key_id
                .as_ref()
                .and_then(|id| store.get(&self.stream_id, id))
                .and_then(|key| cipher::decrypt(&msg.content, key).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decrypted {
                Some(plaintext) => {
                    msg.content = plaintext;
                    msg.encryption_type = EncryptionType::None;
                },
                None => {
                    return SubscriberAction::ReportError(StreamError::UnableToDecrypt {
                        stream_id: self.stream_id.clone(),
                        group_key_id: msg.group_key_id.clone().unwrap_or_default(),
                    });
                },
            }
        }
        SubscriberAction::Deliver {
            stream_id: self.stream_id.clone(),
            partition: self.partition,
            message: msg,
        }
    }

    fn maybe_finish_resend<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let ready = self
            .resend
            .as_ref()
            .is_some_and(|r| r.done_pending && self.queue.is_empty());
        if ready { self.finish_resend(env, key_pair, store) } else { Vec::new() }
    }

    // Historical replay and decryption backlog are both empty: fire
    // "done", hand over to live delivery, and replay buffered messages.
    fn finish_resend<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        key_pair: &ExchangeKeyPair,
        store: &mut GroupKeyStore,
    ) -> Vec<SubscriberAction> {
        let Some(resend) = self.resend.take() else {
            return Vec::new();
        };
        let mut actions = vec![SubscriberAction::ResendDone {
            stream_id: self.stream_id.clone(),
            partition: self.partition,
        }];
        if resend.combined {
            // Fresh engine preloaded with the historical positions, so gap
            // detection continues seamlessly into live delivery.
            self.orderer = OrderedChains::from_snapshot(
                self.orderer.snapshot(),
                self.orderer.max_gap_requests(),
                self.orderer.gap_fill_timeout(),
            );
        }
        for msg in resend.buffer {
            actions.extend(self.process_inbound(msg, env, key_pair, store));
        }
        actions
    }
}

fn request_id<E: Environment>(env: &E) -> String {
    format!("{:016x}", env.random_u64())
}
