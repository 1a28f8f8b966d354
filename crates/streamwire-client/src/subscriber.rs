//! Top-level subscriber state machine.
//!
//! Owns the subscription registry, the shared group key store, and the
//! session's RSA exchange key pair. The transport driver feeds it events
//! and executes the actions it returns; the subscriber itself performs
//! no I/O.

use std::collections::HashMap;

use streamwire_crypto::ExchangeKeyPair;
use streamwire_proto::{GroupKeyErrorResponse, GroupKeyResponse, StreamMessage};
use tracing::{debug, warn};

use crate::{
    env::Environment,
    error::SubscriberError,
    event::{SubscribeOptions, SubscriberAction, SubscriberEvent},
    key_store::GroupKeyStore,
    subscription::{Subscription, SubscriptionState},
};

/// Subscriber engine for one transport session.
pub struct Subscriber<E: Environment> {
    env: E,
    key_pair: ExchangeKeyPair,
    key_store: GroupKeyStore,
    /// stream id → partition → subscription.
    subscriptions: HashMap<String, HashMap<u32, Subscription<E::Instant>>>,
}

impl<E: Environment> Subscriber<E> {
    /// Create a subscriber with a session exchange key pair.
    pub fn new(env: E, key_pair: ExchangeKeyPair) -> Self {
        Self { env, key_pair, key_store: GroupKeyStore::new(), subscriptions: HashMap::new() }
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(HashMap::len).sum()
    }

    /// Lifecycle state of a subscription, if registered.
    pub fn subscription_state(&self, stream_id: &str, partition: u32) -> Option<SubscriptionState> {
        self.subscriptions.get(stream_id)?.get(&partition).map(Subscription::state)
    }

    /// Shared group key store, for preloading known keys.
    pub fn key_store_mut(&mut self) -> &mut GroupKeyStore {
        &mut self.key_store
    }

    /// Process one event and return the resulting actions.
    pub fn handle(
        &mut self,
        event: SubscriberEvent<E::Instant>,
    ) -> Result<Vec<SubscriberAction>, SubscriberError> {
        match event {
            SubscriberEvent::Subscribe { stream_id, partition, options } => {
                self.handle_subscribe(stream_id, partition, options)
            },
            SubscriberEvent::SubscribeAck { stream_id, partition } => {
                let sub = self.subscription_mut(&stream_id, partition)?;
                sub.ack();
                Ok(Vec::new())
            },
            SubscriberEvent::Unsubscribe { stream_id, partition } => {
                self.handle_unsubscribe(&stream_id, partition)
            },
            SubscriberEvent::Message(msg) => self.handle_inbound(msg, true),
            SubscriberEvent::ResendMessage(msg) => self.handle_inbound(msg, false),
            SubscriberEvent::ResendComplete { stream_id, partition } => {
                let env = self.env.clone();
                let Some(sub) = self
                    .subscriptions
                    .get_mut(&stream_id)
                    .and_then(|partitions| partitions.get_mut(&partition))
                else {
                    return Err(SubscriberError::SubscriptionNotFound { stream_id, partition });
                };
                Ok(sub.resend_complete(&env, &self.key_pair, &mut self.key_store))
            },
            SubscriberEvent::GroupKeyResponse(response) => self.handle_key_response(response),
            SubscriberEvent::GroupKeyError(response) => self.handle_key_error(&response),
            SubscriberEvent::TransportClosed => Ok(self.handle_transport_closed()),
            SubscriberEvent::Tick { now } => Ok(self.handle_tick(now)),
        }
    }

    fn handle_subscribe(
        &mut self,
        stream_id: String,
        partition: u32,
        options: SubscribeOptions,
    ) -> Result<Vec<SubscriberAction>, SubscriberError> {
        let partitions = self.subscriptions.entry(stream_id.clone()).or_default();
        if partitions.contains_key(&partition) {
            return Err(SubscriberError::AlreadySubscribed { stream_id, partition });
        }

        let (subscription, resend) = Subscription::new(stream_id.clone(), partition, options);
        partitions.insert(partition, subscription);

        let mut actions = vec![SubscriberAction::Log {
            message: format!("subscribing to {stream_id} partition {partition}"),
        }];
        if let Some(request) = resend {
            actions.push(SubscriberAction::SendResendRequest {
                stream_id,
                partition,
                request_id: format!("{:016x}", self.env.random_u64()),
                request,
            });
        }
        Ok(actions)
    }

    fn handle_unsubscribe(
        &mut self,
        stream_id: &str,
        partition: u32,
    ) -> Result<Vec<SubscriberAction>, SubscriberError> {
        let Some(partitions) = self.subscriptions.get_mut(stream_id) else {
            return Err(SubscriberError::SubscriptionNotFound {
                stream_id: stream_id.to_string(),
                partition,
            });
        };
        let Some(mut subscription) = partitions.remove(&partition) else {
            return Err(SubscriberError::SubscriptionNotFound {
                stream_id: stream_id.to_string(),
                partition,
            });
        };
        if partitions.is_empty() {
            self.subscriptions.remove(stream_id);
        }
        Ok(subscription.unsubscribe())
    }

    // Messages route by their own id; an unknown pair is dropped with a
    // trace, not an error, since unsubscribe races the transport.
    fn handle_inbound(
        &mut self,
        msg: StreamMessage,
        live: bool,
    ) -> Result<Vec<SubscriberAction>, SubscriberError> {
        let env = self.env.clone();
        let stream_id = msg.id.stream_id.clone();
        let partition = msg.id.partition;
        let sub = self
            .subscriptions
            .get_mut(&stream_id)
            .and_then(|partitions| partitions.get_mut(&partition));
        let Some(sub) = sub else {
            debug!(stream_id, partition, "dropping message for unknown subscription");
            return Ok(Vec::new());
        };
        Ok(sub.handle_message(msg, live, &env, &self.key_pair, &mut self.key_store))
    }

    // Unwrap every key in the response with the session pair, install the
    // good ones, then let every subscription of the stream drain.
    fn handle_key_response(
        &mut self,
        response: GroupKeyResponse,
    ) -> Result<Vec<SubscriberAction>, SubscriberError> {
        let env = self.env.clone();
        let mut actions = Vec::new();
        for wrapped in &response.keys {
            match self.key_pair.unwrap_key(&wrapped.ciphertext_hex, &wrapped.id) {
                Ok(key) => {
                    if let Err(e) = self.key_store.add(&response.stream_id, key) {
                        debug!(error = %e, "group key from response already held");
                    }
                },
                Err(e) => {
                    warn!(key_id = wrapped.id, error = %e, "could not unwrap group key");
                    actions.push(SubscriberAction::Log {
                        message: format!("discarded undecryptable group key {}: {e}", wrapped.id),
                    });
                },
            }
        }
        if let Some(partitions) = self.subscriptions.get_mut(&response.stream_id) {
            for sub in partitions.values_mut() {
                actions.extend(sub.keys_available(
                    Some(&response.request_id),
                    &env,
                    &self.key_pair,
                    &mut self.key_store,
                ));
            }
        }
        Ok(actions)
    }

    fn handle_key_error(
        &mut self,
        response: &GroupKeyErrorResponse,
    ) -> Result<Vec<SubscriberAction>, SubscriberError> {
        warn!(
            stream_id = response.stream_id,
            request_id = response.request_id,
            code = response.error_code,
            "group key request refused"
        );
        let env = self.env.clone();
        let mut actions = vec![SubscriberAction::Log {
            message: format!(
                "group key request {} refused ({}): {}",
                response.request_id, response.error_code, response.error_message
            ),
        }];
        if let Some(partitions) = self.subscriptions.get_mut(&response.stream_id) {
            for sub in partitions.values_mut() {
                actions.extend(sub.keys_refused(
                    &response.request_id,
                    &response.group_key_ids,
                    &env,
                    &self.key_pair,
                    &mut self.key_store,
                ));
            }
        }
        Ok(actions)
    }

    fn handle_transport_closed(&mut self) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        for partitions in self.subscriptions.values_mut() {
            for sub in partitions.values_mut() {
                actions.extend(sub.unsubscribe());
            }
        }
        self.subscriptions.clear();
        actions.push(SubscriberAction::Log {
            message: "transport closed, all subscriptions ended".to_string(),
        });
        actions
    }

    fn handle_tick(&mut self, now: E::Instant) -> Vec<SubscriberAction> {
        let env = self.env.clone();
        let mut actions = Vec::new();
        for partitions in self.subscriptions.values_mut() {
            for sub in partitions.values_mut() {
                actions.extend(sub.tick(now, &env, &mut self.key_store));
            }
        }
        actions
    }

    fn subscription_mut(
        &mut self,
        stream_id: &str,
        partition: u32,
    ) -> Result<&mut Subscription<E::Instant>, SubscriberError> {
        self.subscriptions
            .get_mut(stream_id)
            .and_then(|partitions| partitions.get_mut(&partition))
            .ok_or_else(|| SubscriberError::SubscriptionNotFound {
                stream_id: stream_id.to_string(),
                partition,
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use streamwire_proto::{MessageId, StreamMessage};

    use super::*;
    use crate::env::test_utils::MockEnv;

    fn subscriber() -> Subscriber<MockEnv> {
        let pair =
            ExchangeKeyPair::generate_with_bits(&mut rand::thread_rng(), 2048).unwrap();
        Subscriber::new(MockEnv::new(), pair)
    }

    fn msg(stream: &str, partition: u32, ts: i64) -> StreamMessage {
        let id = MessageId {
            stream_id: stream.to_string(),
            partition,
            timestamp_ms: ts,
            sequence_number: 0,
            publisher_id: streamwire_proto::Address::new([1; 20]),
            msg_chain_id: "chain".to_string(),
        };
        StreamMessage::new(id, None, "{}".to_string())
    }

    fn subscribe(sub: &mut Subscriber<MockEnv>, stream: &str, partition: u32) {
        sub.handle(SubscriberEvent::Subscribe {
            stream_id: stream.to_string(),
            partition,
            options: SubscribeOptions::default(),
        })
        .unwrap();
        sub.handle(SubscriberEvent::SubscribeAck {
            stream_id: stream.to_string(),
            partition,
        })
        .unwrap();
    }

    #[test]
    fn duplicate_subscribe_collides() {
        let mut sub = subscriber();
        subscribe(&mut sub, "s", 0);
        let result = sub.handle(SubscriberEvent::Subscribe {
            stream_id: "s".to_string(),
            partition: 0,
            options: SubscribeOptions::default(),
        });
        assert!(matches!(result, Err(SubscriberError::AlreadySubscribed { .. })));
        // A different partition of the same stream is fine.
        assert!(
            sub.handle(SubscriberEvent::Subscribe {
                stream_id: "s".to_string(),
                partition: 1,
                options: SubscribeOptions::default(),
            })
            .is_ok()
        );
    }

    #[test]
    fn unsubscribe_unknown_pair_is_not_found() {
        let mut sub = subscriber();
        let result = sub.handle(SubscriberEvent::Unsubscribe {
            stream_id: "s".to_string(),
            partition: 0,
        });
        assert!(matches!(result, Err(SubscriberError::SubscriptionNotFound { .. })));
    }

    #[test]
    fn messages_route_by_their_id() {
        let mut sub = subscriber();
        subscribe(&mut sub, "a", 0);
        subscribe(&mut sub, "b", 0);

        let actions = sub.handle(SubscriberEvent::Message(msg("b", 0, 1))).unwrap();
        let delivered: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                SubscriberAction::Deliver { stream_id, .. } => Some(stream_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec!["b".to_string()]);
    }

    #[test]
    fn message_for_unknown_subscription_is_dropped() {
        let mut sub = subscriber();
        let actions = sub.handle(SubscriberEvent::Message(msg("s", 0, 1))).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn transport_closed_ends_everything() {
        let mut sub = subscriber();
        subscribe(&mut sub, "a", 0);
        subscribe(&mut sub, "a", 1);
        sub.handle(SubscriberEvent::TransportClosed).unwrap();
        assert_eq!(sub.subscription_count(), 0);

        // Late traffic after closure is dropped silently.
        let late = sub.handle(SubscriberEvent::Message(msg("a", 0, 2))).unwrap();
        assert!(late.is_empty());
    }

    #[test]
    fn resubscribe_after_unsubscribe_is_a_new_instance() {
        let mut sub = subscriber();
        subscribe(&mut sub, "s", 0);
        sub.handle(SubscriberEvent::Unsubscribe { stream_id: "s".to_string(), partition: 0 })
            .unwrap();
        subscribe(&mut sub, "s", 0);
        assert_eq!(
            sub.subscription_state("s", 0),
            Some(SubscriptionState::Subscribed)
        );
    }
}
