//! Streamwire subscriber engine.
//!
//! Sans-IO client side of an ordered, cryptographically verifiable
//! pub/sub stream: per-(publisher, chain) ordering with gap recovery,
//! a decryption queue over a shared group key store, and a
//! per-(stream, partition) subscription state machine with real-time,
//! historical, and combined delivery modes.
//!
//! The entry point is [`Subscriber`]: feed it [`SubscriberEvent`]s from
//! the transport and execute the [`SubscriberAction`]s it returns. All
//! time and randomness flows through the [`env::Environment`] trait so
//! the whole engine is deterministic under test.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod decrypt_queue;
pub mod env;
mod error;
mod event;
pub mod key_store;
pub mod orderer;
pub mod subscription;
mod subscriber;

pub use error::{KeyStoreError, StreamError, SubscriberError};
pub use event::{DeliveryKind, SubscribeOptions, SubscriberAction, SubscriberEvent};
pub use subscriber::Subscriber;
