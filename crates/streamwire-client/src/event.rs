//! Events consumed and actions produced by the subscriber state machine.
//!
//! The subscriber is sans-IO: the transport driver feeds it
//! [`SubscriberEvent`]s and executes the [`SubscriberAction`]s it returns.
//! No event handler performs network or timer I/O itself.

use streamwire_proto::{
    Address, GroupKeyErrorResponse, GroupKeyResponse, ResendRequest, StreamMessage,
};

use crate::error::StreamError;

/// How a subscription sources its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Live messages only.
    RealTime,
    /// One historical resend; live messages buffered until it completes.
    Historical(ResendRequest),
    /// Historical resend, then a seamless switch to live delivery.
    Combined(ResendRequest),
}

/// Options for a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Message sourcing mode.
    pub delivery: DeliveryKind,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { delivery: DeliveryKind::RealTime }
    }
}

/// Input to `Subscriber::handle`, parameterized over the environment's
/// instant type for `Tick`.
#[derive(Debug, Clone)]
pub enum SubscriberEvent<I> {
    /// Application requests a subscription.
    Subscribe {
        /// Stream to subscribe to.
        stream_id: String,
        /// Partition within the stream.
        partition: u32,
        /// Delivery mode and resend bounds.
        options: SubscribeOptions,
    },
    /// Transport confirms a subscription request.
    SubscribeAck {
        /// Stream of the confirmed subscription.
        stream_id: String,
        /// Partition of the confirmed subscription.
        partition: u32,
    },
    /// Application tears a subscription down.
    Unsubscribe {
        /// Stream of the subscription.
        stream_id: String,
        /// Partition of the subscription.
        partition: u32,
    },
    /// A live message arrived from the transport, already decoded.
    Message(StreamMessage),
    /// A historical message arrived in answer to a resend request.
    ResendMessage(StreamMessage),
    /// The transport signals that a resend request has been fully served.
    ResendComplete {
        /// Stream of the served resend.
        stream_id: String,
        /// Partition of the served resend.
        partition: u32,
    },
    /// A publisher answered a group key request.
    GroupKeyResponse(GroupKeyResponse),
    /// A publisher refused a group key request.
    GroupKeyError(GroupKeyErrorResponse),
    /// The transport connection is gone; all subscriptions end.
    TransportClosed,
    /// Periodic timer tick driving resend-retry deadlines.
    Tick {
        /// Current time from the environment.
        now: I,
    },
}

/// Output of `Subscriber::handle`, executed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberAction {
    /// Hand a fully verified, ordered, decrypted message to the application.
    Deliver {
        /// Stream the message belongs to.
        stream_id: String,
        /// Partition the message belongs to.
        partition: u32,
        /// The message, content in cleartext.
        message: StreamMessage,
    },
    /// Send a resend request to the transport.
    SendResendRequest {
        /// Stream to request from.
        stream_id: String,
        /// Partition to request from.
        partition: u32,
        /// Correlation id echoed by resend responses.
        request_id: String,
        /// Bounds and filter of the request.
        request: ResendRequest,
    },
    /// Ask a publisher for group keys the subscriber is missing.
    RequestGroupKey {
        /// Stream the keys protect.
        stream_id: String,
        /// Publisher to ask.
        publisher: Address,
        /// Correlation id echoed by the response.
        request_id: String,
        /// The key ids being asked for.
        group_key_ids: Vec<String>,
        /// SPKI PEM of the RSA key the answer should be wrapped with.
        rsa_public_key_pem: String,
    },
    /// A historical resend and its decryption backlog have both drained.
    ResendDone {
        /// Stream of the finished resend.
        stream_id: String,
        /// Partition of the finished resend.
        partition: u32,
    },
    /// Surface a recoverable per-message or per-chain failure.
    ReportError(StreamError),
    /// Diagnostic note for the driver's log sink.
    Log {
        /// Preformatted log line.
        message: String,
    },
}
