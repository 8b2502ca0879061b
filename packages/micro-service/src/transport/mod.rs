//! Publish/subscribe transport seam.
//!
//! The service runtime only needs four capabilities from a messaging system:
//! subscribe (optionally in a queue group), unsubscribe, publish, and
//! request/reply. [`Transport`] captures them; [`InMemoryTransport`] is a
//! process-local implementation with NATS subject semantics.

pub mod config;
pub mod memory;

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use micro_core::{Headers, Message};
use tokio::sync::mpsc;

pub use config::MemoryTransportConfig;
pub use memory::InMemoryTransport;

/// Identifier of a live subscription, unique per transport.
pub type SubscriptionId = u64;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("no responders available for {subject}")]
    NoResponders { subject: String },
    #[error("request on {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("unknown subscription {0}")]
    SubscriptionNotFound(SubscriptionId),
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Stream of messages delivered to one subscription.
///
/// The stream ends once the transport drops its side, which happens after
/// `unsubscribe` and after every already-buffered message has been read.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    subject: String,
    queue_group: Option<String>,
    receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Wraps the receiving half of a subscription channel.
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        subject: impl Into<String>,
        queue_group: Option<String>,
        receiver: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            id,
            subject: subject.into(),
            queue_group,
            receiver,
        }
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Waits for the next message. Returns `None` once the subscription is closed.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Messaging capability used by services, endpoints and discovery clients.
///
/// Delivery is at-most-once. Implementations own connection management,
/// wildcard matching and queue-group load balancing.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribes to `subject`. With a queue group, each message is delivered
    /// to only one member of the group.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError>;

    /// Cancels a subscription. Buffered messages are still delivered to the
    /// subscriber before its stream ends.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Publishes a message. `message.reply` becomes the receivers' reply subject.
    async fn publish(&self, message: Message) -> Result<(), TransportError>;

    /// Publishes on `subject` and waits for the first reply.
    async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    /// Returns a fresh, unique reply subject.
    fn new_inbox(&self) -> String;
}
