//! Process-local transport with NATS subject semantics.
//!
//! Subscriptions are tracked in a `DashMap` keyed by [`SubscriptionId`]; each
//! one owns a bounded mpsc channel. Publishing matches the subject against
//! every subscription pattern, delivers to all plain subscribers and to one
//! randomly chosen member of each matching queue group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use micro_core::subject::{self, SEPARATOR, WILDCARD_ONE, WILDCARD_TAIL};
use micro_core::{Headers, Message};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::config::MemoryTransportConfig;
use super::{Subscription, SubscriptionId, Transport, TransportError};

/// Sender half and routing data of one subscription.
#[derive(Debug)]
struct SubscriberEntry {
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::Sender<Message>,
}

/// In-memory publish/subscribe bus.
///
/// Share it behind an `Arc` so multiple services and clients talk over the
/// same "connection".
#[derive(Debug)]
pub struct InMemoryTransport {
    config: MemoryTransportConfig,
    subscribers: DashMap<SubscriptionId, SubscriberEntry>,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
}

impl InMemoryTransport {
    /// Creates a transport with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryTransportConfig::default())
    }

    /// Creates a transport with the given settings.
    ///
    /// Subscription IDs start at 1. A `subscription_capacity` of 0 is raised
    /// to 1.
    #[must_use]
    pub fn with_config(mut config: MemoryTransportConfig) -> Self {
        config.subscription_capacity = config.subscription_capacity.max(1);
        Self {
            config,
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total number of messages accepted for publishing.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Closes the transport. Every subscription stream ends after draining
    /// its buffer and later operations fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.subscribers.len();
        self.subscribers.clear();
        debug!(subscriptions = count, "in-memory transport closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Routes `message` to matching subscribers and returns how many
    /// subscriptions accepted it.
    fn deliver(&self, message: &Message) -> Result<usize, TransportError> {
        self.ensure_open()?;
        validate_publish_subject(&message.subject)?;
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut plain = Vec::new();
        let mut groups: HashMap<String, Vec<mpsc::Sender<Message>>> = HashMap::new();
        for entry in &self.subscribers {
            if !subject::matches(&entry.pattern, &message.subject) {
                continue;
            }
            match &entry.queue_group {
                Some(group) => groups.entry(group.clone()).or_default().push(entry.tx.clone()),
                None => plain.push(entry.tx.clone()),
            }
        }

        let mut targets = plain;
        if !groups.is_empty() {
            let mut rng = rand::rng();
            for mut members in groups.into_values() {
                let pick = rng.random_range(0..members.len());
                targets.push(members.swap_remove(pick));
            }
        }

        let mut delivered = 0;
        for tx in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject = %message.subject, "subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subject = %message.subject, "subscriber gone, message dropped");
                }
            }
        }
        trace!(subject = %message.subject, delivered, "message published");
        Ok(delivered)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        validate_subscribe_subject(subject)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscription_capacity);
        let queue_group = queue_group.map(str::to_string);
        self.subscribers.insert(
            id,
            SubscriberEntry {
                pattern: subject.to_string(),
                queue_group: queue_group.clone(),
                tx,
            },
        );
        debug!(id, subject, queue_group = ?queue_group, "subscribed");
        Ok(Subscription::new(id, subject, queue_group, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        match self.subscribers.remove(&id) {
            Some((_, entry)) => {
                debug!(id, subject = %entry.pattern, "unsubscribed");
                Ok(())
            }
            None => Err(TransportError::SubscriptionNotFound(id)),
        }
    }

    async fn publish(&self, message: Message) -> Result<(), TransportError> {
        self.deliver(&message).map(|_| ())
    }

    async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox, None).await?;
        let message = Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers,
            payload,
        };

        let outcome = match self.deliver(&message) {
            Ok(0) => Err(TransportError::NoResponders {
                subject: subject.to_string(),
            }),
            Ok(_) => match tokio::time::timeout(timeout, sub.next_message()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(TransportError::Closed),
                Err(_) => Err(TransportError::Timeout {
                    subject: subject.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            Err(e) => Err(e),
        };

        // The inbox may already be gone if the transport was closed meanwhile.
        let _ = self.unsubscribe(sub.id()).await;
        outcome
    }

    fn new_inbox(&self) -> String {
        format!("{}.{}", self.config.inbox_prefix, Uuid::new_v4().simple())
    }
}

fn validate_subscribe_subject(subject: &str) -> Result<(), TransportError> {
    let tokens: Vec<&str> = subject.split(SEPARATOR).collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        let bad_tail = *token == WILDCARD_TAIL && i != last;
        if token.is_empty() || bad_tail || token.chars().any(char::is_whitespace) {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

fn validate_publish_subject(subject: &str) -> Result<(), TransportError> {
    let valid = subject.split(SEPARATOR).all(|token| {
        !token.is_empty()
            && token != WILDCARD_ONE
            && token != WILDCARD_TAIL
            && !token.chars().any(char::is_whitespace)
    });
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidSubject(subject.to_string()))
    }
}
