//! Discovery client: finds running services and queries their documents.
//!
//! Broadcast and per-service queries are scatter-gather: one request is
//! published with a private inbox as reply subject, and replies are collected
//! until a deadline, an idle interval, or a reply count is reached.
//! Per-instance queries expect exactly one reply.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use micro_core::messages::decode;
use micro_core::subject::control_subject;
use micro_core::{Headers, Message, PingInfo, ServiceInfo, ServiceStats, Verb, API_PREFIX};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

/// Collection window applied when neither `max_wait` nor `max_interval` is set.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to decode reply: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("service error {code}: {description}")]
    Service { code: u16, description: String },
}

/// Stop conditions for scatter-gather requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestManyOptions {
    /// Total collection window.
    pub max_wait: Option<Duration>,
    /// Stop once no reply arrived for this long.
    pub max_interval: Option<Duration>,
    /// Stop after this many replies. `Some(0)` means no limit.
    pub max_count: Option<usize>,
}

impl RequestManyOptions {
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    #[must_use]
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    #[must_use]
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    fn effective(self) -> Self {
        let max_count = self.max_count.filter(|&max| max > 0);
        if self.max_wait.is_none() && self.max_interval.is_none() {
            Self {
                max_wait: Some(DEFAULT_MAX_WAIT),
                max_count,
                ..self
            }
        } else {
            Self { max_count, ..self }
        }
    }
}

// ---------------------------------------------------------------------------
// DiscoveryClient
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DiscoveryClient {
    transport: Arc<dyn Transport>,
    api_prefix: String,
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("api_prefix", &self.api_prefix)
            .finish_non_exhaustive()
    }
}

impl DiscoveryClient {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            api_prefix: API_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_api_prefix(mut self, api_prefix: impl Into<String>) -> Self {
        self.api_prefix = api_prefix.into();
        self
    }

    /// PINGs every instance, or every instance of `service`.
    ///
    /// # Errors
    ///
    /// Transport failures and undecodable replies.
    pub async fn ping(
        &self,
        service: Option<&str>,
        options: RequestManyOptions,
    ) -> Result<Vec<PingInfo>, ClientError> {
        self.discover(Verb::Ping, service, options).await
    }

    /// # Errors
    ///
    /// Transport failures and undecodable replies.
    pub async fn info(
        &self,
        service: Option<&str>,
        options: RequestManyOptions,
    ) -> Result<Vec<ServiceInfo>, ClientError> {
        self.discover(Verb::Info, service, options).await
    }

    /// # Errors
    ///
    /// Transport failures and undecodable replies.
    pub async fn stats(
        &self,
        service: Option<&str>,
        options: RequestManyOptions,
    ) -> Result<Vec<ServiceStats>, ClientError> {
        self.discover(Verb::Stats, service, options).await
    }

    /// Narrows queries to one service name.
    #[must_use]
    pub fn service(&self, name: impl Into<String>) -> ServiceClient<'_> {
        ServiceClient {
            client: self,
            name: name.into(),
        }
    }

    /// Sends a request to an endpoint subject and returns the reply.
    ///
    /// # Errors
    ///
    /// [`ClientError::Service`] when the reply carries the endpoint error
    /// headers, and [`ClientError::Transport`] for no responders or timeout.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        self.request_with_headers(subject, Headers::new(), payload, timeout)
            .await
    }

    /// # Errors
    ///
    /// See [`DiscoveryClient::request`].
    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let reply = self
            .transport
            .request(subject, headers, payload.into(), timeout)
            .await?;
        if let Some((code, description)) = reply.service_error() {
            return Err(ClientError::Service {
                code,
                description: description.to_string(),
            });
        }
        Ok(reply)
    }

    async fn discover<T: DeserializeOwned>(
        &self,
        verb: Verb,
        service: Option<&str>,
        options: RequestManyOptions,
    ) -> Result<Vec<T>, ClientError> {
        let subject = control_subject(&self.api_prefix, verb, service, None);
        let replies = self.request_many(&subject, options).await?;
        debug!(%subject, replies = replies.len(), "discovery replies collected");
        replies
            .iter()
            .map(|reply| decode(&reply.payload).map_err(ClientError::from))
            .collect()
    }

    async fn request_many(
        &self,
        subject: &str,
        options: RequestManyOptions,
    ) -> Result<Vec<Message>, TransportError> {
        let options = options.effective();
        let inbox = self.transport.new_inbox();
        let mut subscription = self.transport.subscribe(&inbox, None).await?;

        let published = self
            .transport
            .publish(Message {
                subject: subject.to_string(),
                reply: Some(inbox),
                headers: Headers::new(),
                payload: Bytes::new(),
            })
            .await;
        if let Err(err) = published {
            self.release_inbox(subscription.id()).await;
            return Err(err);
        }

        let deadline = options.max_wait.map(|wait| Instant::now() + wait);
        let mut replies = Vec::new();
        loop {
            if options.max_count.is_some_and(|max| replies.len() >= max) {
                break;
            }
            let mut wait = options.max_interval;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                wait = Some(wait.map_or(remaining, |interval| interval.min(remaining)));
            }
            let wait = wait.unwrap_or(DEFAULT_MAX_WAIT);
            match tokio::time::timeout(wait, subscription.next_message()).await {
                Ok(Some(reply)) => replies.push(reply),
                Ok(None) | Err(_) => break,
            }
        }

        self.release_inbox(subscription.id()).await;
        Ok(replies)
    }

    async fn release_inbox(&self, id: crate::transport::SubscriptionId) {
        if let Err(err) = self.transport.unsubscribe(id).await {
            warn!(error = %err, "failed to release discovery inbox");
        }
    }
}

// ---------------------------------------------------------------------------
// Scoped clients
// ---------------------------------------------------------------------------

/// Queries scoped to every instance of one service.
#[derive(Debug, Clone)]
pub struct ServiceClient<'a> {
    client: &'a DiscoveryClient,
    name: String,
}

impl<'a> ServiceClient<'a> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// # Errors
    ///
    /// See [`DiscoveryClient::ping`].
    pub async fn ping(&self, options: RequestManyOptions) -> Result<Vec<PingInfo>, ClientError> {
        self.client.ping(Some(self.name.as_str()), options).await
    }

    /// # Errors
    ///
    /// See [`DiscoveryClient::info`].
    pub async fn info(&self, options: RequestManyOptions) -> Result<Vec<ServiceInfo>, ClientError> {
        self.client.info(Some(self.name.as_str()), options).await
    }

    /// # Errors
    ///
    /// See [`DiscoveryClient::stats`].
    pub async fn stats(&self, options: RequestManyOptions) -> Result<Vec<ServiceStats>, ClientError> {
        self.client.stats(Some(self.name.as_str()), options).await
    }

    /// Narrows queries to one instance.
    #[must_use]
    pub fn instance(&self, id: impl Into<String>) -> InstanceClient<'a> {
        InstanceClient {
            client: self.client,
            name: self.name.clone(),
            id: id.into(),
        }
    }
}

/// Queries addressed to a single instance.
#[derive(Debug, Clone)]
pub struct InstanceClient<'a> {
    client: &'a DiscoveryClient,
    name: String,
    id: String,
}

impl InstanceClient<'_> {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// # Errors
    ///
    /// [`ClientError::Transport`] when the instance does not exist or does
    /// not answer within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<PingInfo, ClientError> {
        self.query(Verb::Ping, timeout).await
    }

    /// # Errors
    ///
    /// See [`InstanceClient::ping`].
    pub async fn info(&self, timeout: Duration) -> Result<ServiceInfo, ClientError> {
        self.query(Verb::Info, timeout).await
    }

    /// # Errors
    ///
    /// See [`InstanceClient::ping`].
    pub async fn stats(&self, timeout: Duration) -> Result<ServiceStats, ClientError> {
        self.query(Verb::Stats, timeout).await
    }

    async fn query<T: DeserializeOwned>(&self, verb: Verb, timeout: Duration) -> Result<T, ClientError> {
        let subject = control_subject(&self.client.api_prefix, verb, Some(self.name.as_str()), Some(self.id.as_str()));
        let reply = self.client.request(&subject, Bytes::new(), timeout).await?;
        Ok(decode(&reply.payload)?)
    }
}
