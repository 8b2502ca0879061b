//! The view of one incoming message handed to an endpoint handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use micro_core::{Headers, Message, ERROR_CODE_HEADER, ERROR_HEADER, SUCCESS_CODE_HEADER};
use parking_lot::Mutex;
use tracing::trace;

use super::middleware::Response;
use crate::transport::{Transport, TransportError};

/// Where a captured reply is stored instead of being published.
pub(crate) type CaptureSlot = Arc<Mutex<Option<Response>>>;

/// Failure to send a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RespondError {
    /// A reply was already sent through this request or one of its clones.
    #[error("request was already responded to")]
    AlreadyResponded,
    /// The transport refused the reply.
    #[error("failed to publish reply: {0}")]
    Transport(#[from] TransportError),
}

/// An incoming request plus the ability to reply to it at most once.
///
/// Clones share the "responded" flag, so only the first `respond*` call
/// across all clones publishes anything.
#[derive(Clone)]
pub struct Request {
    message: Message,
    transport: Arc<dyn Transport>,
    responded: Arc<AtomicBool>,
    capture: Option<CaptureSlot>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("subject", &self.message.subject)
            .field("reply", &self.message.reply)
            .field("responded", &self.has_responded())
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Wraps a delivered message. Replies go out through `transport`.
    #[must_use]
    pub fn new(message: Message, transport: Arc<dyn Transport>) -> Self {
        Self {
            message,
            transport,
            responded: Arc::new(AtomicBool::new(false)),
            capture: None,
        }
    }

    /// A copy of this request whose reply is stored in the returned slot
    /// instead of being published. It has its own "responded" flag.
    pub(crate) fn capturing(&self) -> (Self, CaptureSlot) {
        let slot: CaptureSlot = Arc::new(Mutex::new(None));
        let request = Self {
            message: self.message.clone(),
            transport: Arc::clone(&self.transport),
            responded: Arc::new(AtomicBool::new(false)),
            capture: Some(Arc::clone(&slot)),
        };
        (request, slot)
    }

    /// Subject the request was published on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    /// Reply subject, `None` for fire-and-forget publishes.
    #[must_use]
    pub fn reply(&self) -> Option<&str> {
        self.message.reply.as_deref()
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    /// Raw request payload.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.message.payload
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// `true` once a reply was sent (or dropped for lack of a reply subject).
    #[must_use]
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Replies with `payload` and no headers.
    ///
    /// # Errors
    ///
    /// See [`Request::respond_with_headers`].
    pub async fn respond(&self, payload: impl Into<Bytes>) -> Result<(), RespondError> {
        self.respond_with_headers(payload, Headers::new()).await
    }

    /// Replies with `payload` and `headers`.
    ///
    /// A request without a reply subject is marked responded and nothing is
    /// published.
    ///
    /// # Errors
    ///
    /// [`RespondError::AlreadyResponded`] on any call after the first
    /// successful one, and [`RespondError::Transport`] when the reply could
    /// not be published. A failed publish does not use up the response.
    pub async fn respond_with_headers(
        &self,
        payload: impl Into<Bytes>,
        headers: Headers,
    ) -> Result<(), RespondError> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Err(RespondError::AlreadyResponded);
        }
        if let Some(slot) = &self.capture {
            *slot.lock() = Some(Response::new(payload.into(), headers));
            return Ok(());
        }
        let Some(reply) = self.message.reply.clone() else {
            trace!(subject = %self.message.subject, "request has no reply subject; dropping response");
            return Ok(());
        };
        let published = self
            .transport
            .publish(Message {
                subject: reply,
                reply: None,
                headers,
                payload: payload.into(),
            })
            .await;
        if let Err(err) = published {
            // A reply that never left may be retried, e.g. as an error reply.
            self.responded.store(false, Ordering::Release);
            return Err(err.into());
        }
        Ok(())
    }

    /// Replies with a success code header alongside `headers`.
    ///
    /// # Errors
    ///
    /// See [`Request::respond_with_headers`].
    pub async fn respond_success(
        &self,
        code: u16,
        payload: impl Into<Bytes>,
        mut headers: Headers,
    ) -> Result<(), RespondError> {
        headers.insert(SUCCESS_CODE_HEADER.to_string(), code.to_string());
        self.respond_with_headers(payload, headers).await
    }

    /// Replies with the endpoint error headers. `data` becomes the body.
    ///
    /// # Errors
    ///
    /// See [`Request::respond_with_headers`].
    pub async fn respond_error(
        &self,
        code: u16,
        description: &str,
        data: Option<Bytes>,
    ) -> Result<(), RespondError> {
        let mut headers = Headers::new();
        headers.insert(ERROR_HEADER.to_string(), description.to_string());
        headers.insert(ERROR_CODE_HEADER.to_string(), code.to_string());
        self.respond_with_headers(data.unwrap_or_default(), headers)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::InMemoryTransport;

    async fn setup() -> (Arc<InMemoryTransport>, crate::transport::Subscription, Request) {
        let transport = Arc::new(InMemoryTransport::new());
        let inbox = transport.new_inbox();
        let sub = transport.subscribe(&inbox, None).await.unwrap();
        let mut message = Message::new("demo.ECHO", "ping");
        message.reply = Some(inbox);
        let request = Request::new(message, transport.clone());
        (transport, sub, request)
    }

    async fn next(sub: &mut crate::transport::Subscription) -> Message {
        tokio::time::timeout(Duration::from_secs(1), sub.next_message())
            .await
            .expect("reply arrived")
            .expect("subscription open")
    }

    #[tokio::test]
    async fn accessors_expose_message() {
        let (_transport, _sub, request) = setup().await;
        assert_eq!(request.subject(), "demo.ECHO");
        assert_eq!(request.data(), &Bytes::from_static(b"ping"));
        assert!(request.reply().unwrap().starts_with("_INBOX."));
        assert!(request.headers().is_empty());
        assert!(!request.has_responded());
    }

    #[tokio::test]
    async fn respond_publishes_to_reply_subject() {
        let (_transport, mut sub, request) = setup().await;
        request.respond("pong").await.unwrap();
        let reply = next(&mut sub).await;
        assert_eq!(reply.payload, Bytes::from_static(b"pong"));
        assert!(reply.headers.is_empty());
        assert!(request.has_responded());
    }

    #[tokio::test]
    async fn second_respond_is_rejected() {
        let (_transport, _sub, request) = setup().await;
        request.respond("one").await.unwrap();
        assert_eq!(request.respond("two").await, Err(RespondError::AlreadyResponded));
    }

    #[tokio::test]
    async fn clones_share_responded_flag() {
        let (_transport, _sub, request) = setup().await;
        let clone = request.clone();
        clone.respond("one").await.unwrap();
        assert!(request.has_responded());
        assert_eq!(
            request.respond_error(500, "late", None).await,
            Err(RespondError::AlreadyResponded)
        );
    }

    #[tokio::test]
    async fn respond_error_sets_headers() {
        let (_transport, mut sub, request) = setup().await;
        request
            .respond_error(400, "bad request", Some(Bytes::from_static(b"{}")))
            .await
            .unwrap();
        let reply = next(&mut sub).await;
        assert_eq!(reply.service_error(), Some((400, "bad request")));
        assert_eq!(reply.payload, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn respond_success_sets_code_header() {
        let (_transport, mut sub, request) = setup().await;
        let mut headers = Headers::new();
        headers.insert("X-Trace".to_string(), "1".to_string());
        request.respond_success(201, "created", headers).await.unwrap();
        let reply = next(&mut sub).await;
        assert_eq!(reply.headers.get(SUCCESS_CODE_HEADER).map(String::as_str), Some("201"));
        assert_eq!(reply.headers.get("X-Trace").map(String::as_str), Some("1"));
        assert!(reply.service_error().is_none());
    }

    #[tokio::test]
    async fn missing_reply_subject_is_a_silent_success() {
        let transport = Arc::new(InMemoryTransport::new());
        let request = Request::new(Message::new("demo.ECHO", "x"), transport.clone());
        request.respond("ignored").await.unwrap();
        assert!(request.has_responded());
        assert_eq!(transport.published_count(), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_returned() {
        let (transport, _sub, request) = setup().await;
        transport.close();
        assert_eq!(
            request.respond("x").await,
            Err(RespondError::Transport(TransportError::Closed))
        );
    }

    #[tokio::test]
    async fn failed_publish_does_not_consume_response() {
        let (transport, _sub, request) = setup().await;
        transport.close();
        assert!(request.respond("x").await.is_err());
        assert!(!request.has_responded());
        assert_eq!(
            request.respond_error(500, "retry", None).await,
            Err(RespondError::Transport(TransportError::Closed))
        );
    }
}
