//! A registered endpoint: subscription, dispatch loop and statistics.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::FutureExt;
use micro_core::{EndpointInfo, EndpointStats, Message, Metadata};
use parking_lot::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use super::error::DrainFailure;
use super::handler::{Handler, HandlerError};
use super::lifecycle::LifecycleController;
use super::request::{Request, RespondError};
use super::stats::StatsRecord;
use crate::transport::{SubscriptionId, Transport, TransportError};

const INTERNAL_ERROR_CODE: u16 = 500;
const INTERNAL_ERROR_DESCRIPTION: &str = "Internal Server Error";

struct EndpointInner {
    name: String,
    subject: String,
    queue_group: String,
    metadata: Metadata,
    handler: Arc<dyn Handler>,
    stats: Arc<StatsRecord>,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Handle to a registered endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("subject", &self.inner.subject)
            .field("queue_group", &self.inner.queue_group)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub(crate) fn new(
        name: String,
        subject: String,
        queue_group: String,
        metadata: Metadata,
        handler: Arc<dyn Handler>,
        stats: Arc<StatsRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                name,
                subject,
                queue_group,
                metadata,
                handler,
                stats,
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Endpoint name as registered.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fully-qualified subject, group prefixes included.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// Queue group the endpoint subscribes in.
    #[must_use]
    pub fn queue_group(&self) -> &str {
        &self.inner.queue_group
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    /// `true` while the endpoint holds a live subscription.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscription.lock().is_some()
    }

    /// INFO entry of this endpoint.
    #[must_use]
    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            name: self.inner.name.clone(),
            subject: self.inner.subject.clone(),
            queue_group: self.inner.queue_group.clone(),
            metadata: self.inner.metadata.clone(),
        }
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> EndpointStats {
        self.inner.stats.snapshot()
    }

    /// Sets the endpoint-specific `data` reported in STATS replies.
    pub fn set_stats_data(&self, data: Option<serde_json::Value>) {
        self.inner.stats.set_data(data);
    }

    /// Zeroes the counters unless the service has stopped.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    // -----------------------------------------------------------------------
    // Subscription management
    // -----------------------------------------------------------------------

    /// Subscribes in the endpoint's queue group and spawns the dispatch loop.
    ///
    /// Each message is handled on its own task, counted by `lifecycle`'s
    /// in-flight tracker.
    pub(crate) async fn subscribe(
        &self,
        transport: Arc<dyn Transport>,
        lifecycle: Arc<LifecycleController>,
    ) -> Result<(), TransportError> {
        let mut subscription = transport
            .subscribe(&self.inner.subject, Some(self.inner.queue_group.as_str()))
            .await?;
        *self.inner.subscription.lock() = Some(subscription.id());
        debug!(
            endpoint = %self.inner.name,
            subject = %self.inner.subject,
            queue_group = %self.inner.queue_group,
            "endpoint subscribed"
        );

        let endpoint = self.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.next_message().await {
                let endpoint = endpoint.clone();
                let transport = Arc::clone(&transport);
                let guard = lifecycle.in_flight_guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    endpoint.dispatch(message, transport).await;
                });
            }
            debug!(subject = %endpoint.inner.subject, "endpoint subscription closed");
        });
        Ok(())
    }

    /// Cancels the subscription, if any. Returns the cancelled id.
    pub(crate) async fn unsubscribe(
        &self,
        transport: &Arc<dyn Transport>,
    ) -> Result<Option<SubscriptionId>, DrainFailure> {
        let id = self.inner.subscription.lock().take();
        let Some(id) = id else {
            return Ok(None);
        };
        transport
            .unsubscribe(id)
            .await
            .map(|()| Some(id))
            .map_err(|error| DrainFailure {
                subject: self.inner.subject.clone(),
                subscription: Some(id),
                error,
            })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(&self, message: Message, transport: Arc<dyn Transport>) {
        let span = info_span!(
            "endpoint_request",
            endpoint = %self.inner.name,
            subject = %message.subject,
            duration_us = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let counted = self.inner.stats.begin_request();
            let request = Request::new(message, transport);
            let fallback = request.clone();

            let start = Instant::now();
            let result = AssertUnwindSafe(self.inner.handler.handle(request))
                .catch_unwind()
                .await;
            let elapsed = start.elapsed();

            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(HandlerError::Service(err))) => Some(Failure {
                    last_error: err.description.clone(),
                    code: err.code,
                    description: err.description,
                    data: err.data,
                }),
                Ok(Err(err)) => Some(Failure::internal(err.to_string())),
                Err(panic) => Some(Failure::internal(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            if counted {
                self.inner
                    .stats
                    .complete_request(elapsed, failure.as_ref().map(|f| f.last_error.as_str()));
            }

            let span = tracing::Span::current();
            span.record(
                "duration_us",
                u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            );

            let Some(failure) = failure else {
                span.record("outcome", "ok");
                return;
            };
            span.record("outcome", "error");
            warn!(code = failure.code, error = %failure.last_error, "endpoint handler failed");

            if fallback.has_responded() {
                return;
            }
            match fallback
                .respond_error(failure.code, &failure.description, failure.data)
                .await
            {
                Ok(()) | Err(RespondError::AlreadyResponded) => {}
                Err(err) => warn!(error = %err, "failed to send error reply"),
            }
        }
        .instrument(span)
        .await;
    }
}

struct Failure {
    last_error: String,
    code: u16,
    description: String,
    data: Option<Bytes>,
}

impl Failure {
    fn internal(last_error: String) -> Self {
        Self {
            last_error,
            code: INTERNAL_ERROR_CODE,
            description: INTERNAL_ERROR_DESCRIPTION.to_string(),
            data: None,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use micro_core::ERROR_HEADER;

    use super::*;
    use crate::service::handler::{handler_fn, ServiceError};
    use crate::service::stats::StatsLedger;
    use crate::transport::InMemoryTransport;

    fn endpoint(handler: Arc<dyn Handler>, ledger: &StatsLedger) -> Endpoint {
        Endpoint::new(
            "echo".to_string(),
            "demo.ECHO".to_string(),
            "q".to_string(),
            Metadata::new(),
            handler,
            ledger.record("echo", "demo.ECHO", "q"),
        )
    }

    async fn call(transport: &Arc<InMemoryTransport>, payload: &'static str) -> Message {
        transport
            .request(
                "demo.ECHO",
                micro_core::Headers::new(),
                Bytes::from_static(payload.as_bytes()),
                Duration::from_secs(1),
            )
            .await
            .unwrap()
    }

    async fn started(handler: Arc<dyn Handler>) -> (Arc<InMemoryTransport>, Endpoint, StatsLedger) {
        let transport = Arc::new(InMemoryTransport::new());
        let ledger = StatsLedger::new();
        let endpoint = endpoint(handler, &ledger);
        endpoint
            .subscribe(transport.clone(), Arc::new(LifecycleController::new()))
            .await
            .unwrap();
        (transport, endpoint, ledger)
    }

    #[tokio::test]
    async fn echo_round_trip_updates_stats() {
        let handler = Arc::new(handler_fn(|request: Request| async move {
            let payload = request.data().clone();
            request.respond(payload).await?;
            Ok(())
        }));
        let (transport, endpoint, _ledger) = started(handler).await;
        assert!(endpoint.is_subscribed());

        let reply = call(&transport, "Hello, world!").await;
        assert_eq!(reply.payload, Bytes::from_static(b"Hello, world!"));

        let stats = endpoint.stats();
        assert_eq!(stats.num_requests, 1);
        assert_eq!(stats.num_errors, 0);
    }

    #[tokio::test]
    async fn service_error_is_replied_with_headers() {
        let handler = Arc::new(handler_fn(|_request: Request| async move {
            Err(ServiceError::new(400, "bad request").into())
        }));
        let (transport, endpoint, _ledger) = started(handler).await;

        let reply = call(&transport, "x").await;
        assert_eq!(reply.service_error(), Some((400, "bad request")));

        // Stats are recorded before the error reply is published.
        let stats = endpoint.stats();
        assert_eq!(stats.num_requests, 1);
        assert_eq!(stats.num_errors, 1);
        assert_eq!(stats.last_error, "bad request");
    }

    #[tokio::test]
    async fn internal_error_is_replied_as_500() {
        let handler = Arc::new(handler_fn(|_request: Request| async move {
            Err(anyhow::anyhow!("database unavailable").into())
        }));
        let (transport, endpoint, _ledger) = started(handler).await;

        let reply = call(&transport, "x").await;
        assert_eq!(reply.service_error(), Some((500, "Internal Server Error")));
        assert_eq!(endpoint.stats().last_error, "database unavailable");
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let handler = Arc::new(handler_fn(|request: Request| async move {
            if request.data().as_ref() == b"boom" {
                panic!("kaboom");
            }
            request.respond("fine").await?;
            Ok(())
        }));
        let (transport, endpoint, _ledger) = started(handler).await;

        let reply = call(&transport, "boom").await;
        assert_eq!(reply.headers.get(ERROR_HEADER).map(String::as_str), Some("Internal Server Error"));
        assert_eq!(endpoint.stats().last_error, "handler panicked: kaboom");

        // The dispatch loop survives the panic.
        let reply = call(&transport, "ok").await;
        assert_eq!(reply.payload, Bytes::from_static(b"fine"));
        assert_eq!(endpoint.stats().num_requests, 2);
        assert_eq!(endpoint.stats().num_errors, 1);
    }

    #[tokio::test]
    async fn error_after_reply_is_counted_but_not_replied_twice() {
        let handler = Arc::new(handler_fn(|request: Request| async move {
            request.respond("partial").await?;
            Err(anyhow::anyhow!("post-reply failure").into())
        }));
        let (transport, endpoint, _ledger) = started(handler).await;

        let reply = call(&transport, "x").await;
        assert_eq!(reply.payload, Bytes::from_static(b"partial"));
        assert!(reply.service_error().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = endpoint.stats();
        assert_eq!(stats.num_errors, 1);
        assert_eq!(stats.last_error, "post-reply failure");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let handler = Arc::new(handler_fn(|_request: Request| async { Ok(()) }));
        let (transport, endpoint, _ledger) = started(handler).await;
        let dyn_transport: Arc<dyn Transport> = transport.clone();

        assert!(endpoint.unsubscribe(&dyn_transport).await.unwrap().is_some());
        assert!(!endpoint.is_subscribed());
        assert_eq!(endpoint.unsubscribe(&dyn_transport).await.unwrap(), None);
        assert_eq!(transport.subscription_count(), 0);
    }

    #[tokio::test]
    async fn set_stats_data_is_reported() {
        let handler = Arc::new(handler_fn(|_request: Request| async { Ok(()) }));
        let ledger = StatsLedger::new();
        let endpoint = endpoint(handler, &ledger);
        endpoint.set_stats_data(Some(serde_json::json!({"hits": 3})));
        assert_eq!(endpoint.stats().data, Some(serde_json::json!({"hits": 3})));
        assert_eq!(endpoint.info().subject, "demo.ECHO");
    }
}
