//! Endpoint handler contract and handler-side errors.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;

use super::request::{Request, RespondError};

/// An explicit endpoint error: replied to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {description}")]
pub struct ServiceError {
    pub code: u16,
    pub description: String,
    pub data: Option<Bytes>,
}

impl ServiceError {
    #[must_use]
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            data: None,
        }
    }

    /// Attaches a reply body.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Outcome of a failed handler invocation.
///
/// [`HandlerError::Service`] is replied with its own code and description.
/// Anything else is an internal fault: it is recorded in the endpoint's
/// statistics and replied as `500 Internal Server Error`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Respond(#[from] RespondError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Processes requests delivered to one endpoint.
///
/// Invoked concurrently: one call per message, possibly many at once.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one request. Replying is up to the handler; an `Err` that
    /// escapes without a reply produces an error reply.
    async fn handle(&self, request: Request) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure. Built with [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` as a [`Handler`].
///
/// ```
/// use micro_service::service::{handler_fn, Request};
///
/// let echo = handler_fn(|request: Request| async move {
///     let payload = request.data().clone();
///     request.respond(payload).await?;
///     Ok(())
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<(), HandlerError> {
        (self.f)(request).await
    }
}
