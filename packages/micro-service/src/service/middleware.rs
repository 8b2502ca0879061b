//! Middleware chain wrapped around endpoint handlers.
//!
//! Middlewares are applied outermost first: the first one in the list sees
//! the request first and the response last. Each one receives the request
//! and a [`Next`] continuation and returns the [`Response`] to send, so it
//! may rewrite the reply, answer without calling the inner chain, or fail.
//!
//! The innermost handler's reply is captured instead of published. The
//! chain publishes the final response once, after the outermost middleware
//! returns.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use micro_core::Headers;

use super::handler::{Handler, HandlerError};
use super::request::Request;

/// A reply produced inside a middleware chain, not yet published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    data: Bytes,
    headers: Headers,
}

impl Response {
    #[must_use]
    pub fn new(data: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            data: data.into(),
            headers,
        }
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn remove_header(&mut self, key: &str) {
        self.headers.remove(key);
    }

    /// Merges `headers` in. Existing keys are overwritten.
    pub fn update_headers(&mut self, headers: Headers) {
        self.headers.extend(headers);
    }

    pub fn clear_headers(&mut self) {
        self.headers.clear();
    }

    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
    }

    pub fn clear_data(&mut self) {
        self.data = Bytes::new();
    }

    #[must_use]
    pub fn into_parts(self) -> (Bytes, Headers) {
        (self.data, self.headers)
    }
}

/// Wraps an endpoint handler.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Handles `request`, usually by calling `next.run(request)` and
    /// adjusting the returned response.
    async fn call(&self, request: Request, next: Next) -> Result<Response, HandlerError>;
}

/// The rest of the chain after the current middleware.
#[derive(Clone)]
pub struct Next {
    handler: Arc<dyn Handler>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    index: usize,
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.middlewares.len() - self.index))
            .finish_non_exhaustive()
    }
}

impl Next {
    /// Runs the remaining middlewares and then the handler.
    ///
    /// # Errors
    ///
    /// Whatever an inner middleware or the handler returns, and
    /// [`HandlerError::Internal`] when the handler finished without replying.
    pub async fn run(self, request: Request) -> Result<Response, HandlerError> {
        if self.index < self.middlewares.len() {
            let middleware = Arc::clone(&self.middlewares[self.index]);
            let next = Self {
                index: self.index + 1,
                ..self
            };
            return middleware.call(request, next).await;
        }

        let (captured, slot) = request.capturing();
        self.handler.handle(captured).await?;
        let response = slot.lock().take();
        response.ok_or_else(|| HandlerError::Internal(anyhow::anyhow!("handler did not respond")))
    }
}

/// Middleware backed by an async closure. Built with [`middleware_fn`].
#[derive(Clone)]
pub struct MiddlewareFn<F> {
    f: F,
}

/// Wraps `f` as a [`Middleware`].
///
/// ```
/// use micro_service::service::{middleware_fn, Next, Request};
///
/// let tag = middleware_fn(|request: Request, next: Next| async move {
///     let mut response = next.run(request).await?;
///     response.add_header("X-Served-By", "demo");
///     Ok(response)
/// });
/// # let _ = tag;
/// ```
pub fn middleware_fn<F, Fut>(f: F) -> MiddlewareFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    MiddlewareFn { f }
}

#[async_trait]
impl<F, Fut> Middleware for MiddlewareFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    async fn call(&self, request: Request, next: Next) -> Result<Response, HandlerError> {
        (self.f)(request, next).await
    }
}

struct Chain {
    entry: Next,
}

#[async_trait]
impl Handler for Chain {
    async fn handle(&self, request: Request) -> Result<(), HandlerError> {
        let response = self.entry.clone().run(request.clone()).await?;
        let (data, headers) = response.into_parts();
        request.respond_with_headers(data, headers).await?;
        Ok(())
    }
}

/// Wraps `handler` in `middlewares`, first element outermost.
///
/// Returns `handler` unchanged when the list is empty.
#[must_use]
pub fn apply_middlewares(
    handler: Arc<dyn Handler>,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> Arc<dyn Handler> {
    if middlewares.is_empty() {
        return handler;
    }
    Arc::new(Chain {
        entry: Next {
            handler,
            middlewares: middlewares.into(),
            index: 0,
        },
    })
}
