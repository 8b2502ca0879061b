//! `micro` Service: discoverable request/reply services over a pub/sub transport.

pub mod client;
pub mod service;
pub mod telemetry;
pub mod transport;

pub use client::{ClientError, DiscoveryClient, RequestManyOptions};
pub use service::{
    add_service, handler_fn, middleware_fn, EndpointOptions, Handler, HandlerError, Middleware,
    Next, Request, Response, Service, ServiceConfig, ServiceError, ServiceState,
};
pub use transport::{InMemoryTransport, Transport, TransportError};

#[cfg(test)]
mod scenarios;
