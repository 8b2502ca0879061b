//! Service runtime: endpoints, groups, discovery and lifecycle.
//!
//! 1. **Registration** (`runtime`, `group`): validate names and subjects, build endpoints
//! 2. **Dispatch** (`endpoint`, `request`, `handler`, `middleware`): one task per message, error replies
//! 3. **Statistics** (`stats`): per-endpoint counters, frozen at stop
//! 4. **Discovery** (`discovery`): PING / INFO / STATS responders
//! 5. **Lifecycle** (`lifecycle`, `guard`): `Created -> Started -> Stopped`, scoped acquisition

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod group;
pub mod guard;
pub mod handler;
pub mod lifecycle;
pub mod middleware;
pub mod registry;
pub mod request;
pub mod runtime;
pub mod stats;

pub use config::{EndpointOptions, ServiceConfig};
pub use discovery::{DiscoveryResponder, DiscoverySource};
pub use endpoint::Endpoint;
pub use error::{DrainFailure, DrainReport, LifecycleError, RegistrationError};
pub use group::Group;
pub use guard::ServiceGuard;
pub use handler::{handler_fn, Handler, HandlerError, HandlerFn, ServiceError};
pub use lifecycle::ServiceState;
pub use middleware::{apply_middlewares, middleware_fn, Middleware, MiddlewareFn, Next, Response};
pub use request::{Request, RespondError};
pub use runtime::{add_service, Service};
pub use stats::{StatsLedger, StatsRecord};
