use std::sync::Arc;

use micro_core::{Metadata, API_PREFIX, DEFAULT_QUEUE_GROUP};

use super::middleware::Middleware;

/// Configuration of one service instance.
///
/// No `Default` impl: a service has no sensible default name or version.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Semantic version.
    pub version: String,
    pub description: Option<String>,
    pub metadata: Metadata,
    /// Queue group for endpoints and groups that do not name one.
    pub queue_group: String,
    /// Root token of the discovery subjects.
    pub api_prefix: String,
    /// Fixed instance id. A random 24-character hex id is generated when `None`.
    pub instance_id: Option<String>,
}

impl ServiceConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            metadata: Metadata::new(),
            queue_group: DEFAULT_QUEUE_GROUP.to_string(),
            api_prefix: API_PREFIX.to_string(),
            instance_id: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = queue_group.into();
        self
    }

    #[must_use]
    pub fn with_api_prefix(mut self, api_prefix: impl Into<String>) -> Self {
        self.api_prefix = api_prefix.into();
        self
    }

    #[must_use]
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }
}

/// Per-endpoint registration options.
#[derive(Clone, Default)]
pub struct EndpointOptions {
    /// Leaf subject segment. Defaults to the endpoint name.
    pub subject: Option<String>,
    /// Overrides the group's and the service's queue group.
    pub queue_group: Option<String>,
    pub metadata: Metadata,
    /// Wrapped around the handler at registration, first element outermost.
    pub middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for EndpointOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointOptions")
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .field("metadata", &self.metadata)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl EndpointOptions {
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Appends a middleware inside the ones added before it.
    #[must_use]
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }
}
