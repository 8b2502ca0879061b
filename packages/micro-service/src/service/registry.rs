use micro_core::{EndpointInfo, EndpointStats};
use parking_lot::RwLock;

use super::endpoint::Endpoint;

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

/// Registered endpoints of one service, in registration order.
///
/// Subjects are unique. Discovery replies copy from the registry under the
/// read lock, so a snapshot never shows a half-registered endpoint.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl EndpointRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if an endpoint already listens on `subject`.
    #[must_use]
    pub fn contains_subject(&self, subject: &str) -> bool {
        self.endpoints
            .read()
            .iter()
            .any(|endpoint| endpoint.subject() == subject)
    }

    /// Appends `endpoint`. Returns `false` (and stores nothing) if its
    /// subject is already taken.
    pub fn insert(&self, endpoint: Endpoint) -> bool {
        let mut endpoints = self.endpoints.write();
        if endpoints.iter().any(|e| e.subject() == endpoint.subject()) {
            return false;
        }
        endpoints.push(endpoint);
        true
    }

    /// Clones the endpoint handles, e.g. to subscribe them without holding the lock.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    /// First endpoint registered under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.endpoints
            .read()
            .iter()
            .find(|endpoint| endpoint.name() == name)
            .cloned()
    }

    /// INFO entries of every endpoint, in registration order.
    #[must_use]
    pub fn infos(&self) -> Vec<EndpointInfo> {
        self.endpoints.read().iter().map(Endpoint::info).collect()
    }

    /// STATS entries of every endpoint, taken under one read lock.
    #[must_use]
    pub fn stats(&self) -> Vec<EndpointStats> {
        self.endpoints.read().iter().map(Endpoint::stats).collect()
    }

    /// Zeroes every endpoint's counters. Frozen records are left as they are.
    pub fn reset_stats(&self) {
        for endpoint in self.endpoints.read().iter() {
            endpoint.reset_stats();
        }
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// `true` when no endpoint is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}
