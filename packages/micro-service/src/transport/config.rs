//! Configuration for the in-memory transport.

/// Settings for [`super::InMemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryTransportConfig {
    /// Bounded channel capacity per subscription. Messages published to a
    /// full subscription are dropped (at-most-once delivery).
    pub subscription_capacity: usize,
    /// Prefix of generated reply subjects.
    pub inbox_prefix: String,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            subscription_capacity: 512,
            inbox_prefix: "_INBOX".to_string(),
        }
    }
}
