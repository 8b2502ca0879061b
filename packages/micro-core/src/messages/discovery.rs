//! Discovery response documents for the PING, INFO and STATS verbs.
//!
//! Field names match the wire protocol exactly. Optional fields are omitted
//! when absent rather than serialized as `null`, and unknown fields are
//! ignored on decode so newer peers remain readable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Metadata, ServiceIdentity};

/// `type` of a PING response.
pub const PING_RESPONSE_TYPE: &str = "io.nats.micro.v1.ping_response";
/// `type` of an INFO response.
pub const INFO_RESPONSE_TYPE: &str = "io.nats.micro.v1.info_response";
/// `type` of a STATS response.
pub const STATS_RESPONSE_TYPE: &str = "io.nats.micro.v1.stats_response";

fn ping_type() -> String {
    PING_RESPONSE_TYPE.to_string()
}

fn info_type() -> String {
    INFO_RESPONSE_TYPE.to_string()
}

fn stats_type() -> String {
    STATS_RESPONSE_TYPE.to_string()
}

// ---------------------------------------------------------------------------
// PING
// ---------------------------------------------------------------------------

/// Response to a PING query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    /// Service name.
    pub name: String,
    /// Instance id, unique per running instance.
    pub id: String,
    /// Semantic version of the service.
    pub version: String,
    /// Service-level metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Wire `type` discriminator, [`PING_RESPONSE_TYPE`].
    #[serde(rename = "type", default = "ping_type")]
    pub kind: String,
}

impl PingInfo {
    /// Builds the PING document of `identity`.
    #[must_use]
    pub fn new(identity: &ServiceIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            id: identity.id.clone(),
            version: identity.version.clone(),
            metadata: identity.metadata.clone(),
            kind: ping_type(),
        }
    }
}

// ---------------------------------------------------------------------------
// INFO
// ---------------------------------------------------------------------------

/// Static description of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint name, unique within the service.
    pub name: String,
    /// Fully-qualified subject the endpoint listens on.
    pub subject: String,
    /// Queue group shared by all instances of the endpoint.
    pub queue_group: String,
    /// Endpoint-level metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Response to an INFO query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub id: String,
    pub version: String,
    /// Omitted from the document when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Registered endpoints, in registration order.
    #[serde(default)]
    pub endpoints: Vec<EndpointInfo>,
    #[serde(rename = "type", default = "info_type")]
    pub kind: String,
}

impl ServiceInfo {
    /// Builds the INFO document of `identity` listing `endpoints`.
    #[must_use]
    pub fn new(identity: &ServiceIdentity, endpoints: Vec<EndpointInfo>) -> Self {
        Self {
            name: identity.name.clone(),
            id: identity.id.clone(),
            version: identity.version.clone(),
            description: identity.description.clone(),
            metadata: identity.metadata.clone(),
            endpoints,
            kind: info_type(),
        }
    }
}

// ---------------------------------------------------------------------------
// STATS
// ---------------------------------------------------------------------------

/// Point-in-time statistics of one endpoint.
///
/// Processing times are expressed in nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub name: String,
    pub subject: String,
    pub queue_group: String,
    /// Requests received since start or the last reset.
    pub num_requests: u64,
    /// Requests whose handler failed.
    pub num_errors: u64,
    /// Message of the most recent failure, empty if none.
    #[serde(default)]
    pub last_error: String,
    /// Total handler time in nanoseconds.
    pub processing_time: u64,
    /// `processing_time / num_requests`, 0 before the first request.
    pub average_processing_time: u64,
    /// Endpoint-specific payload set by the application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl EndpointStats {
    /// Total processing time as a [`Duration`].
    #[must_use]
    pub fn processing_time(&self) -> Duration {
        Duration::from_nanos(self.processing_time)
    }

    /// Average processing time as a [`Duration`].
    #[must_use]
    pub fn average_processing_time(&self) -> Duration {
        Duration::from_nanos(self.average_processing_time)
    }
}

/// Response to a STATS query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub name: String,
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// When the service was started, RFC 3339.
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub endpoints: Vec<EndpointStats>,
    #[serde(rename = "type", default = "stats_type")]
    pub kind: String,
}

impl ServiceStats {
    /// Builds the STATS document of `identity` with the given start time.
    #[must_use]
    pub fn new(
        identity: &ServiceIdentity,
        started: DateTime<Utc>,
        endpoints: Vec<EndpointStats>,
    ) -> Self {
        Self {
            name: identity.name.clone(),
            id: identity.id.clone(),
            version: identity.version.clone(),
            metadata: identity.metadata.clone(),
            started,
            endpoints,
            kind: stats_type(),
        }
    }
}
