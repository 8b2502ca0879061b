//! Wire documents exchanged on control subjects.
//!
//! All documents are UTF-8 JSON. Encoding is compact (no whitespace) and
//! decoding follows the open-world rule: unknown fields are ignored.

pub mod discovery;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use discovery::{
    EndpointInfo, EndpointStats, PingInfo, ServiceInfo, ServiceStats, INFO_RESPONSE_TYPE,
    PING_RESPONSE_TYPE, STATS_RESPONSE_TYPE,
};

/// Encodes a discovery document as compact JSON.
///
/// # Errors
///
/// Returns a `serde_json` error if the document cannot be serialized.
pub fn encode<T: Serialize>(document: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(document)
}

/// Decodes a discovery document from JSON bytes.
///
/// # Errors
///
/// Returns a `serde_json` error if the bytes are not a valid document.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
