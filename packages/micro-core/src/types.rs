use std::collections::HashMap;

use bytes::Bytes;

/// Header map carried by every message.
pub type Headers = HashMap<String, String>;

/// Header carrying the human-readable description of an endpoint error.
pub const ERROR_HEADER: &str = "Nats-Service-Error";

/// Header carrying the code of an endpoint error.
pub const ERROR_CODE_HEADER: &str = "Nats-Service-Error-Code";

/// Header carrying an optional success code.
pub const SUCCESS_CODE_HEADER: &str = "Nats-Service-Success-Code";

/// One message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,
    /// Subject the receiver should reply to, if any.
    pub reply: Option<String>,
    /// Header key/value pairs. Empty when the publisher sent none.
    pub headers: Headers,
    /// Raw payload.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message with no reply subject and no headers.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Returns the `(code, description)` pair when this message is an
    /// endpoint error reply.
    ///
    /// The description header alone is enough to mark an error; a missing or
    /// malformed code header yields code `0`.
    #[must_use]
    pub fn service_error(&self) -> Option<(u16, &str)> {
        let description = self.headers.get(ERROR_HEADER)?;
        let code = self
            .headers
            .get(ERROR_CODE_HEADER)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        Some((code, description.as_str()))
    }
}
