//! `micro` Core: subject naming, discovery wire documents, and the message envelope.

pub mod identity;
pub mod messages;
pub mod subject;
pub mod types;

pub use identity::{Metadata, ServiceIdentity};
pub use messages::{EndpointInfo, EndpointStats, PingInfo, ServiceInfo, ServiceStats};
pub use subject::{SubjectError, Verb, API_PREFIX, DEFAULT_QUEUE_GROUP};
pub use types::{Headers, Message, ERROR_CODE_HEADER, ERROR_HEADER, SUCCESS_CODE_HEADER};
