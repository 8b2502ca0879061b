//! Errors returned synchronously to callers of the registration and
//! lifecycle operations.

use micro_core::SubjectError;

use crate::transport::{SubscriptionId, TransportError};

/// Misuse of the service state machine, or a failure while moving between states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("service already started")]
    AlreadyStarted,
    #[error("service is stopped")]
    Stopped,
    #[error("failed to subscribe {subject}: {source}")]
    Subscribe {
        subject: String,
        source: TransportError,
    },
}

/// Rejected `add_group` / `add_endpoint` call. No state is left behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Invalid(#[from] SubjectError),
    #[error("an endpoint is already registered on {subject}")]
    DuplicateSubject { subject: String },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to subscribe endpoint: {0}")]
    Transport(#[from] TransportError),
}

/// One subscription that could not be cancelled during `stop()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainFailure {
    pub subject: String,
    pub subscription: Option<SubscriptionId>,
    pub error: TransportError,
}

/// Outcome of `stop()`: how many subscriptions were cancelled and which failed.
///
/// Failures never prevent the service from reaching `Stopped`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub closed: usize,
    pub failures: Vec<DrainFailure>,
}

impl DrainReport {
    /// `true` when every subscription was cancelled.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
