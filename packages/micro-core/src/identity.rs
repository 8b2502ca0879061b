use std::collections::BTreeMap;

use crate::subject::{validate_name, validate_version, SubjectError};

/// Free-form key/value metadata attached to services and endpoints.
///
/// `BTreeMap` keeps serialized documents in a deterministic key order.
pub type Metadata = BTreeMap<String, String>;

/// Identity of one running service instance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Service kind, shared by all instances of the same service.
    pub name: String,
    /// Semantic version of the service.
    pub version: String,
    /// Optional human-readable description.
    pub description: Option<String>,
    /// Service metadata.
    pub metadata: Metadata,
    /// Unique identifier of this instance.
    pub id: String,
}

impl ServiceIdentity {
    /// Builds an identity after validating the name and version.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError`] if `name` has characters outside
    /// `[A-Za-z0-9_-]` or `version` is not a semantic version.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: Option<String>,
        metadata: Metadata,
        id: impl Into<String>,
    ) -> Result<Self, SubjectError> {
        let name = name.into();
        let version = version.into();
        validate_name("service", &name)?;
        validate_version(&version)?;
        Ok(Self {
            name,
            version,
            description,
            metadata,
            id: id.into(),
        })
    }
}
