use std::sync::Arc;

use micro_core::subject::{validate_prefix, validate_queue_group, SEPARATOR};

use super::config::EndpointOptions;
use super::endpoint::Endpoint;
use super::error::RegistrationError;
use super::handler::Handler;
use super::runtime::Service;

/// A subject prefix shared by a set of endpoints.
///
/// Groups are pure naming: they own no subscriptions and are not listed in
/// discovery documents. Nested groups concatenate their prefixes.
#[derive(Debug, Clone)]
pub struct Group {
    service: Service,
    prefixes: Vec<String>,
    queue_group: Option<String>,
}

impl Group {
    pub(crate) fn new(
        service: Service,
        mut prefixes: Vec<String>,
        prefix: &str,
        queue_group: Option<String>,
    ) -> Result<Self, RegistrationError> {
        service.ensure_not_stopped()?;
        validate_prefix(prefix)?;
        if let Some(queue_group) = &queue_group {
            validate_queue_group(queue_group)?;
        }
        prefixes.push(prefix.to_string());
        Ok(Self {
            service,
            prefixes,
            queue_group,
        })
    }

    /// The full prefix, e.g. `api.v1`.
    #[must_use]
    pub fn prefix(&self) -> String {
        self.prefixes.join(&SEPARATOR.to_string())
    }

    /// Default queue group of this group's endpoints, if one was set here or
    /// inherited from a parent group.
    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Creates a nested group. The child inherits this group's queue group.
    ///
    /// # Errors
    ///
    /// See [`Service::add_group`].
    pub fn add_group(&self, prefix: &str) -> Result<Group, RegistrationError> {
        Group::new(
            self.service.clone(),
            self.prefixes.clone(),
            prefix,
            self.queue_group.clone(),
        )
    }

    /// Creates a nested group with its own default queue group.
    ///
    /// # Errors
    ///
    /// See [`Service::add_group`].
    pub fn add_group_with_queue_group(
        &self,
        prefix: &str,
        queue_group: &str,
    ) -> Result<Group, RegistrationError> {
        Group::new(
            self.service.clone(),
            self.prefixes.clone(),
            prefix,
            Some(queue_group.to_string()),
        )
    }

    /// Registers an endpoint whose subject is this group's prefix followed
    /// by the endpoint subject (or name).
    ///
    /// # Errors
    ///
    /// See [`Service::add_endpoint`].
    pub async fn add_endpoint(
        &self,
        name: &str,
        handler: impl Handler,
        options: EndpointOptions,
    ) -> Result<Endpoint, RegistrationError> {
        self.service
            .register_endpoint(
                &self.prefixes,
                self.queue_group.as_deref(),
                name,
                Arc::new(handler),
                options,
            )
            .await
    }
}
