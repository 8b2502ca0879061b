//! The service instance: identity, endpoint registration and lifecycle.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use micro_core::subject::{endpoint_subject, validate_name, validate_prefix, validate_queue_group};
use micro_core::{PingInfo, ServiceIdentity, ServiceInfo, ServiceStats};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::config::{EndpointOptions, ServiceConfig};
use super::discovery::{DiscoveryResponder, DiscoverySource};
use super::endpoint::Endpoint;
use super::error::{DrainReport, LifecycleError, RegistrationError};
use super::group::Group;
use super::handler::Handler;
use super::lifecycle::{LifecycleController, ServiceState};
use super::middleware::apply_middlewares;
use super::registry::EndpointRegistry;
use super::stats::StatsLedger;
use crate::transport::Transport;

pub(crate) struct ServiceInner {
    identity: ServiceIdentity,
    api_prefix: String,
    queue_group: String,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<LifecycleController>,
    registry: EndpointRegistry,
    ledger: StatsLedger,
    discovery: DiscoveryResponder,
    // Serializes registration against start/stop. Held across subscribe calls.
    registration: tokio::sync::Mutex<()>,
    created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl DiscoverySource for ServiceInner {
    fn ping(&self) -> PingInfo {
        PingInfo::new(&self.identity)
    }

    fn info(&self) -> ServiceInfo {
        ServiceInfo::new(&self.identity, self.registry.infos())
    }

    fn stats(&self) -> ServiceStats {
        let started = self.started_at.read().unwrap_or(self.created_at);
        ServiceStats::new(&self.identity, started, self.registry.stats())
    }
}

/// Creates a service bound to `transport`. The service starts in `Created`.
///
/// # Errors
///
/// See [`Service::new`].
pub fn add_service(
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
) -> Result<Service, RegistrationError> {
    Service::new(transport, config)
}

/// One running (or not yet started) service instance. Cheap to clone; all
/// clones refer to the same instance.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.identity.name)
            .field("id", &self.inner.identity.id)
            .field("version", &self.inner.identity.version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Validates `config` and assigns the instance id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Invalid`] when the name, version, queue
    /// group, API prefix or instance id is malformed.
    pub fn new(transport: Arc<dyn Transport>, config: ServiceConfig) -> Result<Self, RegistrationError> {
        validate_prefix(&config.api_prefix)?;
        validate_queue_group(&config.queue_group)?;
        let id = config.instance_id.unwrap_or_else(generate_instance_id);
        validate_prefix(&id)?;
        let identity = ServiceIdentity::new(
            config.name,
            config.version,
            config.description,
            config.metadata,
            id,
        )?;
        debug!(service = %identity.name, id = %identity.id, "service created");

        Ok(Self {
            inner: Arc::new(ServiceInner {
                identity,
                api_prefix: config.api_prefix,
                queue_group: config.queue_group,
                transport,
                lifecycle: Arc::new(LifecycleController::new()),
                registry: EndpointRegistry::new(),
                ledger: StatsLedger::new(),
                discovery: DiscoveryResponder::new(),
                registration: tokio::sync::Mutex::new(()),
                created_at: Utc::now(),
                started_at: RwLock::new(None),
            }),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &ServiceIdentity {
        &self.inner.identity
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.identity.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.identity.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.identity.version
    }

    #[must_use]
    pub fn api_prefix(&self) -> &str {
        &self.inner.api_prefix
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.inner.lifecycle.state()
    }

    /// `true` once `stop()` has run.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.state() == ServiceState::Stopped
    }

    /// When `start()` succeeded, if it has.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.started_at.read()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers an endpoint directly under the service (no group prefix).
    ///
    /// In `Created` the endpoint is subscribed by `start()`; in `Started` it
    /// is subscribed before this call returns.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Invalid`] for a malformed name, subject or queue group
    /// - [`RegistrationError::DuplicateSubject`] if the subject is taken
    /// - [`RegistrationError::Lifecycle`] after `stop()`
    /// - [`RegistrationError::Transport`] if subscribing failed
    pub async fn add_endpoint(
        &self,
        name: &str,
        handler: impl Handler,
        options: EndpointOptions,
    ) -> Result<Endpoint, RegistrationError> {
        self.register_endpoint(&[], None, name, Arc::new(handler), options)
            .await
    }

    /// Creates a group whose prefix is prepended to its endpoints' subjects.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Invalid`] for a malformed prefix and
    /// [`RegistrationError::Lifecycle`] after `stop()`.
    pub fn add_group(&self, prefix: &str) -> Result<Group, RegistrationError> {
        Group::new(self.clone(), Vec::new(), prefix, None)
    }

    /// Like [`Service::add_group`], with a default queue group for the
    /// group's endpoints.
    ///
    /// # Errors
    ///
    /// See [`Service::add_group`]; the queue group is validated too.
    pub fn add_group_with_queue_group(
        &self,
        prefix: &str,
        queue_group: &str,
    ) -> Result<Group, RegistrationError> {
        Group::new(self.clone(), Vec::new(), prefix, Some(queue_group.to_string()))
    }

    pub(crate) fn ensure_not_stopped(&self) -> Result<(), LifecycleError> {
        if self.stopped() {
            Err(LifecycleError::Stopped)
        } else {
            Ok(())
        }
    }

    pub(crate) async fn register_endpoint(
        &self,
        prefixes: &[String],
        group_queue_group: Option<&str>,
        name: &str,
        handler: Arc<dyn Handler>,
        options: EndpointOptions,
    ) -> Result<Endpoint, RegistrationError> {
        validate_name("endpoint", name)?;
        let leaf = options.subject.as_deref().unwrap_or(name);
        let subject = endpoint_subject(prefixes, leaf)?;
        let queue_group = options
            .queue_group
            .clone()
            .or_else(|| group_queue_group.map(str::to_string))
            .unwrap_or_else(|| self.inner.queue_group.clone());
        validate_queue_group(&queue_group)?;

        let _registration = self.inner.registration.lock().await;
        let state = self.inner.lifecycle.state();
        if state == ServiceState::Stopped {
            return Err(LifecycleError::Stopped.into());
        }
        if self.inner.registry.contains_subject(&subject) {
            return Err(RegistrationError::DuplicateSubject { subject });
        }

        let record = self.inner.ledger.record(name, &subject, &queue_group);
        let endpoint = Endpoint::new(
            name.to_string(),
            subject,
            queue_group,
            options.metadata,
            apply_middlewares(handler, options.middlewares),
            record,
        );
        if state == ServiceState::Started {
            endpoint
                .subscribe(
                    Arc::clone(&self.inner.transport),
                    Arc::clone(&self.inner.lifecycle),
                )
                .await?;
        }
        let inserted = self.inner.registry.insert(endpoint.clone());
        debug_assert!(inserted, "subject checked under the registration lock");

        info!(
            service = %self.inner.identity.name,
            endpoint = %endpoint.name(),
            subject = %endpoint.subject(),
            queue_group = %endpoint.queue_group(),
            "endpoint registered"
        );
        Ok(endpoint)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Subscribes the discovery subjects and every registered endpoint.
    ///
    /// On failure every subscription made so far is cancelled and the
    /// service stays in `Created`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::AlreadyStarted`] or [`LifecycleError::Stopped`] when
    /// not in `Created`, and [`LifecycleError::Subscribe`] when the transport
    /// refused a subscription.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let _registration = self.inner.registration.lock().await;
        match self.inner.lifecycle.state() {
            ServiceState::Created => {}
            ServiceState::Started => return Err(LifecycleError::AlreadyStarted),
            ServiceState::Stopped => return Err(LifecycleError::Stopped),
        }

        let identity = &self.inner.identity;
        let weak_inner: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let discovery_source: Weak<dyn DiscoverySource> = weak_inner;
        if let Err((subject, source)) = self
            .inner
            .discovery
            .install(
                &self.inner.api_prefix,
                &identity.name,
                &identity.id,
                discovery_source,
                Arc::clone(&self.inner.transport),
            )
            .await
        {
            return Err(LifecycleError::Subscribe { subject, source });
        }

        for endpoint in self.inner.registry.endpoints() {
            let subscribed = endpoint
                .subscribe(
                    Arc::clone(&self.inner.transport),
                    Arc::clone(&self.inner.lifecycle),
                )
                .await;
            if let Err(source) = subscribed {
                let rollback = self.unsubscribe_all().await;
                debug!(closed = rollback.closed, "start rolled back");
                return Err(LifecycleError::Subscribe {
                    subject: endpoint.subject().to_string(),
                    source,
                });
            }
        }

        *self.inner.started_at.write() = Some(Utc::now());
        self.inner.lifecycle.mark_started();
        info!(
            service = %identity.name,
            id = %identity.id,
            version = %identity.version,
            endpoints = self.inner.registry.len(),
            "service started"
        );
        Ok(())
    }

    /// Cancels every subscription, freezes statistics and moves to `Stopped`.
    ///
    /// Calling it again is a no-op returning an empty report. Individual
    /// unsubscribe failures are logged and reported but never stop the
    /// transition.
    pub async fn stop(&self) -> DrainReport {
        let _registration = self.inner.registration.lock().await;
        if self.inner.lifecycle.state() == ServiceState::Stopped {
            return DrainReport::default();
        }

        let report = self.unsubscribe_all().await;
        self.inner.ledger.freeze();
        self.inner.lifecycle.mark_stopped();

        if report.is_clean() {
            info!(service = %self.inner.identity.name, closed = report.closed, "service stopped");
        } else {
            warn!(
                service = %self.inner.identity.name,
                closed = report.closed,
                failed = report.failures.len(),
                "service stopped with unsubscribe failures"
            );
        }
        report
    }

    async fn unsubscribe_all(&self) -> DrainReport {
        let mut report = DrainReport::default();
        for endpoint in self.inner.registry.endpoints() {
            match endpoint.unsubscribe(&self.inner.transport).await {
                Ok(Some(_)) => report.closed += 1,
                Ok(None) => {}
                Err(failure) => report.failures.push(failure),
            }
        }
        let (closed, failures) = self.inner.discovery.uninstall(&self.inner.transport).await;
        report.closed += closed;
        report.failures.extend(failures);
        for failure in &report.failures {
            warn!(subject = %failure.subject, error = %failure.error, "failed to unsubscribe");
        }
        report
    }

    /// Resolves once the service reaches `Stopped`.
    pub async fn wait_until_stopped(&self) {
        self.inner.lifecycle.wait_stopped().await;
    }

    /// Number of handler invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.lifecycle.in_flight_count()
    }

    /// Waits for running handlers to finish, up to `timeout`. Returns `false`
    /// on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        self.inner.lifecycle.wait_for_drain(timeout).await
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn ping(&self) -> PingInfo {
        self.inner.ping()
    }

    #[must_use]
    pub fn info(&self) -> ServiceInfo {
        self.inner.info()
    }

    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        self.inner.stats()
    }

    /// Zeroes the counters of every endpoint. Stopped services keep their
    /// final statistics.
    pub fn reset_stats(&self) {
        self.inner.registry.reset_stats();
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<Endpoint> {
        self.inner.registry.get(name)
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.registry.endpoints()
    }
}

fn generate_instance_id() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}
