//! Scoped acquisition: a started service that is stopped when the scope ends.

use std::future::Future;
use std::ops::Deref;

use tracing::warn;

use super::error::{DrainReport, LifecycleError};
use super::runtime::Service;

/// A started service that stops when released or dropped.
///
/// Dropping without [`ServiceGuard::release`] (early return, panic,
/// cancelled future) spawns `stop()` on the current Tokio runtime.
#[derive(Debug)]
#[must_use = "dropping the guard stops the service"]
pub struct ServiceGuard {
    service: Option<Service>,
}

impl ServiceGuard {
    /// Stops the service and waits for the transition to finish.
    pub async fn release(mut self) -> DrainReport {
        match self.service.take() {
            Some(service) => service.stop().await,
            None => DrainReport::default(),
        }
    }
}

impl Deref for ServiceGuard {
    type Target = Service;

    fn deref(&self) -> &Service {
        // Only `release` and `drop` take the service, and both consume the guard.
        self.service
            .as_ref()
            .unwrap_or_else(|| unreachable!("service taken before guard was consumed"))
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        let Some(service) = self.service.take() else {
            return;
        };
        if service.stopped() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    service.stop().await;
                });
            }
            Err(_) => warn!(
                service = %service.name(),
                "service guard dropped outside a Tokio runtime; service not stopped"
            ),
        }
    }
}

impl Service {
    /// Starts the service and returns a guard that stops it.
    ///
    /// # Errors
    ///
    /// See [`Service::start`].
    pub async fn start_scoped(&self) -> Result<ServiceGuard, LifecycleError> {
        self.start().await?;
        Ok(ServiceGuard {
            service: Some(self.clone()),
        })
    }

    /// Runs `f` between `start()` and `stop()`. The service is stopped even
    /// if `f` panics or the returned future is dropped early.
    ///
    /// # Errors
    ///
    /// See [`Service::start`]. `f` is not called when starting fails.
    pub async fn run_scoped<F, Fut, T>(&self, f: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(Service) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.start_scoped().await?;
        let output = f(self.clone()).await;
        guard.release().await;
        Ok(output)
    }
}
