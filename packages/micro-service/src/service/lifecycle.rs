//! Service lifecycle state and in-flight request tracking.
//!
//! State lives in an `ArcSwap` so discovery replies and handlers can read it
//! without locking. Transitions are serialized by the service's registration
//! lock, never by this type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle of a service: `Created -> Started -> Stopped`.
///
/// `Stopped` is terminal. A service may also go straight from `Created` to
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Endpoints may be registered but nothing is subscribed.
    Created,
    /// Discovery and endpoint subscriptions are live.
    Started,
    /// All subscriptions cancelled; statistics frozen.
    Stopped,
}

#[derive(Debug)]
pub struct LifecycleController {
    state: ArcSwap<ServiceState>,
    stopped_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl LifecycleController {
    /// Creates a controller in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(ServiceState::Created),
            stopped_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        **self.state.load()
    }

    pub fn mark_started(&self) {
        self.state.store(Arc::new(ServiceState::Started));
    }

    /// Moves to `Stopped` and wakes every `wait_stopped` caller.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(ServiceState::Stopped));
        // Stores the value even when no receiver is alive.
        self.stopped_signal.send_replace(true);
    }

    /// Resolves once the controller reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped_signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Counts one in-flight request until the returned guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until no handler is running, up to `timeout`.
    ///
    /// Returns `false` if handlers were still running when the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
