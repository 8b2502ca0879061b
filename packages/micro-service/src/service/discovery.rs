//! Responder for the PING / INFO / STATS control subjects.
//!
//! Every instance subscribes all nine control subjects (three verbs times
//! broadcast, per-service and per-instance scope) without a queue group, so
//! a broadcast request is answered by every running instance.

use std::sync::{Arc, Weak};

use micro_core::messages::encode;
use micro_core::subject::control_subjects;
use micro_core::{Message, PingInfo, ServiceInfo, ServiceStats, Verb};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::error::DrainFailure;
use crate::transport::{Subscription, SubscriptionId, Transport, TransportError};

/// Source of the documents returned to discovery requests.
///
/// Each call must build a fresh snapshot.
pub trait DiscoverySource: Send + Sync + 'static {
    /// Identity document sent in reply to PING.
    fn ping(&self) -> PingInfo;
    /// Identity plus the registered endpoints, sent in reply to INFO.
    fn info(&self) -> ServiceInfo;
    /// Per-endpoint counters, sent in reply to STATS.
    fn stats(&self) -> ServiceStats;
}

struct ControlSubscription {
    subject: String,
    id: SubscriptionId,
}

/// Owns the control-subject subscriptions of one service instance.
#[derive(Default)]
pub struct DiscoveryResponder {
    subscriptions: Mutex<Vec<ControlSubscription>>,
}

impl DiscoveryResponder {
    /// Creates a responder with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes every control subject and spawns one reply loop per subject.
    ///
    /// The loops hold `source` weakly and exit when it is dropped or their
    /// subscription ends.
    ///
    /// # Errors
    ///
    /// Returns the failed subject and transport error. Subscriptions made
    /// before the failure are cancelled again.
    pub async fn install(
        &self,
        api_prefix: &str,
        name: &str,
        id: &str,
        source: Weak<dyn DiscoverySource>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), (String, TransportError)> {
        for verb in Verb::ALL {
            for subject in control_subjects(api_prefix, verb, name, id) {
                let subscription = match transport.subscribe(&subject, None).await {
                    Ok(subscription) => subscription,
                    Err(err) => {
                        for failure in self.uninstall(&transport).await.1 {
                            warn!(subject = %failure.subject, error = %failure.error, "rollback unsubscribe failed");
                        }
                        return Err((subject, err));
                    }
                };
                self.subscriptions.lock().push(ControlSubscription {
                    subject: subject.clone(),
                    id: subscription.id(),
                });
                trace!(%subject, "control subject subscribed");
                tokio::spawn(serve(
                    verb,
                    subscription,
                    source.clone(),
                    Arc::clone(&transport),
                ));
            }
        }
        Ok(())
    }

    /// Cancels every control subscription. Returns how many were cancelled
    /// and the ones that failed.
    pub async fn uninstall(&self, transport: &Arc<dyn Transport>) -> (usize, Vec<DrainFailure>) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let mut closed = 0;
        let mut failures = Vec::new();
        for ControlSubscription { subject, id } in subscriptions {
            match transport.unsubscribe(id).await {
                Ok(()) => closed += 1,
                Err(error) => failures.push(DrainFailure {
                    subject,
                    subscription: Some(id),
                    error,
                }),
            }
        }
        (closed, failures)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

async fn serve(
    verb: Verb,
    mut subscription: Subscription,
    source: Weak<dyn DiscoverySource>,
    transport: Arc<dyn Transport>,
) {
    while let Some(message) = subscription.next_message().await {
        let Some(reply) = message.reply else {
            trace!(subject = %message.subject, "discovery request without reply subject");
            continue;
        };
        let Some(source) = source.upgrade() else {
            break;
        };
        let payload = match verb {
            Verb::Ping => encode(&source.ping()),
            Verb::Info => encode(&source.info()),
            Verb::Stats => encode(&source.stats()),
        };
        drop(source);
        match payload {
            Ok(payload) => {
                if let Err(err) = transport.publish(Message::new(reply, payload)).await {
                    warn!(%verb, error = %err, "failed to publish discovery reply");
                }
            }
            Err(err) => warn!(%verb, error = %err, "failed to encode discovery reply"),
        }
    }
    debug!(subject = %subscription.subject(), "control subscription closed");
}
