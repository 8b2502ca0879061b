//! Per-endpoint request statistics.
//!
//! Each endpoint owns one [`StatsRecord`]. All records of a service share the
//! ledger's `frozen` flag: once the service stops, every update is ignored
//! and snapshots keep returning the final values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use micro_core::EndpointStats;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Counters {
    num_requests: u64,
    num_errors: u64,
    last_error: String,
    processing_time: Duration,
    data: Option<serde_json::Value>,
}

/// Mutable statistics of one endpoint.
#[derive(Debug)]
pub struct StatsRecord {
    name: String,
    subject: String,
    queue_group: String,
    counters: Mutex<Counters>,
    frozen: Arc<AtomicBool>,
}

impl StatsRecord {
    /// Counts a request as received. Returns `false` (and counts nothing)
    /// once the ledger is frozen.
    pub fn begin_request(&self) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.counters.lock().num_requests += 1;
        true
    }

    /// Records the handler's processing time and, on failure, the error text.
    pub fn complete_request(&self, elapsed: Duration, error: Option<&str>) {
        if self.is_frozen() {
            return;
        }
        let mut counters = self.counters.lock();
        counters.processing_time += elapsed;
        if let Some(error) = error {
            counters.num_errors += 1;
            error.clone_into(&mut counters.last_error);
        }
    }

    /// Replaces the endpoint-specific `data` field of the snapshot.
    pub fn set_data(&self, data: Option<serde_json::Value>) {
        self.counters.lock().data = data;
    }

    /// Zeroes the counters. `data` is kept. Does nothing once frozen.
    pub fn reset(&self) {
        if self.is_frozen() {
            return;
        }
        let mut counters = self.counters.lock();
        let data = counters.data.take();
        *counters = Counters {
            data,
            ..Counters::default()
        };
    }

    /// Copies the current values out.
    #[must_use]
    pub fn snapshot(&self) -> EndpointStats {
        let counters = self.counters.lock();
        let processing_time = duration_nanos(counters.processing_time);
        let average_processing_time = processing_time
            .checked_div(counters.num_requests)
            .unwrap_or(0);
        EndpointStats {
            name: self.name.clone(),
            subject: self.subject.clone(),
            queue_group: self.queue_group.clone(),
            num_requests: counters.num_requests,
            num_errors: counters.num_errors,
            last_error: counters.last_error.clone(),
            processing_time,
            average_processing_time,
            data: counters.data.clone(),
        }
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Factory for the records of one service, holding their shared freeze flag.
#[derive(Debug, Default)]
pub struct StatsLedger {
    frozen: Arc<AtomicBool>,
}

impl StatsLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zeroed record bound to this ledger.
    #[must_use]
    pub fn record(
        &self,
        name: impl Into<String>,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Arc<StatsRecord> {
        Arc::new(StatsRecord {
            name: name.into(),
            subject: subject.into(),
            queue_group: queue_group.into(),
            counters: Mutex::new(Counters::default()),
            frozen: Arc::clone(&self.frozen),
        })
    }

    /// Stops all further updates to every record.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}
