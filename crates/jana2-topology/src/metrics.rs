//! Per-arrow metrics record (the metrics half of C4/C6).
//!
//! Each arrow owns one [`ArrowMetrics`], updated on every `fire` and merged
//! upward by the worker that owns the arrow for the duration of a checkin
//! interval. Kept as a single mutex-guarded record rather than a lock-free
//! ring buffer — contention here is dominated by the real work the arrow
//! does, not by metric writes.

use std::time::Duration;

use parking_lot::Mutex;

/// Outcome of the most recent `fire` (or `NotRunYet` before the first one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No `fire` has completed yet.
    NotRunYet,
    /// The arrow made progress and should be scheduled again immediately.
    KeepGoing,
    /// The arrow found nothing to do; back off before retrying.
    ComeBackLater,
    /// The arrow has permanently finished and should be finalized.
    Finished,
    /// `fire` returned an error.
    Error,
}

#[derive(Debug, Default)]
struct Inner {
    last_status: Status_,
    total_message_count: u64,
    last_message_count: u64,
    total_queue_visits: u64,
    last_queue_visits: u64,
    total_latency: Duration,
    last_latency: Duration,
    total_queue_latency: Duration,
    last_queue_latency: Duration,
}

// A Default-able newtype so `Inner` can derive Default without requiring
// `Status: Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status_(Status);
impl Default for Status_ {
    fn default() -> Self {
        Status_(Status::NotRunYet)
    }
}

/// A snapshot of everything [`ArrowMetrics::get`] returns at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub last_status: Status,
    pub total_message_count: u64,
    pub last_message_count: u64,
    pub total_queue_visits: u64,
    pub last_queue_visits: u64,
    pub total_latency: Duration,
    pub last_latency: Duration,
    pub total_queue_latency: Duration,
    pub last_queue_latency: Duration,
}

/// Mutex-guarded accumulator of one arrow's fire history.
#[derive(Debug, Default)]
pub struct ArrowMetrics {
    inner: Mutex<Inner>,
}

impl ArrowMetrics {
    /// A fresh, zeroed metrics record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every field to its zero value.
    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }

    /// Merge `delta` into this record, zeroing `delta` afterward
    /// (destructive, matching the worker-to-arrow metrics handoff).
    pub fn take(&self, delta: &ArrowMetrics) {
        let mut mine = self.inner.lock();
        let mut theirs = delta.inner.lock();
        merge(&mut mine, &theirs);
        *theirs = Inner::default();
    }

    /// Merge `delta` into this record without clearing it
    /// (non-destructive, used for the topology-wide rollup).
    pub fn update(&self, delta: &ArrowMetrics) {
        let mut mine = self.inner.lock();
        let theirs = delta.inner.lock();
        merge(&mut mine, &theirs);
    }

    /// Mark the most recent status as `Finished` without touching counters.
    pub fn update_finished(&self) {
        self.inner.lock().last_status = Status_(Status::Finished);
    }

    /// Record the result of one `fire` call.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        status: Status,
        message_count_delta: u64,
        queue_visit_delta: u64,
        latency_delta: Duration,
        queue_latency_delta: Duration,
    ) {
        let mut inner = self.inner.lock();
        inner.last_status = Status_(status);
        if message_count_delta > 0 {
            inner.last_message_count = message_count_delta;
            inner.last_latency = latency_delta;
        }
        inner.total_message_count += message_count_delta;
        inner.total_queue_visits += queue_visit_delta;
        inner.last_queue_visits = queue_visit_delta;
        inner.total_latency += latency_delta;
        inner.total_queue_latency += queue_latency_delta;
        inner.last_queue_latency = queue_latency_delta;
    }

    /// The status recorded by the most recent `record`/`update_finished` call.
    #[must_use]
    pub fn last_status(&self) -> Status {
        self.inner.lock().last_status.0
    }

    /// Total messages (events) processed across this record's lifetime.
    #[must_use]
    pub fn total_message_count(&self) -> u64 {
        self.inner.lock().total_message_count
    }

    /// A full snapshot of the current counters.
    #[must_use]
    pub fn get(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            last_status: inner.last_status.0,
            total_message_count: inner.total_message_count,
            last_message_count: inner.last_message_count,
            total_queue_visits: inner.total_queue_visits,
            last_queue_visits: inner.last_queue_visits,
            total_latency: inner.total_latency,
            last_latency: inner.last_latency,
            total_queue_latency: inner.total_queue_latency,
            last_queue_latency: inner.last_queue_latency,
        }
    }
}

fn merge(mine: &mut Inner, theirs: &Inner) {
    if theirs.last_message_count != 0 {
        mine.last_message_count = theirs.last_message_count;
        mine.last_latency = theirs.last_latency;
    }
    mine.last_status = theirs.last_status;
    mine.total_message_count += theirs.total_message_count;
    mine.total_queue_visits += theirs.total_queue_visits;
    mine.last_queue_visits = theirs.last_queue_visits;
    mine.total_latency += theirs.total_latency;
    mine.total_queue_latency += theirs.total_queue_latency;
    mine.last_queue_latency = theirs.last_queue_latency;
}
