//! Engine-wide performance summary: the worker/perf rollup layer on top of
//! each arrow's [`jana2_topology::metrics::ArrowMetrics`].
//!
//! Grounded on `JWorkerMetrics.h`, which accumulates each worker's busy
//! time and event count separately from the per-arrow counters so the
//! supervisor can report both "events per second, engine-wide" and
//! "per-arrow throughput" from one rollup pass.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use jana2_topology::metrics::{ArrowMetrics, MetricsSnapshot};
use jana2_topology::Topology;

/// Per-worker busy/idle accounting, updated by the worker loop.
#[derive(Debug, Default)]
struct WorkerRecord {
    useful_time: Duration,
    retry_time: Duration,
    scheduler_visits: u64,
}

/// Accumulates per-worker busy time and owns the canonical, topology-wide
/// [`ArrowMetrics`] record for each arrow. Workers keep their own
/// thread-local `ArrowMetrics` while firing and periodically fold them
/// into this registry via [`Self::merge_arrow`], matching
/// `JWorkerMetrics`'s checkin-interval rollup.
pub struct PerfSummary {
    workers: Mutex<HashMap<usize, WorkerRecord>>,
    started_at: Mutex<Option<Instant>>,
    arrows: HashMap<String, ArrowMetrics>,
}

impl PerfSummary {
    /// An empty summary with one zeroed metrics record per arrow in
    /// `topology`.
    #[must_use]
    pub fn new(topology: &Topology) -> Self {
        let arrows = topology
            .arrows()
            .iter()
            .map(|a| (a.name().to_string(), ArrowMetrics::new()))
            .collect();
        Self {
            workers: Mutex::new(HashMap::new()),
            started_at: Mutex::new(None),
            arrows,
        }
    }

    /// Fold `delta` into the canonical record for `arrow_name` and clear
    /// `delta` (the worker-to-arrow metrics handoff: `delta` is one
    /// worker's thread-local record for a single checkin interval, and
    /// must not be re-folded into the canonical record on the next
    /// interval — whether that interval fires the same arrow again or a
    /// different one the scheduler reassigned the worker to).
    pub fn merge_arrow(&self, arrow_name: &str, delta: &ArrowMetrics) {
        if let Some(canonical) = self.arrows.get(arrow_name) {
            canonical.take(delta);
        } else {
            delta.clear();
        }
    }

    /// The canonical metrics record for one arrow, if it exists.
    #[must_use]
    pub fn arrow(&self, arrow_name: &str) -> Option<&ArrowMetrics> {
        self.arrows.get(arrow_name)
    }

    /// Marks the run's start time, if not already marked. Idempotent so
    /// multiple workers can call it race-free on startup.
    pub fn mark_started(&self) {
        let mut started = self.started_at.lock();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    /// Record one worker's useful (arrow-firing) and retry (backoff) time
    /// for a checkin interval.
    pub fn record_worker_interval(&self, worker_id: usize, useful: Duration, retry: Duration) {
        let mut workers = self.workers.lock();
        let record = workers.entry(worker_id).or_default();
        record.useful_time += useful;
        record.retry_time += retry;
        record.scheduler_visits += 1;
    }

    /// Total wall-clock time elapsed since [`Self::mark_started`], or
    /// `Duration::ZERO` if the run has not started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Sum of useful time across all workers.
    #[must_use]
    pub fn total_useful_time(&self) -> Duration {
        self.workers.lock().values().map(|w| w.useful_time).sum()
    }

    /// Number of worker threads that have reported at least one interval.
    #[must_use]
    pub fn active_worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Snapshot every tracked arrow into a name-keyed map, for a final or
    /// periodic report.
    #[must_use]
    pub fn arrow_snapshots(&self) -> HashMap<String, MetricsSnapshot> {
        self.arrows.iter().map(|(name, m)| (name.clone(), m.get())).collect()
    }

    /// Engine-wide throughput in events per second, computed from the
    /// sink arrows' total message counts over the elapsed wall time.
    #[must_use]
    pub fn events_per_second(&self, topology: &Topology) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let total: u64 = topology
            .sinks()
            .iter()
            .filter_map(|name| self.arrows.get(name))
            .map(ArrowMetrics::total_message_count)
            .sum();
        total as f64 / elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jana2_core::{Event, EventLevel};
    use jana2_pool::{Limit, Mailbox, Pool};
    use jana2_topology::arrow::{EmitStatus, SourceArrow};
    use jana2_topology::topology::{PortBinding, PortDirection, PortKind, TopologyBuilder};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn single_source_topology() -> Topology {
        let pool = Arc::new(Pool::new(1, 4, Limit::Strict, || Event::new(EventLevel::PhysicsEvent), |_: &mut Event| {}));
        let queue: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 4));
        let source = Arc::new(SourceArrow::new(
            "src",
            EventLevel::PhysicsEvent,
            pool,
            queue,
            4,
            0,
            Some(1),
            |_e: &Event| Ok(EmitStatus::Success),
        ));
        let mut builder = TopologyBuilder::new();
        builder
            .register(source, vec![PortBinding::new("out", PortDirection::Output, PortKind::Queue, "q")])
            .unwrap();
        builder.freeze().unwrap()
    }

    #[test]
    fn merge_arrow_accumulates_into_canonical_record() {
        let topology = single_source_topology();
        let summary = PerfSummary::new(&topology);
        let local = ArrowMetrics::new();
        local.record(jana2_topology::metrics::Status::KeepGoing, 5, 1, Duration::from_millis(1), Duration::ZERO);

        summary.merge_arrow("src", &local);
        assert_eq!(summary.arrow("src").unwrap().total_message_count(), 5);
    }

    #[test]
    fn merge_arrow_clears_the_delta_so_it_is_not_refolded() {
        let topology = single_source_topology();
        let summary = PerfSummary::new(&topology);
        let local = ArrowMetrics::new();
        local.record(jana2_topology::metrics::Status::KeepGoing, 5, 1, Duration::from_millis(1), Duration::ZERO);

        summary.merge_arrow("src", &local);
        // A second checkin interval that made no further progress must not
        // re-add the first interval's already-folded counts.
        summary.merge_arrow("src", &local);
        assert_eq!(summary.arrow("src").unwrap().total_message_count(), 5);
    }

    #[test]
    fn elapsed_is_zero_before_start_is_marked() {
        let topology = single_source_topology();
        let summary = PerfSummary::new(&topology);
        assert_eq!(summary.elapsed(), Duration::ZERO);
        summary.mark_started();
        thread::sleep(Duration::from_millis(1));
        assert!(summary.elapsed() > Duration::ZERO);
    }

    #[test]
    fn worker_interval_tracks_useful_time_per_worker() {
        let topology = single_source_topology();
        let summary = PerfSummary::new(&topology);
        summary.record_worker_interval(0, Duration::from_millis(10), Duration::from_millis(2));
        summary.record_worker_interval(1, Duration::from_millis(7), Duration::from_millis(1));
        assert_eq!(summary.active_worker_count(), 2);
        assert_eq!(summary.total_useful_time(), Duration::from_millis(17));
    }
}
