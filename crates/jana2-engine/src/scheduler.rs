//! Scheduler: assigns ready arrows to idle workers (C6).
//!
//! Grounded on spec.md §4.6. The scheduler owns no ports or events itself
//! — it only tracks each arrow's lifecycle state and, given a worker's
//! previous result, decides which arrow (if any) that worker should fire
//! next.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use jana2_topology::{Arrow, ArrowFireResult};
use jana2_topology::Topology;

/// Lifecycle state of one arrow, tracked by the scheduler independently
/// of the arrow's own internal state (e.g. a source's `finished` flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrowState {
    /// `initialize()` has not yet run.
    Uninitialized,
    /// Eligible to be scheduled.
    Active,
    /// Temporarily excluded from scheduling (not currently used by the
    /// core engine; reserved for a future per-arrow pause facility).
    Paused,
    /// `finalize()` has run; never scheduled again.
    Finalized,
}

struct ArrowRecord {
    arrow: Arc<dyn Arrow>,
    state: ArrowState,
}

/// Assigns ready arrows to idle workers and tracks termination.
pub struct Scheduler {
    topology: Arc<Topology>,
    records: Mutex<HashMap<String, ArrowRecord>>,
    // Priority-class round-robin cursor: remembers where the last scan
    // stopped so consecutive calls rotate through arrows of equal
    // priority rather than always favoring the first one in the list.
    cursor: Mutex<usize>,
}

impl Scheduler {
    /// Build a scheduler over `topology`, with every arrow starting
    /// `Uninitialized`.
    #[must_use]
    pub fn new(topology: Arc<Topology>) -> Self {
        let mut records = HashMap::new();
        for arrow in topology.arrows() {
            records.insert(
                arrow.name().to_string(),
                ArrowRecord {
                    arrow: arrow.clone(),
                    state: ArrowState::Uninitialized,
                },
            );
        }
        Self {
            topology,
            records: Mutex::new(records),
            cursor: Mutex::new(0),
        }
    }

    /// Current lifecycle state of `arrow_name`, if it exists.
    #[must_use]
    pub fn arrow_state(&self, arrow_name: &str) -> Option<ArrowState> {
        self.records.lock().get(arrow_name).map(|r| r.state)
    }

    /// Decide the next arrow `worker_id` should fire.
    ///
    /// `previous` is `None` on a worker's very first call, otherwise the
    /// arrow it just fired along with the result. Returns `None` if the
    /// topology is inactive or nothing is currently ready — the caller
    /// (the worker loop) is expected to sleep for `checkin_time` and call
    /// again.
    pub fn next_assignment(
        &self,
        worker_id: usize,
        previous: Option<(&Arc<dyn Arrow>, ArrowFireResult)>,
    ) -> Option<Arc<dyn Arrow>> {
        if let Some((arrow, result)) = previous {
            self.handle_previous_result(arrow, result);
        }

        if !self.topology.is_active() {
            self.maybe_finalize_all();
            return None;
        }

        if self.check_termination() {
            return None;
        }

        self.pick_ready_arrow(worker_id)
    }

    fn handle_previous_result(&self, arrow: &Arc<dyn Arrow>, result: ArrowFireResult) {
        if result != ArrowFireResult::Finished {
            return;
        }
        self.finalize_one(arrow.name());
    }

    fn finalize_one(&self, name: &str) {
        let should_finalize = {
            let mut records = self.records.lock();
            match records.get_mut(name) {
                Some(record) if record.state != ArrowState::Finalized => {
                    record.state = ArrowState::Finalized;
                    true
                }
                _ => false,
            }
        };
        if !should_finalize {
            return;
        }
        if let Some(arrow) = self.topology.arrow(name) {
            if let Err(e) = arrow.finalize() {
                warn!(arrow = name, error = %e, "arrow finalize failed");
            } else {
                debug!(arrow = name, "arrow finalized");
            }
        }
    }

    /// Checks whether every source has finished and every queue has
    /// drained; if so, deactivates the topology and finalizes every arrow
    /// in reverse topological order (sinks first). Returns whether the
    /// topology is now inactive.
    fn check_termination(&self) -> bool {
        if !self.topology.all_sources_finished() {
            return false;
        }
        let any_pending = self
            .topology
            .arrows()
            .iter()
            .any(|a| !a.is_source() && a.has_pending_input());
        if any_pending {
            return false;
        }

        self.topology.deactivate();
        info!("topology drained: all sources finished and all queues empty");
        self.maybe_finalize_all();
        true
    }

    fn maybe_finalize_all(&self) {
        for name in self.topology.finalize_order() {
            self.finalize_one(name);
        }
    }

    fn pick_ready_arrow(&self, worker_id: usize) -> Option<Arc<dyn Arrow>> {
        let arrows = self.topology.arrows();
        if arrows.is_empty() {
            return None;
        }

        // Priority classes, per spec.md §4.4: sinks drain first, then
        // everything else ordered by upstream queue depth (longer first).
        let mut candidates: Vec<&Arc<dyn Arrow>> = arrows
            .iter()
            .filter(|a| self.is_schedulable(a))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| {
            let class_a = priority_class(*a);
            let class_b = priority_class(*b);
            class_a.cmp(&class_b).then_with(|| b.queue_depth().cmp(&a.queue_depth()))
        });

        // Round-robin within the winning priority class so that repeated
        // calls don't starve later arrows tied on priority.
        let top_class = priority_class(candidates[0]);
        let tied: Vec<&Arc<dyn Arrow>> = candidates
            .iter()
            .take_while(|a| priority_class(*a) == top_class)
            .copied()
            .collect();

        let mut cursor = self.cursor.lock();
        let idx = (*cursor + worker_id) % tied.len();
        *cursor = (*cursor + 1) % tied.len();
        let chosen = tied[idx].clone();

        self.maybe_initialize(&chosen);
        Some(chosen)
    }

    fn is_schedulable(&self, arrow: &Arc<dyn Arrow>) -> bool {
        let records = self.records.lock();
        let Some(record) = records.get(arrow.name()) else {
            return false;
        };
        if record.state == ArrowState::Finalized || record.state == ArrowState::Paused {
            return false;
        }
        arrow.is_source() || arrow.has_pending_input()
    }

    fn maybe_initialize(&self, arrow: &Arc<dyn Arrow>) {
        let needs_init = {
            let mut records = self.records.lock();
            match records.get_mut(arrow.name()) {
                Some(record) if record.state == ArrowState::Uninitialized => {
                    record.state = ArrowState::Active;
                    true
                }
                _ => false,
            }
        };
        if needs_init {
            if let Err(e) = arrow.initialize() {
                warn!(arrow = arrow.name(), error = %e, "arrow initialize failed");
            }
        }
    }
}

fn priority_class(arrow: &Arc<dyn Arrow>) -> u8 {
    if arrow.is_sink() {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jana2_core::{Event, EventLevel};
    use jana2_pool::{Limit, Mailbox, Pool};
    use jana2_topology::arrow::{EmitStatus, Processor, SinkArrow, SourceArrow};
    use jana2_topology::metrics::ArrowMetrics;
    use jana2_topology::topology::{PortBinding, PortDirection, PortKind, TopologyBuilder};

    struct NullProcessor;
    impl Processor for NullProcessor {
        fn name(&self) -> &str {
            "null"
        }
        fn process(&self, _event: &Event) -> jana2_core::JanaResult<()> {
            Ok(())
        }
    }

    fn build_source_to_sink() -> (Arc<Topology>, Arc<dyn Arrow>, Arc<dyn Arrow>) {
        let pool = Arc::new(Pool::new(1, 8, Limit::Strict, || Event::new(EventLevel::PhysicsEvent), |_: &mut Event| {}));
        let queue: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 8));
        let source: Arc<dyn Arrow> = Arc::new(SourceArrow::new(
            "src",
            EventLevel::PhysicsEvent,
            pool.clone(),
            queue.clone(),
            8,
            0,
            Some(3),
            |_e: &Event| Ok(EmitStatus::Success),
        ));
        let sink: Arc<dyn Arrow> = Arc::new(SinkArrow::terminal("sink", queue.clone(), vec![Arc::new(NullProcessor)], pool.clone()));

        let mut builder = TopologyBuilder::new();
        builder
            .register(source.clone(), vec![PortBinding::new("out", PortDirection::Output, PortKind::Queue, "q")])
            .unwrap();
        builder
            .register(sink.clone(), vec![PortBinding::new("in", PortDirection::Input, PortKind::Queue, "q")])
            .unwrap();
        builder.tag_recycle_edge("sink", "src");
        let topology = Arc::new(builder.freeze().unwrap());
        (topology, source, sink)
    }

    #[test]
    fn source_is_scheduled_before_any_input_exists() {
        let (topology, source, _sink) = build_source_to_sink();
        let scheduler = Scheduler::new(topology);
        let assigned = scheduler.next_assignment(0, None).unwrap();
        assert_eq!(assigned.name(), source.name());
        assert_eq!(scheduler.arrow_state("src"), Some(ArrowState::Active));
    }

    #[test]
    fn sink_takes_priority_once_both_are_ready() {
        let (topology, source, _sink) = build_source_to_sink();
        let scheduler = Scheduler::new(topology);
        let metrics = ArrowMetrics::new();
        source.fire(0, &metrics).unwrap();

        let assigned = scheduler.next_assignment(0, None).unwrap();
        assert_eq!(assigned.name(), "sink");
    }

    #[test]
    fn finished_result_transitions_to_finalized_exactly_once() {
        let (topology, source, _sink) = build_source_to_sink();
        let scheduler = Scheduler::new(topology);
        let metrics = ArrowMetrics::new();
        // Drain the bounded source of its configured 3 events.
        loop {
            match source.fire(0, &metrics).unwrap() {
                ArrowFireResult::Finished => break,
                _ => continue,
            }
        }
        scheduler.next_assignment(0, Some((&source, ArrowFireResult::Finished)));
        assert_eq!(scheduler.arrow_state("src"), Some(ArrowState::Finalized));
        // Idempotent: a second Finished result must not finalize twice.
        scheduler.next_assignment(0, Some((&source, ArrowFireResult::Finished)));
        assert_eq!(scheduler.arrow_state("src"), Some(ArrowState::Finalized));
    }

    #[test]
    fn termination_detected_once_drained() {
        let (topology, source, sink) = build_source_to_sink();
        let scheduler = Scheduler::new(topology.clone());
        let metrics = ArrowMetrics::new();

        loop {
            match source.fire(0, &metrics).unwrap() {
                ArrowFireResult::Finished => break,
                _ => continue,
            }
        }
        for _ in 0..3 {
            sink.fire(0, &metrics).unwrap();
        }
        sink.fire(0, &metrics).unwrap(); // observes empty input, still Finished-eligible once source done

        assert!(topology.all_sources_finished());
        let assignment = scheduler.next_assignment(0, None);
        assert!(assignment.is_none());
        assert!(!topology.is_active());
    }
}
