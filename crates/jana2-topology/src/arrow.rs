//! Arrow: the unit of pipeline work the scheduler assigns to a worker (C4).
//!
//! An arrow pulls reserved work from its input ports, runs user logic, and
//! pushes results to its output ports. Every variant below is grounded in
//! one of the original engine's arrow subclasses; the firing protocol
//! (reserve output, pull input, run user code, push output) is the same
//! shape throughout, differing only in which ports each variant has and
//! what it does with them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jana2_core::{Event, EventLevel};
use jana2_pool::{Mailbox, Pool, QueueStatus};
use parking_lot::Mutex;

use crate::metrics::{ArrowMetrics, Status};

/// Outcome of one `fire` call, per spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrowFireResult {
    /// Made progress; schedule this arrow again immediately.
    KeepGoing,
    /// Found nothing to do; the worker should back off.
    ComeBackLater,
    /// Permanently done; finalize and never schedule again.
    Finished,
}

/// A pipeline stage. Implementations are `Send + Sync` because, for
/// variants marked parallel-safe (`Map`), the scheduler may hand the same
/// arrow to multiple workers firing on different locations concurrently.
pub trait Arrow: Send + Sync {
    /// Stable name, used in logs, metrics, and topology summaries.
    fn name(&self) -> &str;

    /// Whether this arrow is a source (has no upstream input port).
    /// Used by the scheduler's termination check.
    fn is_source(&self) -> bool {
        false
    }

    /// Whether this arrow is a sink (runs user processors). Used by the
    /// scheduler's tie-breaking: sinks are preferred over sources so the
    /// topology drains before it fills further.
    fn is_sink(&self) -> bool {
        false
    }

    /// Approximate number of items waiting on this arrow's primary input
    /// queue, used only as a scheduler tie-breaker (prefer arrows with
    /// longer upstream queues). Zero for arrows with no input queue.
    fn queue_depth(&self) -> usize {
        0
    }

    /// Idempotent; called once by the worker that first fires this arrow.
    fn initialize(&self) -> jana2_core::JanaResult<()> {
        Ok(())
    }

    /// Called once by the last worker to observe this arrow's termination.
    fn finalize(&self) -> jana2_core::JanaResult<()> {
        Ok(())
    }

    /// Whether this arrow currently has pending input (used by the
    /// scheduler to decide readiness without actually firing).
    fn has_pending_input(&self) -> bool;

    /// Pull, process, and push. `location` selects which NUMA-affine
    /// partition of this arrow's ports to operate on.
    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult>;
}

/// Result of a user `Emit` callback on a [`SourceArrow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    /// The event was populated successfully.
    Success,
    /// Nothing available right now; try again later.
    FailureTryAgain,
    /// The source is permanently exhausted.
    FailureFinished,
}

type EmitFn = Box<dyn FnMut(&Event) -> jana2_core::JanaResult<EmitStatus> + Send>;

/// Source arrow: pulls fresh events from a pool, fills them via user
/// `Emit`, and pushes them onto its output queue. Grounded on
/// `JEventSourceArrow.cc`'s reserve-before-pull discipline and chunked
/// emission loop.
pub struct SourceArrow {
    name: String,
    level: EventLevel,
    pool: Arc<Pool<Event>>,
    output: Arc<Mailbox<Arc<Event>>>,
    chunksize: usize,
    nskip: u64,
    nevents: Option<u64>,
    raw_counter: AtomicU64,
    emitted_counter: AtomicU64,
    finished: AtomicBool,
    emit: Mutex<EmitFn>,
}

impl SourceArrow {
    /// Build a source arrow. `emit` is called once per event slot and is
    /// responsible for populating the event (inserting collections, etc.).
    #[must_use]
    pub fn new<F>(
        name: impl Into<String>,
        level: EventLevel,
        pool: Arc<Pool<Event>>,
        output: Arc<Mailbox<Arc<Event>>>,
        chunksize: usize,
        nskip: u64,
        nevents: Option<u64>,
        emit: F,
    ) -> Self
    where
        F: FnMut(&Event) -> jana2_core::JanaResult<EmitStatus> + Send + 'static,
    {
        Self {
            name: name.into(),
            level,
            pool,
            output,
            chunksize: chunksize.max(1),
            nskip,
            nevents,
            raw_counter: AtomicU64::new(0),
            emitted_counter: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            emit: Mutex::new(Box::new(emit)),
        }
    }

    /// Total events successfully emitted downstream (post-skip, pre-cap).
    #[must_use]
    pub fn emitted_count(&self) -> u64 {
        self.emitted_counter.load(Ordering::Acquire)
    }
}

impl Arrow for SourceArrow {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_source(&self) -> bool {
        true
    }

    fn has_pending_input(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult> {
        let start = Instant::now();
        if self.finished.load(Ordering::Acquire) {
            metrics.update_finished();
            return Ok(ArrowFireResult::Finished);
        }

        let (reserved, status) = self.output.reserve(1, self.chunksize, location);
        if reserved == 0 {
            let result = match status {
                QueueStatus::Finished => ArrowFireResult::Finished,
                _ => ArrowFireResult::ComeBackLater,
            };
            metrics.record(
                if result == ArrowFireResult::Finished { Status::Finished } else { Status::ComeBackLater },
                0,
                1,
                Duration::ZERO,
                start.elapsed(),
            );
            return Ok(result);
        }

        let mut batch = Vec::with_capacity(reserved);
        let mut stop_reason: Option<ArrowFireResult> = None;
        let mut emit = self.emit.lock();

        for _ in 0..reserved {
            let Some(mut fresh) = self.pool.get(location) else {
                // Strict pool exhausted: stop emitting this round, release
                // the unused reservation below via push_and_unreserve.
                stop_reason = Some(ArrowFireResult::ComeBackLater);
                break;
            };

            let raw = self.raw_counter.fetch_add(1, Ordering::AcqRel) + 1;
            let outcome = match (emit)(&fresh) {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A throwing Emit still needs the event returned, else
                    // the pool silently shrinks.
                    self.pool.put(fresh, location);
                    self.output.push_and_unreserve(batch, reserved, location);
                    return Err(e);
                }
            };

            match outcome {
                EmitStatus::FailureFinished => {
                    self.finished.store(true, Ordering::Release);
                    self.pool.put(fresh, location);
                    stop_reason = Some(ArrowFireResult::Finished);
                    break;
                }
                EmitStatus::FailureTryAgain => {
                    self.pool.put(fresh, location);
                    stop_reason = Some(ArrowFireResult::ComeBackLater);
                    break;
                }
                EmitStatus::Success => {
                    if raw <= self.nskip {
                        // Skipped: give the event straight back, don't emit.
                        self.pool.put(fresh, location);
                        continue;
                    }
                    if let Some(cap) = self.nevents {
                        if self.emitted_counter.load(Ordering::Acquire) >= cap {
                            self.finished.store(true, Ordering::Release);
                            self.pool.put(fresh, location);
                            stop_reason = Some(ArrowFireResult::Finished);
                            break;
                        }
                    }
                    self.emitted_counter.fetch_add(1, Ordering::AcqRel);
                    fresh.set_event_number(raw);
                    fresh.set_origin(self.name.clone());
                    debug_assert_eq!(fresh.level(), self.level);
                    batch.push(Arc::from(fresh));
                }
            }
        }

        let message_count = batch.len() as u64;
        self.output.push_and_unreserve(batch, reserved, location);

        let result = stop_reason.unwrap_or(ArrowFireResult::KeepGoing);
        let status = match result {
            ArrowFireResult::Finished => Status::Finished,
            ArrowFireResult::KeepGoing if message_count > 0 => Status::KeepGoing,
            _ => Status::ComeBackLater,
        };
        metrics.record(status, message_count, 1, start.elapsed(), Duration::ZERO);
        Ok(result)
    }
}

type ProcessFn = Box<dyn Fn(&Event) -> jana2_core::JanaResult<()> + Send + Sync>;

/// Map arrow: one input queue, one output queue at the same level, user
/// `Process` runs per event. Marked parallel-safe by the `Fn + Sync`
/// bound — the scheduler may fire the same `MapArrow` from several
/// workers concurrently, each against a different event.
pub struct MapArrow {
    name: String,
    input: Arc<Mailbox<Arc<Event>>>,
    output: Arc<Mailbox<Arc<Event>>>,
    process: ProcessFn,
}

impl MapArrow {
    /// Build a map arrow from input queue to output queue.
    #[must_use]
    pub fn new<F>(name: impl Into<String>, input: Arc<Mailbox<Arc<Event>>>, output: Arc<Mailbox<Arc<Event>>>, process: F) -> Self
    where
        F: Fn(&Event) -> jana2_core::JanaResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input,
            output,
            process: Box::new(process),
        }
    }
}

impl Arrow for MapArrow {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_pending_input(&self) -> bool {
        self.input.size() > 0
    }

    fn queue_depth(&self) -> usize {
        self.input.size()
    }

    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult> {
        let start = Instant::now();
        let (reserved, out_status) = self.output.reserve(1, 1, location);
        if reserved == 0 {
            let result = if out_status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
            metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
            return Ok(result);
        }

        let (mut items, in_status) = self.input.pop_and_reserve(1, 1, location);
        if items.is_empty() {
            self.output.push_and_unreserve(Vec::new(), reserved, location);
            let result = if in_status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
            metrics.record(
                if result == ArrowFireResult::Finished { Status::Finished } else { Status::ComeBackLater },
                0,
                1,
                Duration::ZERO,
                start.elapsed(),
            );
            return Ok(result);
        }

        let event = items.pop().expect("checked non-empty above");
        let process_start = Instant::now();
        (self.process)(&event)?;
        let latency = process_start.elapsed();

        self.output.push_and_unreserve(vec![event], reserved, location);
        metrics.record(Status::KeepGoing, 1, 1, latency, start.elapsed() - latency);
        Ok(ArrowFireResult::KeepGoing)
    }
}

/// Result of a user `Unfold` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfoldStatus {
    /// Produced a child; expect more children from the same parent.
    KeepGoing,
    /// Produced the last child for this parent; advance to the next parent.
    NextChildNextParent,
    /// Produced a child but will revisit this same parent again (equivalent
    /// to `KeepGoing`, kept distinct to mirror the original four-way enum).
    NextChildKeepParent,
    /// This parent yields no more children and no more parents will arrive.
    Finished,
}

type UnfoldFn = Box<dyn FnMut(&Event, &Event, u64) -> jana2_core::JanaResult<UnfoldStatus> + Send>;

struct UnfoldState {
    parent: Arc<Event>,
    iter: u64,
}

/// Unfold arrow: splits one parent event into many children at the next
/// finer level. Grounded on the `Unfold`/iterator contract in spec.md
/// §4.4; the parent is held across multiple `fire` calls until the user
/// callback signals it has no more children to produce.
pub struct UnfoldArrow {
    name: String,
    parent_level: EventLevel,
    child_level: EventLevel,
    parent_in: Arc<Mailbox<Arc<Event>>>,
    child_pool: Arc<Pool<Event>>,
    child_out: Arc<Mailbox<Arc<Event>>>,
    state: Mutex<Option<UnfoldState>>,
    unfold: Mutex<UnfoldFn>,
    upstream_finished: AtomicBool,
}

impl UnfoldArrow {
    /// Build an unfold arrow from a parent-level input queue and a
    /// child-level pool/output-queue pair.
    #[must_use]
    pub fn new<F>(
        name: impl Into<String>,
        parent_level: EventLevel,
        child_level: EventLevel,
        parent_in: Arc<Mailbox<Arc<Event>>>,
        child_pool: Arc<Pool<Event>>,
        child_out: Arc<Mailbox<Arc<Event>>>,
        unfold: F,
    ) -> Self
    where
        F: FnMut(&Event, &Event, u64) -> jana2_core::JanaResult<UnfoldStatus> + Send + 'static,
    {
        Self {
            name: name.into(),
            parent_level,
            child_level,
            parent_in,
            child_pool,
            child_out,
            state: Mutex::new(None),
            unfold: Mutex::new(Box::new(unfold)),
            upstream_finished: AtomicBool::new(false),
        }
    }
}

impl Arrow for UnfoldArrow {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_pending_input(&self) -> bool {
        self.state.lock().is_some() || self.parent_in.size() > 0
    }

    fn queue_depth(&self) -> usize {
        self.parent_in.size()
    }

    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult> {
        let start = Instant::now();

        let (reserved, out_status) = self.child_out.reserve(1, 1, location);
        if reserved == 0 {
            let result = if out_status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
            metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
            return Ok(result);
        }

        let mut state_guard = self.state.lock();
        if state_guard.is_none() {
            let (mut items, in_status) = self.parent_in.pop_and_reserve(1, 1, location);
            if items.is_empty() {
                self.child_out.push_and_unreserve(Vec::new(), reserved, location);
                if in_status == QueueStatus::Finished {
                    self.upstream_finished.store(true, Ordering::Release);
                    metrics.record(Status::Finished, 0, 1, Duration::ZERO, start.elapsed());
                    return Ok(ArrowFireResult::Finished);
                }
                metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
                return Ok(ArrowFireResult::ComeBackLater);
            }
            let parent = items.pop().expect("checked non-empty above");
            debug_assert_eq!(parent.level(), self.parent_level);
            *state_guard = Some(UnfoldState { parent, iter: 0 });
        }

        let UnfoldState { parent, iter } = state_guard.as_mut().expect("just populated above");

        let Some(mut child) = self.child_pool.get(location) else {
            self.child_out.push_and_unreserve(Vec::new(), reserved, location);
            metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
            return Ok(ArrowFireResult::ComeBackLater);
        };
        debug_assert_eq!(child.level(), self.child_level);
        child.set_parent(parent.clone());

        let process_start = Instant::now();
        let outcome = (self.unfold.lock())(parent, &child, *iter)?;
        let latency = process_start.elapsed();
        *iter += 1;

        let finished_with_parent = matches!(outcome, UnfoldStatus::NextChildNextParent | UnfoldStatus::Finished);
        let fully_finished = matches!(outcome, UnfoldStatus::Finished);

        if finished_with_parent {
            parent.mark_released();
        }

        let child = Arc::from(child);
        self.child_out.push_and_unreserve(vec![child], reserved, location);

        if finished_with_parent {
            *state_guard = None;
        }
        drop(state_guard);

        let result = if fully_finished {
            self.upstream_finished.store(true, Ordering::Release);
            ArrowFireResult::Finished
        } else {
            ArrowFireResult::KeepGoing
        };
        let status = if fully_finished { Status::Finished } else { Status::KeepGoing };
        metrics.record(status, 1, 1, latency, start.elapsed() - latency);
        Ok(result)
    }
}

/// Fold arrow: consumes already-finished children, releases their parent
/// reference, and recycles both pools once reference counts allow it.
/// Grounded almost line-for-line on `JFoldArrow.h::execute()`.
pub struct FoldArrow {
    name: String,
    parent_level: EventLevel,
    child_in: Arc<Mailbox<Arc<Event>>>,
    child_pool: Arc<Pool<Event>>,
    parent_pool: Arc<Pool<Event>>,
}

impl FoldArrow {
    /// Build a fold arrow over a finished-child queue and the two pools it
    /// recycles into.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        parent_level: EventLevel,
        child_in: Arc<Mailbox<Arc<Event>>>,
        child_pool: Arc<Pool<Event>>,
        parent_pool: Arc<Pool<Event>>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_level,
            child_in,
            child_pool,
            parent_pool,
        }
    }
}

impl Arrow for FoldArrow {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_pending_input(&self) -> bool {
        self.child_in.size() > 0
    }

    fn queue_depth(&self) -> usize {
        self.child_in.size()
    }

    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult> {
        let start = Instant::now();
        let (mut items, status) = self.child_in.pop_and_reserve(1, 1, location);
        if items.is_empty() {
            let result = if status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
            metrics.record(
                if result == ArrowFireResult::Finished { Status::Finished } else { Status::ComeBackLater },
                0,
                1,
                Duration::ZERO,
                start.elapsed(),
            );
            return Ok(result);
        }

        let process_start = Instant::now();
        let child = items.pop().expect("checked non-empty above");
        let released_parent = child.release_parent(self.parent_level);

        let recycled_child = match Arc::try_unwrap(child) {
            Ok(child) => {
                child.recycle();
                Some(child)
            }
            Err(_) => {
                tracing::warn!(arrow = %self.name, "fold arrow could not reclaim child: still referenced");
                None
            }
        };
        if let Some(child) = recycled_child {
            self.child_pool.put(Box::new(child), location);
        }

        if let Some(parent) = released_parent {
            match Arc::try_unwrap(parent) {
                Ok(parent) => {
                    parent.recycle();
                    self.parent_pool.put(Box::new(parent), location);
                }
                Err(_) => {
                    tracing::warn!(arrow = %self.name, "fold arrow released a parent still referenced elsewhere");
                }
            }
        }
        let latency = process_start.elapsed();

        metrics.record(Status::KeepGoing, 1, 1, latency, start.elapsed() - latency);
        Ok(ArrowFireResult::KeepGoing)
    }
}

/// A terminal user component that consumes finished events (C4 Sink).
/// `process_parallel` may run concurrently across events (thread-local or
/// atomic state only); `process` is serialized per-processor by the
/// implementor's own interior locking, per spec.md §5's shared-resource
/// policy.
pub trait Processor: Send + Sync {
    /// Stable name, used in error enrichment (spec.md §7).
    fn name(&self) -> &str;
    /// Runs concurrently across events; must not race on shared state.
    fn process_parallel(&self, _event: &Event) -> jana2_core::JanaResult<()> {
        Ok(())
    }
    /// Runs serialized (by the processor's own lock) per event.
    fn process(&self, event: &Event) -> jana2_core::JanaResult<()>;
    /// Opt-in ordered mode (spec.md §4.4/§5): if `true`, this processor
    /// must see events in the order its source emitted them, even though
    /// upstream parallel arrows may deliver them to the sink out of order.
    /// Default `false` — most processors don't care about cross-event
    /// order.
    fn ordered(&self) -> bool {
        false
    }
}

/// Per-source reorder buffer backing a [`SinkArrow`]'s ordered-delivery
/// mode (spec.md §5: "sink processors that opt into ordered mode see
/// events in the order the source emitted them … enforced by … a
/// per-source reorder buffer").
///
/// Holds events keyed by event number, per origin source name, until the
/// next event in sequence is available. The first event ever buffered for
/// a given origin establishes that origin's baseline — correct as long as
/// the out-of-order window upstream never reorders the very first event a
/// source emits ahead of itself, which holds given the bounded-concurrency
/// queues between source and sink.
#[derive(Default)]
struct ReorderBuffer {
    next_expected: HashMap<String, u64>,
    pending: HashMap<String, BTreeMap<u64, Arc<Event>>>,
}

impl ReorderBuffer {
    fn new() -> Self {
        Self::default()
    }

    /// Buffer one event, keyed by its origin and event number.
    fn insert(&mut self, event: Arc<Event>) {
        let origin = event.origin().unwrap_or_default();
        self.pending.entry(origin).or_default().insert(event.event_number(), event);
    }

    /// Remove and return the next in-sequence event for whichever
    /// buffered origin has one ready, or `None` if nothing is ready yet.
    fn take_ready(&mut self) -> Option<Arc<Event>> {
        for (origin, map) in self.pending.iter_mut() {
            let Some(&min_key) = map.keys().next() else {
                continue;
            };
            let expected = *self.next_expected.entry(origin.clone()).or_insert(min_key);
            if min_key == expected {
                let event = map.remove(&min_key).expect("checked present above");
                self.next_expected.insert(origin.clone(), expected + 1);
                return Some(event);
            }
        }
        None
    }

    /// Total events currently held back, across every origin.
    fn len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }
}

/// Sink arrow: runs every registered processor over each event, then
/// either recycles the event directly (no parent) or forwards it to a
/// "finished-child queue" for a downstream [`FoldArrow`] to release the
/// parent and recycle both pools.
pub struct SinkArrow {
    name: String,
    input: Arc<Mailbox<Arc<Event>>>,
    processors: Vec<Arc<dyn Processor>>,
    pool: Option<Arc<Pool<Event>>>,
    finished_out: Option<Arc<Mailbox<Arc<Event>>>>,
    /// Whether any registered processor opted into ordered delivery
    /// (spec.md §4.4/§5); if so, `reorder` buffers out-of-order arrivals
    /// until the next in-sequence event for each origin is available.
    ordered: bool,
    reorder: Mutex<ReorderBuffer>,
}

impl SinkArrow {
    /// A terminal sink that recycles events directly to `pool` (no parent
    /// to release — use this for single-level topologies).
    #[must_use]
    pub fn terminal(name: impl Into<String>, input: Arc<Mailbox<Arc<Event>>>, processors: Vec<Arc<dyn Processor>>, pool: Arc<Pool<Event>>) -> Self {
        let ordered = processors.iter().any(|p| p.ordered());
        Self {
            name: name.into(),
            input,
            processors,
            pool: Some(pool),
            finished_out: None,
            ordered,
            reorder: Mutex::new(ReorderBuffer::new()),
        }
    }

    /// A sink whose consumed events still carry a parent reference;
    /// forwards them to `finished_out` for a [`FoldArrow`] to recycle.
    #[must_use]
    pub fn forwarding(name: impl Into<String>, input: Arc<Mailbox<Arc<Event>>>, processors: Vec<Arc<dyn Processor>>, finished_out: Arc<Mailbox<Arc<Event>>>) -> Self {
        let ordered = processors.iter().any(|p| p.ordered());
        Self {
            name: name.into(),
            input,
            processors,
            pool: None,
            finished_out: Some(finished_out),
            ordered,
            reorder: Mutex::new(ReorderBuffer::new()),
        }
    }
}

impl Arrow for SinkArrow {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn has_pending_input(&self) -> bool {
        self.input.size() > 0 || (self.ordered && self.reorder.lock().len() > 0)
    }

    fn queue_depth(&self) -> usize {
        self.input.size()
    }

    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult> {
        let start = Instant::now();

        let reserved_out = if let Some(out) = &self.finished_out {
            let (reserved, status) = out.reserve(1, 1, location);
            if reserved == 0 {
                let result = if status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
                metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
                return Ok(result);
            }
            Some(reserved)
        } else {
            None
        };

        let (mut items, status) = self.input.pop_and_reserve(1, 1, location);

        let event = if self.ordered {
            let mut reorder = self.reorder.lock();
            if let Some(popped) = items.pop() {
                reorder.insert(popped);
            }
            let ready = reorder.take_ready();
            let buffer_empty = reorder.len() == 0;
            drop(reorder);

            match ready {
                Some(event) => event,
                None => {
                    if let (Some(out), Some(reserved)) = (&self.finished_out, reserved_out) {
                        out.push_and_unreserve(Vec::new(), reserved, location);
                    }
                    let result = if status == QueueStatus::Finished && buffer_empty {
                        ArrowFireResult::Finished
                    } else {
                        ArrowFireResult::ComeBackLater
                    };
                    metrics.record(
                        if result == ArrowFireResult::Finished { Status::Finished } else { Status::ComeBackLater },
                        0,
                        1,
                        Duration::ZERO,
                        start.elapsed(),
                    );
                    return Ok(result);
                }
            }
        } else {
            if items.is_empty() {
                if let (Some(out), Some(reserved)) = (&self.finished_out, reserved_out) {
                    out.push_and_unreserve(Vec::new(), reserved, location);
                }
                let result = if status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
                metrics.record(
                    if result == ArrowFireResult::Finished { Status::Finished } else { Status::ComeBackLater },
                    0,
                    1,
                    Duration::ZERO,
                    start.elapsed(),
                );
                return Ok(result);
            }
            items.pop().expect("checked non-empty above")
        };

        let process_start = Instant::now();
        for processor in &self.processors {
            processor.process_parallel(&event)?;
        }
        for processor in &self.processors {
            processor.process(&event)?;
        }
        let latency = process_start.elapsed();

        match (&self.finished_out, reserved_out) {
            (Some(out), Some(reserved)) => {
                out.push_and_unreserve(vec![event], reserved, location);
            }
            _ => {
                let pool = self.pool.as_ref().expect("terminal sink always has a pool");
                match Arc::try_unwrap(event) {
                    Ok(event) => {
                        event.recycle();
                        pool.put(Box::new(event), location);
                    }
                    Err(_) => {
                        tracing::warn!(arrow = %self.name, "terminal sink dropped a still-referenced event without recycling");
                    }
                }
            }
        }

        metrics.record(Status::KeepGoing, 1, 1, latency, start.elapsed() - latency);
        Ok(ArrowFireResult::KeepGoing)
    }
}

/// A special source that rotates through multiple event levels, emitting
/// parents ahead of their children and evicting the previous parent at a
/// given level once a new one of the same level is produced. Grounded on
/// spec.md §4.4's description of `JMultilevelSourceArrow`.
pub struct MultilevelSourceArrow {
    name: String,
    levels: Vec<EventLevel>,
    pools: Vec<Arc<Pool<Event>>>,
    outputs: Vec<Arc<Mailbox<Arc<Event>>>>,
    cursor: Mutex<usize>,
    previous: Mutex<Vec<Option<Arc<Event>>>>,
    emit: Mutex<Box<dyn FnMut(EventLevel, &Event) -> jana2_core::JanaResult<EmitStatus> + Send>>,
    finished: AtomicBool,
}

impl MultilevelSourceArrow {
    /// `levels`, `pools`, and `outputs` are parallel arrays: index `i`'s
    /// pool/output serves `levels[i]`. Rotation visits levels round-robin.
    #[must_use]
    pub fn new<F>(
        name: impl Into<String>,
        levels: Vec<EventLevel>,
        pools: Vec<Arc<Pool<Event>>>,
        outputs: Vec<Arc<Mailbox<Arc<Event>>>>,
        emit: F,
    ) -> Self
    where
        F: FnMut(EventLevel, &Event) -> jana2_core::JanaResult<EmitStatus> + Send + 'static,
    {
        assert_eq!(levels.len(), pools.len());
        assert_eq!(levels.len(), outputs.len());
        let previous = vec![None; levels.len()];
        Self {
            name: name.into(),
            levels,
            pools,
            outputs,
            cursor: Mutex::new(0),
            previous: Mutex::new(previous),
            emit: Mutex::new(Box::new(emit)),
            finished: AtomicBool::new(false),
        }
    }
}

impl Arrow for MultilevelSourceArrow {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_source(&self) -> bool {
        true
    }

    fn has_pending_input(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    fn fire(&self, location: usize, metrics: &ArrowMetrics) -> jana2_core::JanaResult<ArrowFireResult> {
        let start = Instant::now();
        if self.finished.load(Ordering::Acquire) {
            metrics.update_finished();
            return Ok(ArrowFireResult::Finished);
        }

        let idx = {
            let mut cursor = self.cursor.lock();
            let idx = *cursor;
            *cursor = (*cursor + 1) % self.levels.len();
            idx
        };
        let level = self.levels[idx];
        let output = &self.outputs[idx];

        let (reserved, out_status) = output.reserve(1, 1, location);
        if reserved == 0 {
            let result = if out_status == QueueStatus::Finished { ArrowFireResult::Finished } else { ArrowFireResult::ComeBackLater };
            metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
            return Ok(result);
        }

        let Some(fresh) = self.pools[idx].get(location) else {
            output.push_and_unreserve(Vec::new(), reserved, location);
            metrics.record(Status::ComeBackLater, 0, 1, Duration::ZERO, start.elapsed());
            return Ok(ArrowFireResult::ComeBackLater);
        };

        let process_start = Instant::now();
        let outcome = (self.emit.lock())(level, &fresh)?;
        let latency = process_start.elapsed();

        match outcome {
            EmitStatus::FailureFinished => {
                self.finished.store(true, Ordering::Release);
                self.pools[idx].put(fresh, location);
                output.push_and_unreserve(Vec::new(), reserved, location);
                metrics.record(Status::Finished, 0, 1, latency, start.elapsed() - latency);
                Ok(ArrowFireResult::Finished)
            }
            EmitStatus::FailureTryAgain => {
                self.pools[idx].put(fresh, location);
                output.push_and_unreserve(Vec::new(), reserved, location);
                metrics.record(Status::ComeBackLater, 0, 1, latency, start.elapsed() - latency);
                Ok(ArrowFireResult::ComeBackLater)
            }
            EmitStatus::Success => {
                let emitted = Arc::from(fresh);
                let evicted = self.previous.lock()[idx].replace(emitted.clone());
                drop(evicted); // previous parent of this level is superseded; its lifetime is now owned solely by its children's parent links.
                output.push_and_unreserve(vec![emitted], reserved, location);
                metrics.record(Status::KeepGoing, 1, 1, latency, start.elapsed() - latency);
                Ok(ArrowFireResult::KeepGoing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use jana2_pool::Limit;

    fn event_pool(level: EventLevel, size: usize) -> Arc<Pool<Event>> {
        Arc::new(Pool::new(1, size, Limit::Strict, move || Event::new(level), |_e: &mut Event| {}))
    }

    #[test]
    fn zero_size_strict_pool_backs_off_without_deadlock() {
        let pool = event_pool(EventLevel::PhysicsEvent, 0);
        let output = Arc::new(Mailbox::new(1, 10));
        let source = SourceArrow::new(
            "src",
            EventLevel::PhysicsEvent,
            pool,
            output,
            4,
            0,
            None,
            |_e: &Event| Ok(EmitStatus::Success),
        );

        let metrics = ArrowMetrics::new();
        let result = source.fire(0, &metrics).unwrap();
        assert_eq!(result, ArrowFireResult::ComeBackLater);
        // Calling again must not hang or panic: the pool stays empty forever.
        let result = source.fire(0, &metrics).unwrap();
        assert_eq!(result, ArrowFireResult::ComeBackLater);
    }

    #[test]
    fn source_emits_stamped_events_respecting_nskip_and_nevents() {
        let pool = event_pool(EventLevel::PhysicsEvent, 10);
        let output = Arc::new(Mailbox::new(1, 10));
        let counter = Arc::new(AtomicI32::new(0));
        let counter_clone = counter.clone();
        let source = SourceArrow::new(
            "src",
            EventLevel::PhysicsEvent,
            pool,
            output.clone(),
            10,
            2,
            Some(3),
            move |_e: &Event| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(EmitStatus::Success)
            },
        );

        let metrics = ArrowMetrics::new();
        loop {
            match source.fire(0, &metrics).unwrap() {
                ArrowFireResult::Finished => break,
                _ => continue,
            }
        }

        assert_eq!(source.emitted_count(), 3);
        let (drained, _) = output.pop_and_reserve(0, 100, 0);
        assert_eq!(drained.len(), 3);
        // nskip=2 skips raw positions 1-2; event numbers stamp the raw
        // source position, not the emitted count, so they start at 3.
        assert_eq!(drained[0].event_number(), 3);
        assert_eq!(drained[2].event_number(), 5);
    }

    #[test]
    fn map_arrow_transforms_and_forwards() {
        let input: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 4));
        let output: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 4));
        let event = Arc::new(Event::new(EventLevel::PhysicsEvent));
        event.insert::<i32>("v", vec![21]);
        input.try_push(vec![event], 0);

        let map = MapArrow::new("double", input, output.clone(), |e: &Event| {
            let v = e.get::<i32>("v")?;
            e.insert::<i32>("v", v.into_iter().map(|x| x * 2).collect());
            Ok(())
        });

        let metrics = ArrowMetrics::new();
        let result = map.fire(0, &metrics).unwrap();
        assert_eq!(result, ArrowFireResult::KeepGoing);

        let (mut drained, _) = output.pop_and_reserve(1, 1, 0);
        let out_event = drained.pop().unwrap();
        assert_eq!(out_event.get::<i32>("v").unwrap(), vec![42]);
    }

    #[test]
    fn fold_releases_parent_once_all_children_return() {
        let parent = Arc::new(Event::new(EventLevel::Timeslice));
        parent.mark_released();

        let child_a = Arc::new(Event::new(EventLevel::PhysicsEvent));
        child_a.set_parent(parent.clone());
        let child_b = Arc::new(Event::new(EventLevel::PhysicsEvent));
        child_b.set_parent(parent.clone());
        assert_eq!(parent.child_count(), 2);

        let child_in: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 4));
        let child_pool = event_pool(EventLevel::PhysicsEvent, 2);
        let parent_pool = event_pool(EventLevel::Timeslice, 2);

        child_in.try_push(vec![child_a], 0);
        child_in.try_push(vec![child_b], 0);

        let fold = FoldArrow::new("fold", EventLevel::Timeslice, child_in, child_pool.clone(), parent_pool.clone());
        let metrics = ArrowMetrics::new();

        assert_eq!(fold.fire(0, &metrics).unwrap(), ArrowFireResult::KeepGoing);
        assert_eq!(parent_pool.checked_out(0), 0); // not yet released
        assert_eq!(fold.fire(0, &metrics).unwrap(), ArrowFireResult::KeepGoing);
        // both children recycled; parent released on second child and recycled too
        assert_eq!(child_pool.checked_out(0), 0);
    }

    struct OrderedRecordingSink {
        seen: Mutex<Vec<u64>>,
    }

    impl Processor for OrderedRecordingSink {
        fn name(&self) -> &str {
            "ordered_recording_sink"
        }

        fn process(&self, event: &Event) -> jana2_core::JanaResult<()> {
            self.seen.lock().push(event.event_number());
            Ok(())
        }

        fn ordered(&self) -> bool {
            true
        }
    }

    #[test]
    fn ordered_sink_delivers_in_event_number_order_despite_arrival_order() {
        let pool = event_pool(EventLevel::PhysicsEvent, 4);
        let input: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 4));

        // Arrive out of order: 1, 3, 2. The reorder buffer adopts the first
        // event seen for an origin as its baseline, so this relies on that
        // first arrival (1) genuinely being the sequence's start.
        for n in [1u64, 3, 2] {
            let event = Event::new(EventLevel::PhysicsEvent);
            event.set_event_number(n);
            event.set_origin("src".to_string());
            input.try_push(vec![Arc::new(event)], 0);
        }

        let sink_processor = Arc::new(OrderedRecordingSink { seen: Mutex::new(Vec::new()) });
        let sink = SinkArrow::terminal("sink", input, vec![sink_processor.clone()], pool);
        let metrics = ArrowMetrics::new();

        // Three pops drain the mailbox; a fourth drains event 3, which was
        // held back behind 2 with no further input to trigger a recheck.
        for _ in 0..4 {
            sink.fire(0, &metrics).unwrap();
        }

        assert_eq!(*sink_processor.seen.lock(), vec![1, 2, 3]);
    }
}
