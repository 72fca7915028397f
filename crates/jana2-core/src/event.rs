//! The event type and its per-event factory registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::call_graph::{CallGraphRecorder, FactoryKey};
use crate::error::{JanaError, JanaResult};
use crate::factory::{Factory, FactoryAny};

/// Coarse-to-fine tag for an event's place in the multi-level hierarchy.
/// Declaration order doubles as coarseness order: `Run` is the coarsest
/// level, `Subevent` the finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventLevel {
    /// A full run, the coarsest level.
    Run,
    /// A block of physics events read out together.
    Timeslice,
    /// A single physics event.
    PhysicsEvent,
    /// A sub-division of a physics event (e.g. per-detector).
    Subevent,
}

impl EventLevel {
    /// Whether `self` is strictly coarser (contains) `other`.
    #[must_use]
    pub fn is_coarser_than(&self, other: &EventLevel) -> bool {
        self < other
    }
}

type FactorySlot = Arc<Mutex<Box<dyn FactoryAny>>>;

/// Per-event registry mapping `(produced type, tag)` to a [`Factory`],
/// plus the call graph recorded while those factories execute.
///
/// Each factory is independently mutex-guarded so that one factory's
/// `Process` can call back into a *different* factory on the same event
/// (to satisfy a dependency) without contending on a single event-wide
/// lock. A factory calling into itself — a cyclic dependency — is
/// rejected before any lock is taken, rather than deadlocking.
pub struct FactorySet {
    entries: Mutex<HashMap<(TypeId, String), FactorySlot>>,
    call_graph: CallGraphRecorder,
}

impl FactorySet {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            call_graph: CallGraphRecorder::new(),
        }
    }

    /// Register a factory under `(T, tag)`. Replaces any existing
    /// registration for the same key.
    pub fn register<T: Send + 'static>(&self, tag: impl Into<String>, factory: Factory<T>) {
        let tag = tag.into();
        let key = (TypeId::of::<T>(), tag);
        self.entries
            .lock()
            .insert(key, Arc::new(Mutex::new(Box::new(factory))));
    }

    fn slot<T: Send + 'static>(&self, tag: &str) -> Option<FactorySlot> {
        self.entries
            .lock()
            .get(&(TypeId::of::<T>(), tag.to_string()))
            .cloned()
    }

    /// Run the lazy-evaluation protocol for `(T, tag)` and hand the
    /// resulting collection to `f` while the factory remains locked.
    pub fn with_collection<T, R>(
        &self,
        tag: &str,
        event: &Event,
        f: impl FnOnce(&[T]) -> R,
    ) -> JanaResult<R>
    where
        T: Send + 'static,
    {
        let slot = self.slot::<T>(tag).ok_or_else(|| {
            JanaError::Configuration(format!(
                "no factory registered for type '{}' tag '{}'",
                std::any::type_name::<T>(),
                tag
            ))
        })?;

        let key = FactoryKey::new(std::any::type_name::<T>(), tag);
        if self.call_graph.is_active(&key) {
            return Err(JanaError::Configuration(format!(
                "cyclic factory dependency detected at '{}' tag '{}'",
                key.type_name, key.tag
            )));
        }
        let _guard = self.call_graph.enter(key);

        let mut boxed = slot.lock();
        let factory = boxed
            .as_any_mut()
            .downcast_mut::<Factory<T>>()
            .expect("factory registered under mismatched concrete type");
        let items = factory.get(event)?;
        Ok(f(items))
    }

    /// Convenience over [`with_collection`](Self::with_collection) for
    /// `Clone` payloads.
    pub fn get_cloned<T>(&self, tag: &str, event: &Event) -> JanaResult<Vec<T>>
    where
        T: Send + Clone + 'static,
    {
        self.with_collection(tag, event, <[T]>::to_vec)
    }

    /// Insert a collection directly, registering a trivial `Inserted`
    /// factory if one is not already present for `(T, tag)`.
    pub fn insert<T: Send + 'static>(&self, tag: &str, items: Vec<T>) {
        let key = (TypeId::of::<T>(), tag.to_string());
        let mut entries = self.entries.lock();
        let slot = entries.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(Box::new(Factory::<T>::new(
                tag.to_string(),
                crate::factory::FactoryFlags::default(),
                |_event: &Event| {
                    Ok(Vec::new())
                },
            )) as Box<dyn FactoryAny>))
        });
        let mut boxed = slot.lock();
        let factory = boxed
            .as_any_mut()
            .downcast_mut::<Factory<T>>()
            .expect("factory registered under mismatched concrete type");
        factory.insert(items);
    }

    /// Apply every registered upcaster targeting `S`, across all tags,
    /// cloning matches out from under their factory locks.
    pub fn get_as_cloned<S: Clone + 'static>(&self) -> Vec<S> {
        let slots: Vec<FactorySlot> = self.entries.lock().values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let boxed = slot.lock();
            if let Some(erased) = boxed.get_as_erased(TypeId::of::<S>()) {
                out.extend(erased.into_iter().filter_map(|a| a.downcast_ref::<S>().cloned()));
            }
        }
        out
    }

    /// Edges recorded across this event's factory executions so far.
    #[must_use]
    pub fn call_graph_edges(&self) -> Vec<crate::call_graph::CallGraphEdge> {
        self.call_graph.edges()
    }

    /// Reset every non-persistent factory and the call graph, for reuse
    /// by a recycled event.
    pub fn clear(&self) {
        for slot in self.entries.lock().values() {
            slot.lock().clear_data();
        }
        self.call_graph.clear();
    }
}

/// The unit of data flowing through the pipeline.
///
/// An event owns a [`FactorySet`] and may hold a reference to a parent
/// event at the next coarser level. Parents are reference-counted by
/// their children: [`set_parent`](Event::set_parent) increments the
/// parent's child count, [`release_parent`](Event::release_parent)
/// decrements it, and the fold arrow recycles the parent once the count
/// reaches zero and its source has marked it released.
pub struct Event {
    event_number: AtomicU64,
    run_number: AtomicU64,
    level: EventLevel,
    parent: Mutex<Option<Arc<Event>>>,
    child_count: AtomicUsize,
    released: AtomicBool,
    origin: Mutex<Option<String>>,
    factories: FactorySet,
}

impl Event {
    /// A fresh event at `level`, with no parent and event/run numbers at
    /// their defaults. Intended to be wrapped by the per-level event pool.
    #[must_use]
    pub fn new(level: EventLevel) -> Self {
        Self {
            event_number: AtomicU64::new(0),
            run_number: AtomicU64::new(0),
            level,
            parent: Mutex::new(None),
            child_count: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            origin: Mutex::new(None),
            factories: FactorySet::new(),
        }
    }

    /// This event's level.
    #[must_use]
    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// The monotonic event number stamped by the source that emitted it.
    #[must_use]
    pub fn event_number(&self) -> u64 {
        self.event_number.load(Ordering::Acquire)
    }

    /// Stamp the event number. Called once by the owning source.
    pub fn set_event_number(&self, n: u64) {
        self.event_number.store(n, Ordering::Release);
    }

    /// The run number currently associated with this event.
    #[must_use]
    pub fn run_number(&self) -> u64 {
        self.run_number.load(Ordering::Acquire)
    }

    /// Set the run number. Triggers `ChangeRun` on any factory whose
    /// `get` next runs against this event.
    pub fn set_run_number(&self, n: u64) {
        self.run_number.store(n, Ordering::Release);
    }

    /// Name of the source that produced this event, if stamped.
    #[must_use]
    pub fn origin(&self) -> Option<String> {
        self.origin.lock().clone()
    }

    /// Record the name of the originating source.
    pub fn set_origin(&self, name: impl Into<String>) {
        *self.origin.lock() = Some(name.into());
    }

    /// Number of children currently holding a reference to this event as
    /// their parent.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.child_count.load(Ordering::Acquire)
    }

    /// Whether the originating source has marked this event released
    /// (i.e. it will emit no further children referencing it).
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Mark this event released by its source. Combined with a
    /// zero child count, this permits recycling.
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Attach `parent`, incrementing its child count. Replaces any
    /// existing parent link without adjusting the old parent's count —
    /// callers are expected to only call this once per event.
    pub fn set_parent(&self, parent: Arc<Event>) {
        parent.child_count.fetch_add(1, Ordering::AcqRel);
        *self.parent.lock() = Some(parent);
    }

    /// Walk the parent chain to find the ancestor at `level`.
    ///
    /// # Errors
    /// Returns [`JanaError::HierarchyMismatch`] if no ancestor at that
    /// level exists (including when `level` is not coarser than `self`).
    pub fn get_parent(&self, level: EventLevel) -> JanaResult<Arc<Event>> {
        let mut current = self.parent.lock().clone();
        while let Some(candidate) = current {
            if candidate.level() == level {
                return Ok(candidate);
            }
            current = candidate.parent.lock().clone();
        }
        Err(JanaError::HierarchyMismatch { level })
    }

    /// Release this event's direct parent if it is at `level`: decrements
    /// the parent's child count and, if that reaches zero and the parent
    /// has been marked released, detaches and returns it so a fold arrow
    /// can recycle it. Returns `None` if there is no direct parent at
    /// `level`, or if the parent is not yet eligible for recycling.
    pub fn release_parent(&self, level: EventLevel) -> Option<Arc<Event>> {
        let mut guard = self.parent.lock();
        let matches_level = guard.as_ref().is_some_and(|p| p.level() == level);
        if !matches_level {
            return None;
        }
        let parent = guard.take().expect("checked Some above");
        let remaining = parent.child_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && parent.is_released() {
            Some(parent)
        } else {
            None
        }
    }

    /// Run the lazy-evaluation protocol for `(T, tag)` and hand the
    /// resulting collection to `f` while the factory remains locked.
    pub fn with_collection<T, R>(&self, tag: &str, f: impl FnOnce(&[T]) -> R) -> JanaResult<R>
    where
        T: Send + 'static,
    {
        self.factories.with_collection(tag, self, f)
    }

    /// Fetch and clone the collection produced for `(T, tag)`.
    pub fn get<T>(&self, tag: &str) -> JanaResult<Vec<T>>
    where
        T: Send + Clone + 'static,
    {
        self.factories.get_cloned(tag, self)
    }

    /// Register a factory for `(T, tag)`.
    pub fn register_factory<T: Send + 'static>(&self, tag: impl Into<String>, factory: Factory<T>) {
        self.factories.register(tag, factory);
    }

    /// Insert a collection directly under `(T, tag)`.
    pub fn insert<T: Send + 'static>(&self, tag: &str, items: Vec<T>) {
        self.factories.insert(tag, items);
    }

    /// Every registered upcast target matching `S`, across all tags.
    #[must_use]
    pub fn get_as<S: Clone + 'static>(&self) -> Vec<S> {
        self.factories.get_as_cloned::<S>()
    }

    /// Edges recorded across this event's factory executions so far.
    #[must_use]
    pub fn call_graph_edges(&self) -> Vec<crate::call_graph::CallGraphEdge> {
        self.factories.call_graph_edges()
    }

    /// Reset this event for reuse: clears factories (except `Persistent`
    /// ones), the call graph, parent link, child count, and released flag.
    /// Event/run numbers are left for the caller (typically the source or
    /// pool) to restamp.
    pub fn recycle(&self) {
        self.factories.clear();
        *self.parent.lock() = None;
        self.child_count.store(0, Ordering::Release);
        self.released.store(false, Ordering::Release);
        *self.origin.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FactoryFlags;

    #[test]
    fn level_ordering_matches_coarseness() {
        assert!(EventLevel::Run.is_coarser_than(&EventLevel::Timeslice));
        assert!(EventLevel::Timeslice.is_coarser_than(&EventLevel::PhysicsEvent));
        assert!(!EventLevel::Subevent.is_coarser_than(&EventLevel::Run));
    }

    #[test]
    fn insert_then_get_round_trips() {
        let event = Event::new(EventLevel::PhysicsEvent);
        event.insert::<i32>("hits", vec![1, 2, 3]);
        let got = event.get::<i32>("hits").unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn get_is_idempotent_and_runs_process_once() {
        let event = Event::new(EventLevel::PhysicsEvent);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        event.register_factory(
            "",
            Factory::new("", FactoryFlags::default(), move |_e: &Event| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(vec![10i64])
            }),
        );
        assert_eq!(event.get::<i64>("").unwrap(), vec![10]);
        assert_eq!(event.get::<i64>("").unwrap(), vec![10]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parent_child_refcount_releases_at_zero() {
        let parent = Arc::new(Event::new(EventLevel::Timeslice));
        let child_a = Event::new(EventLevel::PhysicsEvent);
        let child_b = Event::new(EventLevel::PhysicsEvent);

        child_a.set_parent(parent.clone());
        child_b.set_parent(parent.clone());
        assert_eq!(parent.child_count(), 2);

        parent.mark_released();
        assert!(child_a.release_parent(EventLevel::Timeslice).is_none());
        assert_eq!(parent.child_count(), 1);

        let released = child_b.release_parent(EventLevel::Timeslice);
        assert!(released.is_some());
        assert_eq!(released.unwrap().child_count(), 0);
    }

    #[test]
    fn release_without_released_flag_keeps_parent_alive() {
        let parent = Arc::new(Event::new(EventLevel::Timeslice));
        let child = Event::new(EventLevel::PhysicsEvent);
        child.set_parent(parent.clone());

        let released = child.release_parent(EventLevel::Timeslice);
        assert!(released.is_none());
    }

    #[test]
    fn get_parent_walks_multiple_levels() {
        let run = Arc::new(Event::new(EventLevel::Run));
        let timeslice = Arc::new(Event::new(EventLevel::Timeslice));
        timeslice.set_parent(run.clone());
        let physics = Event::new(EventLevel::PhysicsEvent);
        physics.set_parent(timeslice.clone());

        assert_eq!(physics.get_parent(EventLevel::Timeslice).unwrap().level(), EventLevel::Timeslice);
        assert_eq!(physics.get_parent(EventLevel::Run).unwrap().level(), EventLevel::Run);
        assert!(physics.get_parent(EventLevel::Subevent).is_err());
    }

    #[test]
    fn cyclic_dependency_is_rejected_not_deadlocked() {
        let event = Event::new(EventLevel::PhysicsEvent);
        event.register_factory(
            "a",
            Factory::new("a", FactoryFlags::default(), |e: &Event| {
                e.get::<i32>("a")?;
                Ok(vec![1])
            }),
        );
        let result = event.get::<i32>("a");
        assert!(result.is_err());
    }
}
