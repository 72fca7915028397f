//! Factory: a memoized producer of one named collection on one event.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::collection::Collection;
use crate::error::{JanaError, JanaResult};
use crate::event::Event;

/// Lifecycle state of a [`Factory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryStatus {
    /// `Init` has not yet run.
    Uninitialized,
    /// `Init` has run but `Process` has not (or the run number just
    /// changed and `Process` needs to run again).
    Unprocessed,
    /// `Process` has run and the collection is ready to read.
    Processed,
    /// The collection was populated directly via `Insert`, bypassing
    /// `Process` entirely.
    Inserted,
    /// `Init`, `ChangeRun`, or `Process` threw; the collection is not
    /// usable and the error has been propagated upward.
    Excepted,
}

/// Behavioral flags set on a factory at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryFlags {
    /// `ClearData` is a no-op; the collection survives event recycling.
    pub persistent: bool,
    /// `ClearData` clears the pointer vector but does not drop the
    /// objects; the caller retains ownership of them.
    pub not_owner: bool,
    /// `Get` always runs `Process`, even if the collection was `Inserted`.
    pub regenerate: bool,
    /// Advisory only: consumed by output-sink collaborators, ignored by
    /// the engine itself.
    pub write_to_output: bool,
}

/// Type-erased view of a [`Factory<T>`], stored in a [`FactorySet`].
///
/// Mirrors the `as_any`-downcast pattern used for parameter erasure
/// elsewhere in this codebase: the set stores `Box<dyn FactoryAny>` and
/// re-establishes the concrete type at the `get::<T>` boundary via
/// `as_any_mut().downcast_mut::<Factory<T>>()`.
pub trait FactoryAny: Send {
    /// Borrow as `&dyn Any` for downcasting back to `Factory<T>`.
    fn as_any(&self) -> &dyn Any;
    /// Borrow as `&mut dyn Any` for downcasting back to `Factory<T>`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// The factory's tag.
    fn tag(&self) -> &str;
    /// Current lifecycle status.
    fn status(&self) -> FactoryStatus;
    /// Reset the factory's collection and status for event reuse. A
    /// `Persistent` factory ignores this call.
    fn clear_data(&mut self);
    /// Apply the upcaster registered for `type_id`, if any, to every item
    /// currently in the collection. Returns `None` if no upcaster was
    /// registered for that type.
    fn get_as_erased(&self, type_id: TypeId) -> Option<Vec<&dyn Any>>;
}

type Upcaster<T> = Box<dyn Fn(&T) -> &dyn Any + Send + Sync>;
type InitFn = Box<dyn FnMut() -> JanaResult<()> + Send>;
type ChangeRunFn = Box<dyn FnMut(u64) -> JanaResult<()> + Send>;
type ProcessFn<T> = Box<dyn FnMut(&Event) -> JanaResult<Vec<T>> + Send>;

/// A memoized producer of one named collection of `T` on one event.
///
/// Rust has no base-class pointers, so `GetAs<S>` is modeled as a small
/// dispatch table of upcaster closures populated at construction — each
/// maps the `TypeId` of some `S` (typically a field embedded in `T`, the
/// composition-based analogue of a C++ base class) to a closure that
/// borrows that field out of a `&T`. Looking a type up in the table is
/// O(1) and requires no per-item allocation.
pub struct Factory<T> {
    tag: String,
    status: FactoryStatus,
    last_run_number: Option<u64>,
    flags: FactoryFlags,
    collection: Collection<T>,
    upcasters: HashMap<TypeId, Upcaster<T>>,
    init: Option<InitFn>,
    change_run: Option<ChangeRunFn>,
    process: ProcessFn<T>,
}

impl<T: Send + 'static> Factory<T> {
    /// Build a factory with the given tag, flags, and `Process`
    /// implementation. `Init` and `ChangeRun` default to no-ops.
    pub fn new<P>(tag: impl Into<String>, flags: FactoryFlags, process: P) -> Self
    where
        P: FnMut(&Event) -> JanaResult<Vec<T>> + Send + 'static,
    {
        Self {
            tag: tag.into(),
            status: FactoryStatus::Uninitialized,
            last_run_number: None,
            flags,
            collection: Collection::new(),
            upcasters: HashMap::new(),
            init: None,
            change_run: None,
            process: Box::new(process),
        }
    }

    /// Attach an `Init` callback, run once before the first `Process`.
    #[must_use]
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnMut() -> JanaResult<()> + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    /// Attach a `ChangeRun` callback, run once per run number.
    #[must_use]
    pub fn with_change_run<F>(mut self, change_run: F) -> Self
    where
        F: FnMut(u64) -> JanaResult<()> + Send + 'static,
    {
        self.change_run = Some(Box::new(change_run));
        self
    }

    /// Register an upcaster so `GetAs<S>` can borrow an `S` out of this
    /// factory's items without the caller knowing `T`.
    #[must_use]
    pub fn with_upcast<S, F>(mut self, caster: F) -> Self
    where
        S: 'static,
        F: Fn(&T) -> &S + Send + Sync + 'static,
    {
        self.upcasters
            .insert(TypeId::of::<S>(), Box::new(move |t: &T| caster(t) as &dyn Any));
        self
    }

    /// Directly populate the collection, skipping `Process` and marking
    /// the factory `Inserted`.
    pub fn insert(&mut self, items: Vec<T>) {
        self.collection.set(items);
        self.status = FactoryStatus::Inserted;
    }

    /// Run the lazy-evaluation protocol: `Init` if uninitialized,
    /// `ChangeRun` if the run number changed, `Process` if unprocessed (or
    /// `Inserted` with `Regenerate` set), then return the collection.
    pub fn get(&mut self, event: &Event) -> JanaResult<&[T]> {
        if self.status == FactoryStatus::Uninitialized {
            if let Some(init) = &mut self.init {
                init().map_err(|e| self.mark_excepted(e))?;
            }
            self.status = FactoryStatus::Unprocessed;
        }

        let run_number = event.run_number();
        if self.last_run_number != Some(run_number) {
            if let Some(change_run) = &mut self.change_run {
                change_run(run_number).map_err(|e| self.mark_excepted(e))?;
            }
            self.last_run_number = Some(run_number);
        }

        let needs_process = self.flags.regenerate
            || matches!(self.status, FactoryStatus::Unprocessed);
        if needs_process {
            let items = (self.process)(event).map_err(|e| self.mark_excepted(e))?;
            self.collection.set(items);
            self.status = FactoryStatus::Processed;
        }

        Ok(self.collection.items())
    }

    /// Look up a registered upcaster for `S` and apply it to every item,
    /// without running the `Process` protocol again.
    #[must_use]
    pub fn get_as<S: 'static>(&self) -> Option<Vec<&S>> {
        let erased = FactoryAny::get_as_erased(self, TypeId::of::<S>())?;
        Some(
            erased
                .into_iter()
                .filter_map(|item| item.downcast_ref::<S>())
                .collect(),
        )
    }

    fn mark_excepted(&mut self, err: JanaError) -> JanaError {
        self.status = FactoryStatus::Excepted;
        tracing::warn!(tag = %self.tag, error = %err, "factory excepted");
        err
    }

    /// The factory's behavioral flags.
    #[must_use]
    pub fn flags(&self) -> FactoryFlags {
        self.flags
    }
}

impl<T: Send + 'static> FactoryAny for Factory<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn status(&self) -> FactoryStatus {
        self.status
    }

    fn clear_data(&mut self) {
        if self.flags.persistent {
            return;
        }
        self.collection.clear();
        self.status = FactoryStatus::Uninitialized;
        self.last_run_number = None;
    }

    fn get_as_erased(&self, type_id: TypeId) -> Option<Vec<&dyn Any>> {
        let caster = self.upcasters.get(&type_id)?;
        Some(self.collection.items().iter().map(|item| caster(item)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventLevel;

    fn make_event() -> Event {
        Event::new(EventLevel::PhysicsEvent)
    }

    #[test]
    fn process_runs_once_and_memoizes() {
        let event = make_event();
        let mut calls = 0;
        let mut factory = Factory::new("", FactoryFlags::default(), move |_e: &Event| {
            calls += 1;
            Ok(vec![1, 2, 3])
        });

        let first = factory.get(&event).unwrap().to_vec();
        let second = factory.get(&event).unwrap().to_vec();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![1, 2, 3]);
        assert_eq!(factory.status(), FactoryStatus::Processed);
    }

    #[test]
    fn regenerate_flag_forces_reprocess_after_insert() {
        let event = make_event();
        let flags = FactoryFlags {
            regenerate: true,
            ..Default::default()
        };
        let mut factory = Factory::new("", flags, |_e: &Event| Ok(vec![42]));
        factory.insert(vec![0]);
        assert_eq!(factory.status(), FactoryStatus::Inserted);

        let items = factory.get(&event).unwrap().to_vec();
        assert_eq!(items, vec![42]);
        assert_eq!(factory.status(), FactoryStatus::Processed);
    }

    #[test]
    fn get_as_upcasts_via_registered_table() {
        struct Wrapper {
            inner: i64,
        }
        let event = make_event();
        let mut factory = Factory::new("", FactoryFlags::default(), |_e: &Event| {
            Ok(vec![Wrapper { inner: 7 }])
        })
        .with_upcast::<i64, _>(|w: &Wrapper| &w.inner);

        factory.get(&event).unwrap();
        let upcast = factory.get_as::<i64>().unwrap();
        assert_eq!(upcast, vec![&7i64]);
    }

    #[test]
    fn persistent_flag_survives_clear() {
        let event = make_event();
        let flags = FactoryFlags {
            persistent: true,
            ..Default::default()
        };
        let mut factory = Factory::new("", flags, |_e: &Event| Ok(vec![9]));
        factory.get(&event).unwrap();
        factory.clear_data();
        assert_eq!(factory.status(), FactoryStatus::Processed);
        assert_eq!(factory.get(&event).unwrap(), &[9]);
    }
}
