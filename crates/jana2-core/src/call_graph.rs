//! Per-event call graph recording.
//!
//! Whenever one factory's `Process` calls `GetCollection` on another
//! factory inside the same event, that edge is recorded here. The graph
//! is reset along with the event's `FactorySet` when the event is
//! recycled, and exists purely for stringification/debugging collaborators
//! (e.g. a `--dump-callgraph` flag) — the engine itself never reads it
//! back to make scheduling decisions.

use parking_lot::Mutex;

/// Identifies one factory slot: a produced type name paired with its tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactoryKey {
    /// `std::any::type_name` of the produced type.
    pub type_name: &'static str,
    /// The factory's tag.
    pub tag: String,
}

impl FactoryKey {
    /// Build a key for the given produced type and tag.
    #[must_use]
    pub fn new(type_name: &'static str, tag: impl Into<String>) -> Self {
        Self {
            type_name,
            tag: tag.into(),
        }
    }
}

/// A directed edge: `caller` invoked `Get`/`GetCollection` on `callee`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallGraphEdge {
    /// The factory that was already executing.
    pub caller: FactoryKey,
    /// The factory it called into.
    pub callee: FactoryKey,
}

/// Tracks which factory is currently executing on this event, and the
/// edges observed so far.
#[derive(Debug, Default)]
pub struct CallGraphRecorder {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stack: Vec<FactoryKey>,
    edges: Vec<CallGraphEdge>,
}

impl CallGraphRecorder {
    /// A fresh recorder with an empty stack and no recorded edges.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `callee` as the now-executing factory, recording an edge from
    /// whichever factory was previously on top of the stack (if any).
    /// Returns a guard that pops the stack on drop.
    pub fn enter(&self, callee: FactoryKey) -> CallGraphGuard<'_> {
        {
            let mut inner = self.inner.lock();
            if let Some(caller) = inner.stack.last().cloned() {
                inner.edges.push(CallGraphEdge {
                    caller,
                    callee: callee.clone(),
                });
            }
            inner.stack.push(callee);
        }
        CallGraphGuard { recorder: self }
    }

    /// Whether `key` is already on the call stack — i.e. entering it again
    /// would be a cyclic factory dependency.
    #[must_use]
    pub fn is_active(&self, key: &FactoryKey) -> bool {
        self.inner.lock().stack.iter().any(|k| k == key)
    }

    /// All edges recorded so far, in the order observed.
    #[must_use]
    pub fn edges(&self) -> Vec<CallGraphEdge> {
        self.inner.lock().edges.clone()
    }

    /// Discard all recorded edges and reset the call stack. Called when
    /// the owning event is returned to its pool.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.stack.clear();
        inner.edges.clear();
    }
}

/// RAII guard returned by [`CallGraphRecorder::enter`]; pops the call
/// stack when the factory's `Process` call returns, including on error.
pub struct CallGraphGuard<'a> {
    recorder: &'a CallGraphRecorder,
}

impl Drop for CallGraphGuard<'_> {
    fn drop(&mut self) {
        self.recorder.inner.lock().stack.pop();
    }
}
