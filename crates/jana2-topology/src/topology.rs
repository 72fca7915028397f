//! Topology: the frozen arrow/queue/pool graph (C5).
//!
//! Construction is a three-phase builder, matching spec.md §4.5:
//!
//! 1. **register** — add arrows, declaring the port bindings (queue or
//!    pool resource ids) each one reads from and writes to.
//! 2. **wire** — tag the one sink-to-source recycle edge that is allowed
//!    to form a cycle (see Design Notes "Cyclic references"); everything
//!    else is already wired by the time an arrow is constructed in Rust
//!    (ports hold `Arc<Mailbox<_>>`/`Arc<Pool<_>>` directly), so this phase
//!    is just bookkeeping rather than a separate connection step.
//! 3. **freeze** — validate every invariant below and produce an immutable
//!    [`Topology`]. No structural mutation is possible afterward.
//!
//! Invariants enforced at freeze time: every queue has exactly one
//! producer and one consumer; every pool is referenced by at least one
//! producer and one consumer; every source ultimately reaches a sink; and
//! the wired graph contains no cycle other than a tagged recycle edge.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jana2_core::{Event, EventLevel, JanaError, JanaResult};
use jana2_pool::Pool;

use crate::arrow::Arrow;

/// Which side of an arrow a [`PortBinding`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    /// The arrow reads from this resource.
    Input,
    /// The arrow writes to this resource.
    Output,
}

/// Whether a [`PortBinding`]'s resource is a bounded queue or an object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// A `Mailbox`-backed queue.
    Queue,
    /// A `Pool`-backed object pool.
    Pool,
}

/// Declares that an arrow's named port is bound to a given queue or pool
/// resource id, for topology validation purposes. This is metadata only —
/// the arrow itself already holds the real `Arc<Mailbox<_>>`/`Arc<Pool<_>>`
/// it was built with; the builder never reaches inside an arrow.
#[derive(Debug, Clone)]
pub struct PortBinding {
    /// Name of the port on the owning arrow (for error messages).
    pub port_name: String,
    /// Whether this is an input or output port.
    pub direction: PortDirection,
    /// Whether the bound resource is a queue or a pool.
    pub kind: PortKind,
    /// Id of the queue or pool this port is bound to. Two arrows sharing
    /// the same resource id are considered wired together.
    pub resource: String,
}

impl PortBinding {
    /// Build a port binding.
    #[must_use]
    pub fn new(port_name: impl Into<String>, direction: PortDirection, kind: PortKind, resource: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            direction,
            kind,
            resource: resource.into(),
        }
    }
}

struct ArrowEntry {
    arrow: Arc<dyn Arrow>,
    ports: Vec<PortBinding>,
}

#[derive(Default)]
struct ResourceUsage {
    kind: Option<PortKind>,
    producers: Vec<String>,
    consumers: Vec<String>,
}

/// Three-phase builder for a [`Topology`].
pub struct TopologyBuilder {
    arrows: HashMap<String, ArrowEntry>,
    order: Vec<String>,
    resources: HashMap<String, ResourceUsage>,
    recycle_edges: HashSet<(String, String)>,
    event_pools: HashMap<EventLevel, Arc<Pool<Event>>>,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyBuilder {
    /// An empty builder, ready for `register` calls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arrows: HashMap::new(),
            order: Vec::new(),
            resources: HashMap::new(),
            recycle_edges: HashSet::new(),
            event_pools: HashMap::new(),
        }
    }

    /// Register an arrow along with the port bindings describing which
    /// queues/pools it reads from and writes to.
    ///
    /// # Errors
    /// Returns [`JanaError::DuplicatePrefix`] if an arrow with the same
    /// name was already registered, or [`JanaError::PortTypeMismatch`] if
    /// a resource id is bound as a queue by one arrow and a pool by
    /// another.
    pub fn register(&mut self, arrow: Arc<dyn Arrow>, ports: Vec<PortBinding>) -> JanaResult<()> {
        let name = arrow.name().to_string();
        if self.arrows.contains_key(&name) {
            return Err(JanaError::DuplicatePrefix(name));
        }

        for port in &ports {
            let usage = self.resources.entry(port.resource.clone()).or_default();
            match usage.kind {
                None => usage.kind = Some(port.kind),
                Some(existing) if existing != port.kind => {
                    return Err(JanaError::PortTypeMismatch {
                        from: name.clone(),
                        to: port.resource.clone(),
                        expected: format!("{existing:?}"),
                        found: format!("{:?}", port.kind),
                    });
                }
                _ => {}
            }
            match port.direction {
                PortDirection::Output => usage.producers.push(name.clone()),
                PortDirection::Input => usage.consumers.push(name.clone()),
            }
        }

        self.order.push(name.clone());
        self.arrows.insert(name, ArrowEntry { arrow, ports });
        Ok(())
    }

    /// Register the per-level event pool so the frozen topology can report
    /// on it (checked-out counts, shutdown draining) without every caller
    /// threading `Arc<Pool<Event>>` through separately.
    pub fn register_event_pool(&mut self, level: EventLevel, pool: Arc<Pool<Event>>) {
        self.event_pools.insert(level, pool);
    }

    /// Tag `sink -> source` as the explicit pool-recycle edge: scheduling,
    /// not ownership (Design Notes "Cyclic references"). The freeze-time
    /// cycle check ignores edges tagged this way.
    pub fn tag_recycle_edge(&mut self, sink: impl Into<String>, source: impl Into<String>) {
        self.recycle_edges.insert((sink.into(), source.into()));
    }

    /// Validate every structural invariant and produce an immutable
    /// [`Topology`]. Consumes the builder; no further registration is
    /// possible afterward.
    ///
    /// # Errors
    /// See the module documentation for the invariants checked.
    pub fn freeze(self) -> JanaResult<Topology> {
        for (resource, usage) in &self.resources {
            match usage.kind {
                Some(PortKind::Queue) => {
                    if usage.producers.len() != 1 {
                        let arrow = usage
                            .consumers
                            .first()
                            .or_else(|| usage.producers.first())
                            .cloned()
                            .unwrap_or_default();
                        return Err(JanaError::UnwiredPort {
                            arrow,
                            direction: "output",
                            port: resource.clone(),
                        });
                    }
                    if usage.consumers.len() != 1 {
                        let arrow = usage
                            .producers
                            .first()
                            .cloned()
                            .unwrap_or_default();
                        return Err(JanaError::UnwiredPort {
                            arrow,
                            direction: "input",
                            port: resource.clone(),
                        });
                    }
                }
                Some(PortKind::Pool) => {
                    if usage.producers.is_empty() {
                        let arrow = usage.consumers.first().cloned().unwrap_or_default();
                        return Err(JanaError::UnwiredPort {
                            arrow,
                            direction: "output",
                            port: resource.clone(),
                        });
                    }
                    if usage.consumers.is_empty() {
                        let arrow = usage.producers.first().cloned().unwrap_or_default();
                        return Err(JanaError::UnwiredPort {
                            arrow,
                            direction: "input",
                            port: resource.clone(),
                        });
                    }
                }
                None => unreachable!("a resource entry always has at least one binding"),
            }
        }

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for usage in self.resources.values() {
            for producer in &usage.producers {
                for consumer in &usage.consumers {
                    if self.recycle_edges.contains(&(producer.clone(), consumer.clone())) {
                        continue;
                    }
                    adjacency.entry(producer.clone()).or_default().push(consumer.clone());
                }
            }
        }

        let topo_order = topological_sort(&self.order, &adjacency)?;

        let sinks: HashSet<&str> = self
            .arrows
            .values()
            .filter(|e| e.arrow.is_sink())
            .map(|e| e.arrow.name())
            .collect();

        for entry in self.arrows.values() {
            if entry.arrow.is_source() && !reaches_any(&adjacency, entry.arrow.name(), &sinks) {
                return Err(JanaError::SourceUnreachable {
                    arrow: entry.arrow.name().to_string(),
                });
            }
        }

        let sources = self
            .order
            .iter()
            .filter(|n| self.arrows[*n].arrow.is_source())
            .cloned()
            .collect();
        let sink_names = self
            .order
            .iter()
            .filter(|n| self.arrows[*n].arrow.is_sink())
            .cloned()
            .collect();
        let arrows = self
            .order
            .iter()
            .map(|n| self.arrows[n].arrow.clone())
            .collect();

        // Reverse topological order: sinks finalize first, sources last,
        // matching the scheduler's termination walk (spec.md §4.6).
        let finalize_order: Vec<String> = topo_order.into_iter().rev().collect();

        Ok(Topology {
            arrows,
            sources,
            sinks: sink_names,
            event_pools: self.event_pools,
            finalize_order,
            active: AtomicBool::new(true),
        })
    }
}

/// DFS-based topological sort (source-first) that also rejects cycles
/// other than the ones already excluded via `tag_recycle_edge`.
fn topological_sort(order: &[String], adjacency: &HashMap<String, Vec<String>>) -> JanaResult<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut postorder: Vec<String> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        postorder: &mut Vec<String>,
    ) -> JanaResult<()> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(JanaError::TopologyCycle { arrow: node.to_string() });
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(next) = adjacency.get(node) {
            for n in next {
                visit(n.as_str(), adjacency, marks, postorder)?;
            }
        }
        marks.insert(node, Mark::Done);
        postorder.push(node.to_string());
        Ok(())
    }

    for name in order {
        visit(name.as_str(), adjacency, &mut marks, &mut postorder)?;
    }
    // Postorder visits a node only after everything it points to; reversing
    // it yields a valid source-first topological order.
    postorder.reverse();
    Ok(postorder)
}

fn reaches_any(adjacency: &HashMap<String, Vec<String>>, start: &str, targets: &HashSet<&str>) -> bool {
    let mut stack = vec![start.to_string()];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if targets.contains(node.as_str()) {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = adjacency.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }
    false
}

/// The frozen arrow/queue/pool graph. No structural mutation is possible
/// once built; only the runtime-mutable `active` flag and the per-arrow
/// metrics (owned by the arrows themselves) change after this point.
pub struct Topology {
    arrows: Vec<Arc<dyn Arrow>>,
    sources: Vec<String>,
    sinks: Vec<String>,
    event_pools: HashMap<EventLevel, Arc<Pool<Event>>>,
    finalize_order: Vec<String>,
    active: AtomicBool,
}

impl Topology {
    /// All arrows, in registration order.
    #[must_use]
    pub fn arrows(&self) -> &[Arc<dyn Arrow>] {
        &self.arrows
    }

    /// Look up an arrow by name.
    #[must_use]
    pub fn arrow(&self, name: &str) -> Option<&Arc<dyn Arrow>> {
        self.arrows.iter().find(|a| a.name() == name)
    }

    /// Names of every source arrow.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Names of every sink arrow.
    #[must_use]
    pub fn sinks(&self) -> &[String] {
        &self.sinks
    }

    /// Arrow names in reverse topological order (sinks first, sources
    /// last), the order the scheduler finalizes them in on termination.
    #[must_use]
    pub fn finalize_order(&self) -> &[String] {
        &self.finalize_order
    }

    /// The event pool registered for `level`, if any.
    #[must_use]
    pub fn event_pool(&self, level: EventLevel) -> Option<&Arc<Pool<Event>>> {
        self.event_pools.get(&level)
    }

    /// Whether the topology is still actively being driven. Flipped to
    /// `false` by the scheduler once every source has finished and every
    /// queue has drained.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the topology inactive. Idempotent.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// True once every source arrow reports no further pending input
    /// (i.e. has finished) and every queue it feeds has drained. Used by
    /// the scheduler's termination check; queue drainage itself is
    /// inferred from each arrow's own `has_pending_input`.
    #[must_use]
    pub fn all_sources_finished(&self) -> bool {
        self.arrows
            .iter()
            .filter(|a| a.is_source())
            .all(|a| !a.has_pending_input())
    }
}
