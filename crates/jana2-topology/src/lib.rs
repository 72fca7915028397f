//! The frozen dataflow graph: arrows, queues, pools, and the wiring that
//! connects them (C4/C5).
//!
//! This crate sits between the per-event data model (`jana2-core`) and the
//! scheduling/worker runtime (`jana2-engine`). It owns:
//!
//! - [`arrow`]: the `Arrow` trait and its concrete variants (source, map,
//!   unfold, fold, sink, multilevel source).
//! - [`metrics`]: the per-arrow metrics record each variant updates on
//!   every `fire`.
//! - [`topology`]: the three-phase builder (register → wire → freeze) and
//!   the structural invariants checked at freeze time.
//! - [`wiring`]: parsing of the optional declarative TOML wiring file.
//! - [`stringification`]: a serializable snapshot of a frozen topology,
//!   for `--dump-topology`-style debugging output.

pub mod arrow;
pub mod metrics;
pub mod stringification;
pub mod topology;
pub mod wiring;

pub use arrow::{Arrow, ArrowFireResult, EmitStatus, Processor, UnfoldStatus};
pub use metrics::{ArrowMetrics, MetricsSnapshot, Status};
pub use stringification::TopologySummary;
pub use topology::{PortBinding, PortDirection, PortKind, Topology, TopologyBuilder};
pub use wiring::{WiringEntry, WiringTable};
