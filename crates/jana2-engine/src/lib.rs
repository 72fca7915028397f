//! Scheduler, worker runtime, and supervisor for the event-processing
//! engine (C6/C7).
//!
//! This crate turns a frozen [`jana2_topology::Topology`] into a running
//! multithreaded pipeline: [`scheduler`] decides which arrow fires next,
//! [`worker`] is the pull-based thread loop that asks it, [`supervisor`]
//! owns the worker pool's lifecycle (run/pause/stop/scale) and the
//! first-exception latch, [`processor_mapping`] assigns worker threads to
//! CPUs, and [`signals`] models the 3-strike SIGINT policy.

pub mod metrics;
pub mod processor_mapping;
pub mod scheduler;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use metrics::PerfSummary;
pub use processor_mapping::{AffinityStrategy, Locality, LocalityStrategy, ProcessorMapping};
pub use scheduler::{ArrowState, Scheduler};
pub use signals::{SignalAction, SignalPolicy};
pub use supervisor::{RunState, Supervisor, SupervisorConfig};
pub use worker::{BackoffStrategy, Worker, WorkerConfig};
