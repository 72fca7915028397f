//! Worker-to-CPU/location mapping.
//!
//! Grounded on `JProcessorMapping.h`/`.cc`. The original queries `hwloc`
//! for the machine's socket/NUMA-domain/core topology; no such discovery
//! crate is part of this corpus's dependency stack, so this falls back to
//! `std::thread::available_parallelism`/`num_cpus` for a flat cpu-id
//! mapping and degrades to [`Locality::Global`] with a warning rather than
//! fabricating a NUMA layout it cannot observe.

use tracing::warn;

/// How worker threads should be pinned relative to the data they touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityStrategy {
    /// No pinning; the OS scheduler places threads freely.
    None,
    /// Prefer spreading workers across memory domains (I/O-bound work).
    MemoryBound,
    /// Prefer packing workers onto as few domains as possible (CPU-bound
    /// work, to maximize cache locality).
    ComputeBound,
}

/// Granularity at which workers are grouped for pool/queue locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalityStrategy {
    /// One location for the whole machine.
    Global,
    /// One location per socket.
    SocketLocal,
    /// One location per NUMA domain.
    NumaDomainLocal,
    /// One location per physical core.
    CoreLocal,
    /// One location per logical CPU.
    CpuLocal,
}

/// Where a single worker landed: which location it feeds from, and which
/// logical CPU it should try to pin itself to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locality {
    /// Index into the topology's per-location pools/queues this worker
    /// should prefer.
    pub location_id: usize,
    /// Logical CPU id to pin this worker's thread to.
    pub cpu_id: usize,
}

/// The full worker-id -> (cpu, location) table for one engine run.
pub struct ProcessorMapping {
    affinity: AffinityStrategy,
    locality: LocalityStrategy,
    rows: Vec<Locality>,
    location_count: usize,
}

impl ProcessorMapping {
    /// Build a mapping for `nthreads` workers under the given strategies.
    ///
    /// Queries `num_cpus::get()` for the logical CPU count. Any locality
    /// strategy other than [`LocalityStrategy::Global`] degrades to
    /// `Global` with a warning, since this corpus has no topology-discovery
    /// crate to resolve socket/NUMA/core boundaries from.
    #[must_use]
    pub fn new(nthreads: usize, affinity: AffinityStrategy, locality: LocalityStrategy) -> Self {
        let cpu_count = num_cpus::get().max(1);
        let effective_locality = match locality {
            LocalityStrategy::Global => LocalityStrategy::Global,
            other => {
                warn!(
                    requested = ?other,
                    "no hardware topology discovery available; falling back to a single global location"
                );
                LocalityStrategy::Global
            }
        };
        let location_count = 1;

        let rows = (0..nthreads.max(1))
            .map(|worker_id| Locality {
                location_id: 0,
                cpu_id: worker_id % cpu_count,
            })
            .collect();

        Self {
            affinity,
            locality: effective_locality,
            rows,
            location_count,
        }
    }

    /// Number of distinct locations workers are grouped into.
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.location_count
    }

    /// The logical CPU id `worker_id` should pin to. Wraps modulo the
    /// number of rows if `worker_id` exceeds the configured thread count.
    #[must_use]
    pub fn cpu_id(&self, worker_id: usize) -> usize {
        self.rows[worker_id % self.rows.len()].cpu_id
    }

    /// The location id `worker_id` should read/write pools and queues
    /// through.
    #[must_use]
    pub fn location_id(&self, worker_id: usize) -> usize {
        self.rows[worker_id % self.rows.len()].location_id
    }

    /// The affinity strategy this mapping was built with.
    #[must_use]
    pub fn affinity(&self) -> AffinityStrategy {
        self.affinity
    }

    /// The locality strategy actually in effect (after any fallback).
    #[must_use]
    pub fn locality(&self) -> LocalityStrategy {
        self.locality
    }
}
