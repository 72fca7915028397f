//! Bounded mailbox queues and per-location object pools for the dataflow
//! engine.
//!
//! This crate provides the two resource primitives that every arrow in the
//! topology pulls from and pushes to:
//!
//! - [`Mailbox<T>`]: a bounded FIFO queue partitioned by NUMA-style
//!   location, used to pass work items (event pointers) between arrows.
//! - [`Pool<T>`]: a per-location object pool, used to recycle events and
//!   other heap-allocated resources instead of allocating them per event.
//!
//! Both are synchronous and non-blocking: every operation either succeeds
//! immediately, comes up short, or reports contention, so that a worker
//! thread can always go try a different arrow rather than park on a lock.
//! Neither type uses `async`; the engine's worker threads run to
//! completion on every call, matching the framework's pull-based,
//! coroutine-free threading model.

pub mod mailbox;
pub mod pool;

pub use mailbox::{Mailbox, QueueStatus};
pub use pool::{Limit, Pool};
