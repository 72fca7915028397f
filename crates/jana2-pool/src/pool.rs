//! Per-location object pool (C2).
//!
//! A [`Pool<T>`] hands out reusable `T`s so that the engine does not have
//! to allocate one per event per arrow. Each location owns an independent
//! stack of available items, guarded by a [`parking_lot::Mutex`]; there is
//! no cross-location recycling — an item checked out at location 2 is
//! always returned to location 2's stack.
//!
//! Two exhaustion policies are supported, matching JANA2's own pool:
//!
//! - [`Limit::Strict`]: once `initial_size` items are checked out, further
//!   `pop` calls return fewer than requested (down to zero) until items
//!   come back. Total outstanding items never exceeds the configured size.
//! - [`Limit::Elastic`]: when a location's stack runs dry, the pool grows
//!   it by allocating fresh items with the pool's `make` function. Items
//!   allocated past `initial_size` are not kept: when returned, if the
//!   location is already back at or above `initial_size`, the surplus is
//!   dropped instead of being pushed back onto the stack. This keeps the
//!   steady-state footprint bounded without tracking provenance per item,
//!   unlike the original's pointer-range slab check.

use parking_lot::Mutex;
use tracing::{trace, warn};

/// Exhaustion policy for a [`Pool<T>`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Never allocate past `initial_size`; `pop` may come up short.
    Strict,
    /// Allocate past `initial_size` on demand; surplus is dropped on return.
    Elastic,
}

struct LocationStack<T> {
    available: Mutex<Vec<Box<T>>>,
    current_size: Mutex<usize>,
}

impl<T> LocationStack<T> {
    fn new() -> Self {
        Self {
            available: Mutex::new(Vec::new()),
            current_size: Mutex::new(0),
        }
    }
}

/// A per-location pool of reusable `T`s.
pub struct Pool<T> {
    locations: Vec<LocationStack<T>>,
    make: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    initial_size: usize,
    limit: Limit,
}

impl<T> Pool<T> {
    /// Build a pool with `location_count` independent stacks, each seeded
    /// with `initial_size` items produced by `make`. `reset` runs on every
    /// item just before it is handed out again, to clear per-event state.
    pub fn new<F, R>(location_count: usize, initial_size: usize, limit: Limit, make: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        assert!(location_count >= 1, "pool needs at least one location");
        let locations: Vec<LocationStack<T>> = (0..location_count)
            .map(|_| LocationStack::new())
            .collect();
        for loc in &locations {
            let mut available = loc.available.lock();
            for _ in 0..initial_size {
                available.push(Box::new(make()));
            }
            *loc.current_size.lock() = initial_size;
        }
        Self {
            locations,
            make: Box::new(make),
            reset: Box::new(reset),
            initial_size,
            limit,
        }
    }

    /// Number of locations this pool is partitioned into.
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Number of items currently checked out of `location` (not resident in
    /// its available stack).
    #[must_use]
    pub fn checked_out(&self, location: usize) -> usize {
        let loc = &self.locations[location % self.locations.len()];
        let size = *loc.current_size.lock();
        let avail = loc.available.lock().len();
        size.saturating_sub(avail)
    }

    /// Check out a single item from `location`, or `None` if the location
    /// is strict and exhausted.
    pub fn get(&self, location: usize) -> Option<Box<T>> {
        let mut items = self.pop(1, 1, location);
        items.pop()
    }

    /// Return a single item to `location`.
    pub fn put(&self, item: Box<T>, location: usize) {
        self.push(vec![item], location);
    }

    /// Pop between `min` and `max` items from `location`. Returns fewer
    /// than `max` (possibly zero) under [`Limit::Strict`] exhaustion; under
    /// [`Limit::Elastic`], grows the location by allocating fresh items
    /// instead of coming up short.
    pub fn pop(&self, min: usize, max: usize, location: usize) -> Vec<Box<T>> {
        let loc = &self.locations[location % self.locations.len()];
        let mut available = loc.available.lock();
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            match available.pop() {
                Some(mut item) => {
                    (self.reset)(&mut item);
                    out.push(item);
                }
                None => break,
            }
        }
        drop(available);

        if out.len() < max && self.limit == Limit::Elastic {
            let mut size = loc.current_size.lock();
            let deficit = max - out.len();
            if out.len() < min || deficit > 0 {
                warn!(
                    location,
                    current_size = *size,
                    deficit,
                    "pool location exhausted, growing elastically"
                );
                for _ in 0..deficit {
                    out.push(Box::new((self.make)()));
                    *size += 1;
                }
            }
        }

        if out.len() < min {
            trace!(location, requested = min, got = out.len(), "pool underfilled request");
        }
        out
    }

    /// Return `items` to `location`. Under [`Limit::Elastic`], any item
    /// that would push the location's resident stack past `initial_size`
    /// is dropped instead of recycled, keeping steady-state memory bounded.
    pub fn push(&self, items: Vec<Box<T>>, location: usize) {
        let loc = &self.locations[location % self.locations.len()];
        let mut available = loc.available.lock();
        let mut size = loc.current_size.lock();
        for item in items {
            if self.limit == Limit::Elastic && *size > self.initial_size && available.len() >= self.initial_size
            {
                *size -= 1;
                drop(item);
                continue;
            }
            available.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_pool(initial: usize, limit: Limit) -> (Pool<i32>, Arc<AtomicUsize>) {
        let allocations = Arc::new(AtomicUsize::new(0));
        let alloc_clone = allocations.clone();
        let pool = Pool::new(
            1,
            initial,
            limit,
            move || {
                alloc_clone.fetch_add(1, Ordering::SeqCst);
                0
            },
            |item: &mut i32| *item = 0,
        );
        (pool, allocations)
    }

    #[test]
    fn strict_pool_runs_dry_without_allocating() {
        let (pool, allocations) = counting_pool(2, Limit::Strict);
        assert_eq!(allocations.load(Ordering::SeqCst), 2);

        let a = pool.get(0).unwrap();
        let b = pool.get(0).unwrap();
        assert!(pool.get(0).is_none());

        pool.put(a, 0);
        assert!(pool.get(0).is_some());
        drop(b);
    }

    #[test]
    fn elastic_pool_grows_on_demand() {
        let (pool, allocations) = counting_pool(1, Limit::Elastic);
        assert_eq!(allocations.load(Ordering::SeqCst), 1);

        let _a = pool.get(0).unwrap();
        let _b = pool.get(0).unwrap();
        assert_eq!(allocations.load(Ordering::SeqCst), 2);
        assert_eq!(pool.checked_out(0), 2);
    }

    #[test]
    fn elastic_pool_drops_surplus_on_return() {
        let (pool, _allocations) = counting_pool(1, Limit::Elastic);
        let a = pool.get(0).unwrap();
        let b = pool.get(0).unwrap();
        pool.put(a, 0);
        pool.put(b, 0);
        // current_size grew to 2 but initial_size is 1: the second return
        // should have been dropped rather than recycled.
        assert_eq!(pool.checked_out(0), 0);
    }

    #[test]
    fn reset_runs_on_checkout() {
        let pool = Pool::new(1, 1, Limit::Strict, || 99, |item: &mut i32| *item = -1);
        let item = pool.get(0).unwrap();
        assert_eq!(*item, -1);
    }

    #[test]
    fn locations_are_independent() {
        let pool = Pool::new(2, 1, Limit::Strict, || 0, |item: &mut i32| *item = 0);
        let _ = pool.get(0).unwrap();
        assert!(pool.get(0).is_none());
        assert!(pool.get(1).is_some());
    }
}
