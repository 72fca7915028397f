//! Bounded, location-partitioned mailbox queue (C1).
//!
//! A [`Mailbox<T>`] is a many-to-many FIFO of owned `T`s, partitioned by a
//! NUMA-style *location id*. Each location has its own sub-queue guarded by
//! a [`parking_lot::Mutex`]; contended operations fail fast with
//! [`QueueStatus::Congested`] rather than block, since a worker that can't
//! make progress on one arrow should go try another rather than spin on a
//! lock.
//!
//! # Reservation protocol
//!
//! A producer arrow must [`reserve`](Mailbox::reserve) capacity on its
//! *output* mailbox before it pops work from its *input*. The reserved count
//! is later redeemed with [`push_and_unreserve`](Mailbox::push_and_unreserve).
//! This guarantees that an item already popped from the input can always be
//! placed on the output — the arrow never has to put something back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Outcome of a mailbox operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// The operation found nothing to do (queue empty on pop).
    Empty,
    /// The queue is at its hard capacity; the operation could not proceed.
    Full,
    /// The location's lock was contended, or the queue is between its soft
    /// and hard capacity: the caller should back off rather than retry hard.
    Congested,
    /// The operation succeeded and the caller has the returned item(s).
    Ready,
    /// The mailbox has been closed for this location; no further pushes
    /// will be accepted and pops should stop once it drains.
    Finished,
}

struct Location<T> {
    queue: Mutex<VecDeque<T>>,
    reserved: AtomicUsize,
    finished: AtomicBool,
}

impl<T> Location<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            reserved: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }
}

/// A bounded, multi-location FIFO of `T`.
///
/// `soft_capacity` governs when [`reserve`](Mailbox::reserve) starts
/// returning [`QueueStatus::Congested`] instead of granting the full
/// request; `hard_capacity` is the real bound past which it returns
/// [`QueueStatus::Full`]. Setting them equal (the default) collapses the
/// two into a single threshold.
pub struct Mailbox<T> {
    locations: Vec<Location<T>>,
    soft_capacity: usize,
    hard_capacity: usize,
    stealing: bool,
}

impl<T> Mailbox<T> {
    /// Create a mailbox with `location_count` independent sub-queues, each
    /// bounded at `hard_capacity` items, with stealing disabled.
    #[must_use]
    pub fn new(location_count: usize, hard_capacity: usize) -> Self {
        Self::with_soft_capacity(location_count, hard_capacity, hard_capacity)
    }

    /// Create a mailbox with a distinct soft/hard capacity (see struct docs).
    #[must_use]
    pub fn with_soft_capacity(
        location_count: usize,
        soft_capacity: usize,
        hard_capacity: usize,
    ) -> Self {
        assert!(location_count >= 1, "mailbox needs at least one location");
        assert!(soft_capacity <= hard_capacity);
        Self {
            locations: (0..location_count).map(|_| Location::new()).collect(),
            soft_capacity,
            hard_capacity,
            stealing: false,
        }
    }

    /// Enable round-robin stealing on [`pop_and_reserve`](Mailbox::pop_and_reserve).
    #[must_use]
    pub fn with_stealing(mut self, enabled: bool) -> Self {
        self.stealing = enabled;
        self
    }

    /// Number of locations this mailbox is partitioned into.
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Total number of items resident across all locations (not counting
    /// reservations). Used for metrics and termination detection.
    #[must_use]
    pub fn size(&self) -> usize {
        self.locations.iter().map(|l| l.queue.lock().len()).sum()
    }

    /// Reserved-but-not-yet-pushed count for `location`.
    #[must_use]
    pub fn reserved_count(&self, location: usize) -> usize {
        self.locations[location % self.locations.len()]
            .reserved
            .load(Ordering::Acquire)
    }

    /// Mark a location finished: no further pushes are accepted there.
    pub fn close(&self, location: usize) {
        self.locations[location % self.locations.len()]
            .finished
            .store(true, Ordering::Release);
    }

    /// True once every location has been closed and drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.locations
            .iter()
            .all(|l| l.finished.load(Ordering::Acquire) && l.queue.lock().is_empty())
    }

    /// Reserve capacity for up to `max` items (at least `min`) on
    /// `location`'s output before popping from the matching input.
    ///
    /// Returns the number of slots actually reserved and the status. A
    /// caller that receives fewer than `max` (but at least `min`) reserved
    /// slots must push no more than the reserved count.
    pub fn reserve(&self, min: usize, max: usize, location: usize) -> (usize, QueueStatus) {
        let loc = &self.locations[location % self.locations.len()];
        if loc.finished.load(Ordering::Acquire) {
            return (0, QueueStatus::Finished);
        }
        let Some(queue) = loc.queue.try_lock() else {
            return (0, QueueStatus::Congested);
        };
        let used = queue.len() + loc.reserved.load(Ordering::Acquire);
        drop(queue);

        if used >= self.hard_capacity {
            return (0, QueueStatus::Full);
        }
        let available = self.hard_capacity - used;
        let granted = max.min(available);
        if granted < min {
            let status = if used >= self.soft_capacity {
                QueueStatus::Congested
            } else {
                QueueStatus::Full
            };
            return (0, status);
        }
        loc.reserved.fetch_add(granted, Ordering::AcqRel);
        (granted, QueueStatus::Ready)
    }

    /// Push up to `reserved` items (redeeming a prior [`reserve`] call) and
    /// release any unused portion of the reservation back to the pool.
    pub fn push_and_unreserve(&self, items: Vec<T>, reserved: usize, location: usize) -> QueueStatus {
        assert!(items.len() <= reserved, "pushed more than was reserved");
        let loc = &self.locations[location % self.locations.len()];
        {
            let mut queue = loc.queue.lock();
            queue.extend(items);
        }
        loc.reserved.fetch_sub(reserved, Ordering::AcqRel);
        QueueStatus::Ready
    }

    /// Push without going through the reservation protocol. Used by
    /// sources, which have no upstream input to guarantee symmetry with.
    pub fn try_push(&self, items: Vec<T>, location: usize) -> QueueStatus {
        let loc = &self.locations[location % self.locations.len()];
        if loc.finished.load(Ordering::Acquire) {
            return QueueStatus::Finished;
        }
        let Some(mut queue) = loc.queue.try_lock() else {
            return QueueStatus::Congested;
        };
        let used = queue.len() + loc.reserved.load(Ordering::Acquire);
        if used + items.len() > self.hard_capacity {
            return QueueStatus::Full;
        }
        queue.extend(items);
        QueueStatus::Ready
    }

    /// Pop between `min` and `max` items from `location`. If `stealing` is
    /// enabled and this location comes up short, scans the remaining
    /// locations round-robin starting just after `location`.
    pub fn pop_and_reserve(&self, min: usize, max: usize, location: usize) -> (Vec<T>, QueueStatus) {
        let n = self.locations.len();
        let start = location % n;
        let (items, status) = self.pop_one_location(start, min, max);
        if status == QueueStatus::Ready || !self.stealing {
            return (items, status);
        }
        for offset in 1..n {
            let idx = (start + offset) % n;
            let (items, status) = self.pop_one_location(idx, min, max);
            if status == QueueStatus::Ready {
                return (items, status);
            }
        }
        (items, status)
    }

    fn pop_one_location(&self, idx: usize, min: usize, max: usize) -> (Vec<T>, QueueStatus) {
        let loc = &self.locations[idx];
        let Some(mut queue) = loc.queue.try_lock() else {
            return (Vec::new(), QueueStatus::Congested);
        };
        if queue.len() < min {
            let status = if loc.finished.load(Ordering::Acquire) && queue.is_empty() {
                QueueStatus::Finished
            } else {
                QueueStatus::Empty
            };
            return (Vec::new(), status);
        }
        let count = max.min(queue.len());
        let items = queue.drain(..count).collect();
        (items, QueueStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_push_round_trips() {
        let mb: Mailbox<i32> = Mailbox::new(1, 4);
        let (granted, status) = mb.reserve(1, 2, 0);
        assert_eq!(status, QueueStatus::Ready);
        assert_eq!(granted, 2);
        assert_eq!(mb.reserved_count(0), 2);

        let status = mb.push_and_unreserve(vec![1, 2], granted, 0);
        assert_eq!(status, QueueStatus::Ready);
        assert_eq!(mb.reserved_count(0), 0);
        assert_eq!(mb.size(), 2);
    }

    #[test]
    fn capacity_one_alternates_without_loss() {
        let mb: Mailbox<i32> = Mailbox::new(1, 1);
        for i in 0..10 {
            let (granted, status) = mb.reserve(1, 1, 0);
            assert_eq!(status, QueueStatus::Ready);
            mb.push_and_unreserve(vec![i], granted, 0);
            let (popped, status) = mb.pop_and_reserve(1, 1, 0);
            assert_eq!(status, QueueStatus::Ready);
            assert_eq!(popped, vec![i]);
        }
    }

    #[test]
    fn full_queue_refuses_reservation() {
        let mb: Mailbox<i32> = Mailbox::new(1, 2);
        let (granted, _) = mb.reserve(1, 2, 0);
        mb.push_and_unreserve(vec![1, 2], granted, 0);
        let (granted, status) = mb.reserve(1, 1, 0);
        assert_eq!(granted, 0);
        assert_eq!(status, QueueStatus::Full);
    }

    #[test]
    fn soft_capacity_signals_congestion_before_hard_limit() {
        let mb: Mailbox<i32> = Mailbox::with_soft_capacity(1, 2, 4);
        let (granted, _) = mb.reserve(1, 2, 0);
        mb.push_and_unreserve(vec![1, 2], granted, 0);
        // At soft capacity (2 used), requesting more than remains-to-hard
        // (2 more slots) but below hard should still grant what's left...
        let (granted, status) = mb.reserve(1, 1, 0);
        assert_eq!(status, QueueStatus::Ready);
        assert_eq!(granted, 1);
        // ...but asking for more than remains to hard-capacity, while we're
        // already past soft, reports Congested rather than Full.
        let (granted, status) = mb.reserve(3, 3, 0);
        assert_eq!(granted, 0);
        assert_eq!(status, QueueStatus::Congested);
    }

    #[test]
    fn stealing_scans_other_locations_round_robin() {
        let mb: Mailbox<i32> = Mailbox::new(2, 4).with_stealing(true);
        let (granted, _) = mb.reserve(1, 1, 1);
        mb.push_and_unreserve(vec![42], granted, 1);

        let (items, status) = mb.pop_and_reserve(1, 1, 0);
        assert_eq!(status, QueueStatus::Ready);
        assert_eq!(items, vec![42]);
    }

    #[test]
    fn closed_location_rejects_new_pushes() {
        let mb: Mailbox<i32> = Mailbox::new(1, 4);
        mb.close(0);
        let status = mb.try_push(vec![1], 0);
        assert_eq!(status, QueueStatus::Finished);
    }

    #[test]
    fn is_finished_requires_drain() {
        let mb: Mailbox<i32> = Mailbox::new(1, 4);
        mb.try_push(vec![1], 0);
        mb.close(0);
        assert!(!mb.is_finished());
        mb.pop_and_reserve(1, 1, 0);
        assert!(mb.is_finished());
    }

    #[test]
    fn reservation_balances_to_zero_after_clean_drain() {
        let mb: Mailbox<i32> = Mailbox::new(1, 4);
        let (granted, _) = mb.reserve(1, 3, 0);
        mb.push_and_unreserve(vec![1, 2, 3], granted, 0);
        mb.pop_and_reserve(1, 3, 0);
        assert_eq!(mb.reserved_count(0), 0);
    }
}
