// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! One-second tick fanout and deadline-ordered deferred actions.
//!
//! The broker actor (and the bridge controller) each drive a single
//! `tokio::time::interval` tick rather than spawning a timer task per
//! session/connection: framer idle-timeout, session expiry, keep-alive,
//! ban countdown, will-delay and bridge-reconnect scheduling are all driven
//! off the same per-second beat, matching the single-threaded-actor model.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use tokio::time::{self, Interval, MissedTickBehavior};

/// One-second heartbeat shared by every actor's `tokio::select!` loop.
#[derive(Debug)]
pub struct Ticker {
    interval: Interval,
}

impl Ticker {
    #[must_use]
    pub fn new() -> Self {
        let mut interval = time::interval(Duration::from_secs(1));
        // A tick missed because the actor was busy is dropped rather than
        // fired in a burst; timer-driven work below is a "has enough time
        // passed" check, not an exactly-once clock.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await.into()
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending deferred action, ordered by `deadline` (earliest first).
struct Scheduled<T> {
    deadline: Instant,
    item: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl<T> Eq for Scheduled<T> {}
impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline)
    }
}

/// A min-heap of `T` values keyed by when they become due, polled once per
/// tick. Used for will-delay publication and bridge reconnect backoff: both
/// are "fire once, at or after some future instant" actions with no need
/// for external cancellation by anything other than draining the item.
pub struct DelayQueue<T> {
    heap: BinaryHeap<Scheduled<T>>,
}

impl<T> DelayQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, delay: Duration, item: T) {
        self.heap.push(Scheduled {
            deadline: Instant::now() + delay,
            item,
        });
    }

    /// Remove and return every item whose deadline has passed as of `now`.
    pub fn drain_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while matches!(self.heap.peek(), Some(scheduled) if scheduled.deadline <= now) {
            if let Some(scheduled) = self.heap.pop() {
                due.push(scheduled.item);
            }
        }
        due
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_queue_orders_by_deadline() {
        let mut queue: DelayQueue<&str> = DelayQueue::new();
        queue.schedule(Duration::from_secs(10), "late");
        queue.schedule(Duration::from_secs(1), "early");
        assert!(queue.drain_due(Instant::now()).is_empty());
        let due = queue.drain_due(Instant::now() + Duration::from_secs(5));
        assert_eq!(due, vec!["early"]);
        let due = queue.drain_due(Instant::now() + Duration::from_secs(20));
        assert_eq!(due, vec!["late"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_due_is_empty_on_empty_queue() {
        let mut queue: DelayQueue<u8> = DelayQueue::new();
        assert!(queue.drain_due(Instant::now()).is_empty());
    }
}
