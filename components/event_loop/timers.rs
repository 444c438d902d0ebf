/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The ordered timer queue: a binary heap of deadlines with opaque,
//! removable handles. Removal after expiry but before dispatch is a no-op,
//! so callers never have to reason about races with their own callbacks.

use std::cmp;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;

use crate::EventLoop;

pub type TimerCallback = Box<dyn FnOnce(&mut EventLoop)>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TimerHandle(u64);

struct ScheduledTimer {
    deadline: Instant,
    handle: TimerHandle,
    callback: TimerCallback,
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &ScheduledTimer) -> cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline is on
        // top, with insertion order breaking ties.
        self.deadline
            .cmp(&other.deadline)
            .then(self.handle.0.cmp(&other.handle.0))
            .reverse()
    }
}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &ScheduledTimer) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for ScheduledTimer {}
impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &ScheduledTimer) -> bool {
        self.handle == other.handle
    }
}

#[derive(Default)]
pub struct Timers {
    heap: BinaryHeap<ScheduledTimer>,
    cancelled: FxHashSet<TimerHandle>,
    next_handle: u64,
}

impl Timers {
    pub fn add(&mut self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.add_at(Instant::now() + delay, callback)
    }

    pub fn add_at(&mut self, deadline: Instant, callback: TimerCallback) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.heap.push(ScheduledTimer {
            deadline,
            handle,
            callback,
        });
        handle
    }

    /// Cancels a pending timer. Unknown and already-fired handles are
    /// ignored.
    pub fn remove(&mut self, handle: TimerHandle) {
        if self.heap.iter().any(|timer| timer.handle == handle) {
            self.cancelled.insert(handle);
        }
    }

    /// Pops the callback of the next due timer, skipping cancelled entries.
    pub fn take_due(&mut self, now: Instant) -> Option<TimerCallback> {
        loop {
            if self.heap.peek()?.deadline > now {
                return None;
            }
            let timer = self.heap.pop()?;
            if self.cancelled.remove(&timer.handle) {
                continue;
            }
            return Some(timer.callback);
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(timer) = self.heap.peek() {
            if self.cancelled.contains(&timer.handle) {
                let timer = self.heap.pop()?;
                self.cancelled.remove(&timer.handle);
                continue;
            }
            return Some(timer.deadline);
        }
        None
    }

    /// The poll timeout in milliseconds: -1 without timers, 0 when one is
    /// already due, otherwise the time to the earliest deadline, rounded up
    /// so the poll never wakes early.
    pub fn poll_timeout_ms(&mut self, now: Instant) -> i32 {
        let Some(deadline) = self.next_deadline() else {
            return -1;
        };
        let Some(remaining) = deadline.checked_duration_since(now) else {
            return 0;
        };
        remaining
            .as_millis()
            .saturating_add(1)
            .min(i32::MAX as u128) as i32
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() == self.cancelled.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn recording(
        order: &Rc<RefCell<Vec<&'static str>>>,
        name: &'static str,
    ) -> TimerCallback {
        let order = order.clone();
        Box::new(move |_| order.borrow_mut().push(name))
    }

    #[test]
    fn due_timers_pop_in_deadline_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut timers = Timers::default();
        let now = Instant::now();
        timers.add_at(now + Duration::from_millis(2), recording(&order, "late"));
        timers.add_at(now, recording(&order, "early"));
        timers.add_at(now + Duration::from_millis(1), recording(&order, "middle"));

        let mut event_loop = EventLoop::new();
        let later = now + Duration::from_millis(5);
        while let Some(callback) = timers.take_due(later) {
            callback(&mut event_loop);
        }
        assert_eq!(*order.borrow(), vec!["early", "middle", "late"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn not_yet_due_timers_stay_queued() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut timers = Timers::default();
        let now = Instant::now();
        timers.add_at(now + Duration::from_secs(60), recording(&order, "later"));
        assert!(timers.take_due(now).is_none());
        assert!(!timers.is_empty());
        assert!(timers.poll_timeout_ms(now) > 0);
    }

    #[test]
    fn removed_timer_never_fires() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut timers = Timers::default();
        let now = Instant::now();
        let keep = timers.add_at(now, recording(&order, "keep"));
        let drop_handle = timers.add_at(now, recording(&order, "drop"));
        timers.remove(drop_handle);

        let mut event_loop = EventLoop::new();
        while let Some(callback) = timers.take_due(now) {
            callback(&mut event_loop);
        }
        assert_eq!(*order.borrow(), vec!["keep"]);
        // Removing either handle again is a no-op.
        timers.remove(drop_handle);
        timers.remove(keep);
        assert!(timers.is_empty());
    }

    #[test]
    fn removal_after_expiry_is_a_noop() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut timers = Timers::default();
        let now = Instant::now();
        let handle = timers.add_at(now, recording(&order, "fired"));
        let callback = timers.take_due(now).expect("due");
        timers.remove(handle);
        let mut event_loop = EventLoop::new();
        callback(&mut event_loop);
        assert_eq!(*order.borrow(), vec!["fired"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn timeout_is_zero_for_due_and_negative_for_none() {
        let mut timers = Timers::default();
        let now = Instant::now();
        assert_eq!(timers.poll_timeout_ms(now), -1);
        timers.add_at(now, Box::new(|_| {}));
        assert_eq!(timers.poll_timeout_ms(now + Duration::from_millis(1)), 0);
    }
}
