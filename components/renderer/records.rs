/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Bookkeeping for buffer activity, presentation and idle callbacks.
//!
//! Every buffer touched by an update gets an activity record keyed by the
//! round-trip id of that update. Records sit on three chains at once: the
//! buffer's, the target's, and the global id-ordered chain that round-trip
//! echoes retire from the front. A (buffer, target) pair is idle exactly
//! when neither an activity record nor a present record links the two; the
//! moment the last one goes away, the pair's one-shot idle callbacks fire.

use base::arena::{Chain, ChainArena, NodeId};
use base::{FxHashMap, PresentSerial, RoundTripId};
use smallvec::SmallVec;

use crate::{BufferId, IdleCallback, PresentedCallback, PresentedInfo, TargetId};

const BUFFER_CHAIN: usize = 0;
const TARGET_CHAIN: usize = 1;
const GLOBAL_CHAIN: usize = 2;

#[derive(Clone, Copy, Debug)]
struct ActivityRecord {
    buffer: BufferId,
    target: TargetId,
    round_trip: RoundTripId,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct IdleHandle(u64);

/// An idle callback that became runnable, with the pair it was registered
/// for.
pub struct ReadyIdle {
    pub buffer: BufferId,
    pub target: TargetId,
    pub callback: IdleCallback,
}

impl ReadyIdle {
    pub fn run(self) {
        (self.callback)(self.buffer, self.target);
    }
}

struct IdleEntry {
    handle: IdleHandle,
    callback: IdleCallback,
}

/// Tracks which (buffer, target) pairs the host may still be reading from.
#[derive(Default)]
pub struct IdleTracker {
    records: ChainArena<ActivityRecord, 3>,
    /// All records, oldest round trip first.
    global: Chain,
    per_buffer: FxHashMap<BufferId, Chain>,
    per_target: FxHashMap<TargetId, Chain>,
    /// Outstanding presentation serials per pair.
    presents: FxHashMap<(BufferId, TargetId), SmallVec<[PresentSerial; 2]>>,
    idle_callbacks: FxHashMap<(BufferId, TargetId), Vec<IdleEntry>>,
    next_idle_handle: u64,
}

impl IdleTracker {
    /// Records that `buffer` was used on `target` in the update that the
    /// given round trip closes.
    pub fn note_activity(&mut self, buffer: BufferId, target: TargetId, round_trip: RoundTripId) {
        let id = self.records.insert(ActivityRecord {
            buffer,
            target,
            round_trip,
        });
        self.records
            .push_back(BUFFER_CHAIN, self.per_buffer.entry(buffer).or_default(), id);
        self.records
            .push_back(TARGET_CHAIN, self.per_target.entry(target).or_default(), id);
        self.records.push_back(GLOBAL_CHAIN, &mut self.global, id);
    }

    pub fn note_present(&mut self, buffer: BufferId, target: TargetId, serial: PresentSerial) {
        self.presents.entry((buffer, target)).or_default().push(serial);
    }

    /// Retires every record up to and including `round_trip` (echoes arrive
    /// in order) and returns the idle callbacks that became runnable,
    /// already unregistered, together with their pair.
    pub fn acknowledge_round_trip(&mut self, round_trip: RoundTripId) -> Vec<ReadyIdle> {
        let mut retired_pairs: Vec<(BufferId, TargetId)> = Vec::new();
        while let Some(id) = self.records.chain_head(&self.global) {
            let record = *self.records.get(id).expect("chained record exists");
            if record.round_trip > round_trip {
                break;
            }
            self.unlink_record(id, &record);
            if !retired_pairs.contains(&(record.buffer, record.target)) {
                retired_pairs.push((record.buffer, record.target));
            }
        }
        let mut callbacks = Vec::new();
        for (buffer, target) in retired_pairs {
            if self.is_idle(buffer, target) {
                callbacks.extend(self.take_idle_callbacks(buffer, target));
            }
        }
        callbacks
    }

    /// Handles a present-idle notification. Returns the idle callbacks that
    /// became runnable.
    pub fn present_idle(
        &mut self,
        buffer: BufferId,
        target: TargetId,
        serial: PresentSerial,
    ) -> Vec<ReadyIdle> {
        if let Some(serials) = self.presents.get_mut(&(buffer, target)) {
            serials.retain(|s| *s != serial);
            if serials.is_empty() {
                self.presents.remove(&(buffer, target));
            }
        }
        if self.is_idle(buffer, target) {
            self.take_idle_callbacks(buffer, target)
        } else {
            Vec::new()
        }
    }

    pub fn is_idle(&self, buffer: BufferId, target: TargetId) -> bool {
        let has_activity = self
            .per_buffer
            .get(&buffer)
            .is_some_and(|chain| {
                self.records
                    .chain_ids(BUFFER_CHAIN, chain)
                    .iter()
                    .any(|&id| self.records.get(id).is_some_and(|r| r.target == target))
            });
        !has_activity && !self.presents.contains_key(&(buffer, target))
    }

    pub fn add_idle_callback(
        &mut self,
        buffer: BufferId,
        target: TargetId,
        callback: IdleCallback,
    ) -> IdleHandle {
        self.next_idle_handle += 1;
        let handle = IdleHandle(self.next_idle_handle);
        self.idle_callbacks
            .entry((buffer, target))
            .or_default()
            .push(IdleEntry { handle, callback });
        handle
    }

    pub fn cancel_idle_callback(&mut self, handle: IdleHandle) {
        for entries in self.idle_callbacks.values_mut() {
            entries.retain(|entry| entry.handle != handle);
        }
        self.idle_callbacks.retain(|_, entries| !entries.is_empty());
    }

    /// Drops all state attached to a destroyed buffer. Its callbacks are
    /// returned so the caller can run them; the buffer can no longer become
    /// busier.
    pub fn forget_buffer(&mut self, buffer: BufferId) -> Vec<ReadyIdle> {
        if let Some(mut chain) = self.per_buffer.remove(&buffer) {
            let ids = self.records.chain_ids(BUFFER_CHAIN, &chain);
            for id in ids {
                let record = *self.records.get(id).expect("chained record exists");
                self.records.unlink(BUFFER_CHAIN, &mut chain, id);
                if let Some(target_chain) = self.per_target.get_mut(&record.target) {
                    self.records.unlink(TARGET_CHAIN, target_chain, id);
                }
                self.records.unlink(GLOBAL_CHAIN, &mut self.global, id);
                self.records.remove(id);
            }
        }
        self.presents.retain(|&(b, _), _| b != buffer);
        let mut callbacks = Vec::new();
        let pairs: Vec<_> = self
            .idle_callbacks
            .keys()
            .filter(|&&(b, _)| b == buffer)
            .copied()
            .collect();
        for (b, t) in pairs {
            callbacks.extend(self.take_idle_callbacks(b, t));
        }
        callbacks
    }

    /// Drops all state attached to a destroyed target.
    pub fn forget_target(&mut self, target: TargetId) {
        if let Some(mut chain) = self.per_target.remove(&target) {
            let ids = self.records.chain_ids(TARGET_CHAIN, &chain);
            for id in ids {
                let record = *self.records.get(id).expect("chained record exists");
                self.records.unlink(TARGET_CHAIN, &mut chain, id);
                if let Some(buffer_chain) = self.per_buffer.get_mut(&record.buffer) {
                    self.records.unlink(BUFFER_CHAIN, buffer_chain, id);
                }
                self.records.unlink(GLOBAL_CHAIN, &mut self.global, id);
                self.records.remove(id);
            }
        }
        self.presents.retain(|&(_, t), _| t != target);
        self.idle_callbacks.retain(|&(_, t), _| t != target);
    }

    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    fn unlink_record(&mut self, id: NodeId, record: &ActivityRecord) {
        if let Some(chain) = self.per_buffer.get_mut(&record.buffer) {
            self.records.unlink(BUFFER_CHAIN, chain, id);
        }
        if let Some(chain) = self.per_target.get_mut(&record.target) {
            self.records.unlink(TARGET_CHAIN, chain, id);
        }
        self.records.unlink(GLOBAL_CHAIN, &mut self.global, id);
        self.records.remove(id);
    }

    fn take_idle_callbacks(&mut self, buffer: BufferId, target: TargetId) -> Vec<ReadyIdle> {
        self.idle_callbacks
            .remove(&(buffer, target))
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|entry| ReadyIdle {
                        buffer,
                        target,
                        callback: entry.callback,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CompletionHandle(u64);

struct CompletionRecord {
    handle: CompletionHandle,
    target: TargetId,
    serial: PresentSerial,
    callback: PresentedCallback,
}

/// Presentation-completion callbacks, fired in presentation-serial order.
/// Cancellation unlinks the record; a completion for a cancelled serial is
/// ignored harmlessly.
#[derive(Default)]
pub struct CompletionRecords {
    records: Vec<CompletionRecord>,
    next_handle: u64,
}

impl CompletionRecords {
    pub fn add(
        &mut self,
        target: TargetId,
        serial: PresentSerial,
        callback: PresentedCallback,
    ) -> CompletionHandle {
        self.next_handle += 1;
        let handle = CompletionHandle(self.next_handle);
        self.records.push(CompletionRecord {
            handle,
            target,
            serial,
            callback,
        });
        handle
    }

    pub fn cancel(&mut self, handle: CompletionHandle) {
        self.records.retain(|record| record.handle != handle);
    }

    /// Takes the callback for a completion notification, if any survives.
    pub fn complete(
        &mut self,
        target: TargetId,
        serial: PresentSerial,
    ) -> Option<PresentedCallback> {
        let index = self
            .records
            .iter()
            .position(|record| record.target == target && record.serial == serial)?;
        Some(self.records.remove(index).callback)
    }

    pub fn forget_target(&mut self, target: TargetId) {
        self.records.retain(|record| record.target != target);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Convenience wrapper for running a completion callback.
pub fn run_presented(callback: PresentedCallback, info: PresentedInfo) {
    callback(info);
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const B1: BufferId = BufferId(1);
    const B2: BufferId = BufferId(2);
    const T1: TargetId = TargetId(10);
    const T2: TargetId = TargetId(20);

    fn counter() -> (Rc<RefCell<usize>>, impl Fn() -> IdleCallback) {
        let count = Rc::new(RefCell::new(0));
        let make = {
            let count = count.clone();
            move || {
                let count = count.clone();
                Box::new(move |_, _| *count.borrow_mut() += 1) as IdleCallback
            }
        };
        (count, make)
    }

    #[test]
    fn ack_retires_in_order_and_fires_idle() {
        let (count, make) = counter();
        let mut tracker = IdleTracker::default();
        tracker.note_activity(B1, T1, RoundTripId(1));
        tracker.note_activity(B1, T1, RoundTripId(2));
        tracker.add_idle_callback(B1, T1, make());
        assert!(!tracker.is_idle(B1, T1));

        // The first echo retires only the first record.
        for ready in tracker.acknowledge_round_trip(RoundTripId(1)) {
            ready.run();
        }
        assert_eq!(*count.borrow(), 0);
        assert!(!tracker.is_idle(B1, T1));

        for ready in tracker.acknowledge_round_trip(RoundTripId(2)) {
            ready.run();
        }
        assert_eq!(*count.borrow(), 1);
        assert!(tracker.is_idle(B1, T1));
        assert_eq!(tracker.pending_records(), 0);
    }

    #[test]
    fn idle_is_per_pair() {
        let mut tracker = IdleTracker::default();
        tracker.note_activity(B1, T1, RoundTripId(1));
        tracker.note_activity(B1, T2, RoundTripId(1));
        tracker.note_activity(B2, T1, RoundTripId(2));
        assert!(!tracker.is_idle(B1, T1));
        assert!(!tracker.is_idle(B1, T2));
        assert!(!tracker.is_idle(B2, T1));
        assert!(tracker.is_idle(B2, T2));

        let _ = tracker.acknowledge_round_trip(RoundTripId(1));
        assert!(tracker.is_idle(B1, T1));
        assert!(tracker.is_idle(B1, T2));
        assert!(!tracker.is_idle(B2, T1));
    }

    #[test]
    fn present_records_hold_the_pair_busy() {
        let (count, make) = counter();
        let mut tracker = IdleTracker::default();
        tracker.note_activity(B1, T1, RoundTripId(1));
        tracker.note_present(B1, T1, PresentSerial(7));
        tracker.add_idle_callback(B1, T1, make());

        for ready in tracker.acknowledge_round_trip(RoundTripId(1)) {
            ready.run();
        }
        // The activity record is gone but the present record remains.
        assert_eq!(*count.borrow(), 0);
        assert!(!tracker.is_idle(B1, T1));

        for ready in tracker.present_idle(B1, T1, PresentSerial(7)) {
            assert_eq!((ready.buffer, ready.target), (B1, T1));
            ready.run();
        }
        assert_eq!(*count.borrow(), 1);
        assert!(tracker.is_idle(B1, T1));
    }

    #[test]
    fn cancelled_idle_callback_never_fires() {
        let (count, make) = counter();
        let mut tracker = IdleTracker::default();
        tracker.note_activity(B1, T1, RoundTripId(1));
        let handle = tracker.add_idle_callback(B1, T1, make());
        tracker.cancel_idle_callback(handle);
        for ready in tracker.acknowledge_round_trip(RoundTripId(1)) {
            ready.run();
        }
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn forget_buffer_clears_all_records() {
        let mut tracker = IdleTracker::default();
        tracker.note_activity(B1, T1, RoundTripId(1));
        tracker.note_activity(B1, T2, RoundTripId(2));
        tracker.note_activity(B2, T1, RoundTripId(3));
        let _ = tracker.forget_buffer(B1);
        assert_eq!(tracker.pending_records(), 1);
        assert!(tracker.is_idle(B1, T1));
        // Retiring the remaining record must not trip over the removed ones.
        let _ = tracker.acknowledge_round_trip(RoundTripId(3));
        assert_eq!(tracker.pending_records(), 0);
    }

    #[test]
    fn completion_records_cancel_and_complete() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut records = CompletionRecords::default();
        let make = |name: &'static str| {
            let fired = fired.clone();
            Box::new(move |info: PresentedInfo| fired.borrow_mut().push((name, info.msc)))
                as PresentedCallback
        };
        let _a = records.add(T1, PresentSerial(1), make("a"));
        let b = records.add(T1, PresentSerial(2), make("b"));
        records.cancel(b);

        if let Some(callback) = records.complete(T1, PresentSerial(1)) {
            run_presented(
                callback,
                PresentedInfo {
                    serial: PresentSerial(1),
                    msc: 42,
                    ust: 0,
                },
            );
        }
        // The cancelled record's completion is ignored harmlessly.
        assert!(records.complete(T1, PresentSerial(2)).is_none());
        assert_eq!(*fired.borrow(), vec![("a", 42)]);
        assert!(records.is_empty());
    }
}
