/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The per-window frame clock: a small state machine over the host's
//! frame-drawn / frame-timings handshake and the sync-request freeze
//! protocol.
//!
//! Frame ids grow monotonically and encode their state in the low bits: an
//! odd id means a frame is in progress, and `id % 4 == 3` asks the host to
//! redraw urgently. The id is mirrored into the window's sync counter, so
//! the host can match `_NET_WM_FRAME_DRAWN` acknowledgements to frames.

use std::time::Duration;

use bitflags::bitflags;
use log::trace;

/// Where counter updates land: the production sink sets the window's sync
/// counter through the host sync extension.
pub trait CounterSink {
    fn set_sync_counter(&mut self, value: u64);
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct ClockFlags: u8 {
        const IN_FRAME = 1 << 0;
        const NEED_CONFIGURE = 1 << 1;
        const FROZEN = 1 << 2;
        const FROZEN_UNTIL_END_FRAME = 1 << 3;
        const END_FRAME_CALLED = 1 << 4;
        const PREDICT_REFRESH = 1 << 5;
    }
}

/// What `end_frame` decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndFrame {
    /// Nothing to end.
    Noop,
    /// The frame ended; the counter moved to the even id.
    Finished,
    /// Refresh prediction wants the end-frame to run at the next vblank
    /// deadline; the caller schedules a timer and calls
    /// [`FrameClock::end_frame_now`] when it fires.
    Deferred(Duration),
}

/// What a sync-request did to the clock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncRequest {
    /// The value was not newer than the last finished frame.
    Stale,
    /// A frame is still drawing; the freeze happens at end-frame.
    DeferredToEndFrame,
    /// Frozen now. The caller must cancel any pending end-frame timer,
    /// flush buffer-release accounting, run frame callbacks, and force an
    /// empty frame when asked to.
    Frozen { force_empty_frame: bool },
}

pub type AfterFrame = Box<dyn FnOnce(u64)>;

pub struct FrameClock {
    /// The primary counter advertised on the window property and the
    /// secondary counter we mutate.
    primary_counter: u32,
    secondary_counter: u32,
    next_frame_id: u64,
    finished_frame_id: u64,
    pending_configure: Option<u64>,
    flags: ClockFlags,
    /// Timing data from the last `_NET_WM_FRAME_TIMINGS`.
    refresh_interval_us: u64,
    frame_delay_us: u64,
    last_presentation_us: u64,
    last_frame_time_us: u64,
    after_frame: Vec<AfterFrame>,
}

impl FrameClock {
    pub fn new(primary_counter: u32, secondary_counter: u32) -> Self {
        FrameClock {
            primary_counter,
            secondary_counter,
            next_frame_id: 0,
            finished_frame_id: 0,
            pending_configure: None,
            flags: ClockFlags::empty(),
            refresh_interval_us: 0,
            frame_delay_us: 0,
            last_presentation_us: 0,
            last_frame_time_us: 0,
            after_frame: Vec::new(),
        }
    }

    /// The counter ids to expose through `_NET_WM_SYNC_REQUEST_COUNTER`.
    pub fn counters(&self) -> (u32, u32) {
        (self.primary_counter, self.secondary_counter)
    }

    pub fn next_frame_id(&self) -> u64 {
        self.next_frame_id
    }

    pub fn finished_frame_id(&self) -> u64 {
        self.finished_frame_id
    }

    pub fn in_frame(&self) -> bool {
        self.flags.contains(ClockFlags::IN_FRAME)
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ClockFlags::FROZEN)
    }

    pub fn set_predict_refresh(&mut self, enabled: bool) {
        self.flags.set(ClockFlags::PREDICT_REFRESH, enabled);
    }

    pub fn last_frame_time_us(&self) -> u64 {
        self.last_frame_time_us
    }

    pub fn refresh_interval_us(&self) -> u64 {
        self.refresh_interval_us
    }

    /// Begins a frame. The id moves to the next odd value whose low two
    /// bits encode the urgency, and the counter tells the host a frame is
    /// in progress. Returns false while frozen or mid-frame.
    pub fn start_frame(&mut self, urgent: bool, sink: &mut dyn CounterSink) -> bool {
        if self
            .flags
            .intersects(ClockFlags::FROZEN | ClockFlags::IN_FRAME)
        {
            return false;
        }
        let desired_low_bits = if urgent { 3 } else { 1 };
        let increment = if (self.next_frame_id + 1) % 4 == desired_low_bits {
            1
        } else {
            3
        };
        self.next_frame_id += increment;
        debug_assert_eq!(self.next_frame_id % 2, 1);
        debug_assert_eq!(self.next_frame_id % 4 == 3, urgent);
        self.flags.insert(ClockFlags::IN_FRAME);
        self.flags.remove(ClockFlags::END_FRAME_CALLED);
        sink.set_sync_counter(self.next_frame_id);
        trace!("frame {} started (urgent: {urgent})", self.next_frame_id);
        true
    }

    /// Ends the current frame, or asks the caller to wait for the next
    /// predicted vblank first. `now_us` is the 64-bit extension of the
    /// host clock.
    pub fn end_frame(&mut self, now_us: u64, sink: &mut dyn CounterSink) -> EndFrame {
        if !self.flags.contains(ClockFlags::IN_FRAME) {
            return EndFrame::Noop;
        }
        if self.flags.contains(ClockFlags::END_FRAME_CALLED) {
            return EndFrame::Noop;
        }
        if self.flags.contains(ClockFlags::PREDICT_REFRESH) &&
            self.refresh_interval_us > 0 &&
            self.last_presentation_us > 0
        {
            let deadline = self.next_vblank_deadline(now_us);
            if deadline > now_us {
                self.flags.insert(ClockFlags::END_FRAME_CALLED);
                return EndFrame::Deferred(Duration::from_micros(deadline - now_us));
            }
        }
        self.end_frame_now(sink);
        EndFrame::Finished
    }

    /// The second half of a deferred end-frame, also safe to call to force
    /// completion.
    pub fn end_frame_now(&mut self, sink: &mut dyn CounterSink) {
        if !self.flags.contains(ClockFlags::IN_FRAME) {
            return;
        }
        self.next_frame_id += 1;
        debug_assert_eq!(self.next_frame_id % 2, 0);
        self.flags.insert(ClockFlags::END_FRAME_CALLED);
        self.flags.remove(ClockFlags::IN_FRAME);
        sink.set_sync_counter(self.next_frame_id);
        if self.flags.contains(ClockFlags::FROZEN_UNTIL_END_FRAME) {
            self.flags.remove(ClockFlags::FROZEN_UNTIL_END_FRAME);
            self.flags.insert(ClockFlags::FROZEN);
        }
        trace!("frame {} ended", self.next_frame_id);
    }

    /// A `_NET_WM_FRAME_DRAWN` acknowledgement. Runs the after-frame
    /// callbacks when the id matches the frame we finished.
    pub fn handle_frame_drawn(&mut self, value: u64, server_time_us: u64) {
        if value <= self.finished_frame_id || value > self.next_frame_id {
            return;
        }
        self.finished_frame_id = value;
        self.last_frame_time_us = server_time_us;
        for callback in std::mem::take(&mut self.after_frame) {
            callback(server_time_us);
        }
    }

    /// A `_NET_WM_FRAME_TIMINGS` update.
    pub fn handle_frame_timings(
        &mut self,
        presentation_time_us: u64,
        refresh_interval_us: u64,
        frame_delay_us: u64,
    ) {
        self.last_presentation_us = presentation_time_us;
        self.refresh_interval_us = refresh_interval_us;
        self.frame_delay_us = frame_delay_us;
    }

    /// A `_NET_WM_SYNC_REQUEST` from the window manager.
    pub fn handle_sync_request(&mut self, value: u64, sink: &mut dyn CounterSink) -> SyncRequest {
        if value <= self.finished_frame_id {
            return SyncRequest::Stale;
        }
        self.pending_configure = Some(value);
        self.flags.insert(ClockFlags::NEED_CONFIGURE);

        if self.flags.contains(ClockFlags::IN_FRAME) {
            if self.flags.contains(ClockFlags::END_FRAME_CALLED) {
                // The end-frame already ran or sits on a timer. Finish it
                // for real, then freeze; the caller cancels the timer and
                // flushes release accounting.
                self.end_frame_now(sink);
                self.flags.insert(ClockFlags::FROZEN);
                return SyncRequest::Frozen {
                    force_empty_frame: false,
                };
            }
            self.flags.insert(ClockFlags::FROZEN_UNTIL_END_FRAME);
            return SyncRequest::DeferredToEndFrame;
        }

        self.flags.insert(ClockFlags::FROZEN);
        // A configure value we have already drawn past needs one empty
        // frame so the host gets fresh contents.
        let force_empty_frame = value <= self.next_frame_id;
        self.next_frame_id = self.next_frame_id.max(value & !1);
        SyncRequest::Frozen { force_empty_frame }
    }

    /// The client acked the configure and committed; frames may run again.
    pub fn unfreeze(&mut self) {
        self.flags
            .remove(ClockFlags::FROZEN | ClockFlags::FROZEN_UNTIL_END_FRAME);
        self.flags.remove(ClockFlags::NEED_CONFIGURE);
        self.pending_configure = None;
    }

    pub fn pending_configure(&self) -> Option<u64> {
        self.pending_configure
    }

    /// Registers a callback for the next frame-drawn acknowledgement.
    pub fn after_frame(&mut self, callback: AfterFrame) {
        self.after_frame.push(callback);
    }

    /// The next moment an end-frame should land so the frame makes the
    /// upcoming vblank: presentation time plus enough refresh intervals,
    /// minus the compositor's frame delay.
    fn next_vblank_deadline(&self, now_us: u64) -> u64 {
        let interval = self.refresh_interval_us;
        let base = self.last_presentation_us;
        if now_us <= base {
            return base.saturating_sub(self.frame_delay_us);
        }
        let intervals = (now_us - base).div_ceil(interval);
        (base + intervals * interval).saturating_sub(self.frame_delay_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(Vec<u64>);

    impl CounterSink for Counter {
        fn set_sync_counter(&mut self, value: u64) {
            self.0.push(value);
        }
    }

    #[test]
    fn frame_ids_are_monotonic_and_encode_urgency() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        let mut last = 0;
        for (index, urgent) in [false, true, true, false, false, true].into_iter().enumerate() {
            assert!(clock.start_frame(urgent, &mut sink), "frame {index}");
            let id = clock.next_frame_id();
            assert!(id > last);
            assert_eq!(id % 2, 1, "in-frame ids are odd");
            assert_eq!(id % 4 == 3, urgent);
            last = id;
            assert_eq!(clock.end_frame(0, &mut sink), EndFrame::Finished);
            let id = clock.next_frame_id();
            assert!(id % 4 == 0 || id % 4 == 2);
            last = id;
        }
    }

    #[test]
    fn start_frame_is_refused_mid_frame_and_frozen() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        assert!(clock.start_frame(false, &mut sink));
        assert!(!clock.start_frame(false, &mut sink));
        clock.end_frame(0, &mut sink);

        let outcome = clock.handle_sync_request(100, &mut sink);
        assert!(matches!(outcome, SyncRequest::Frozen { .. }));
        assert!(!clock.start_frame(false, &mut sink));
        clock.unfreeze();
        assert!(clock.start_frame(false, &mut sink));
    }

    #[test]
    fn sync_request_mid_frame_freezes_at_end_frame() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        assert!(clock.start_frame(false, &mut sink));

        let outcome = clock.handle_sync_request(100, &mut sink);
        assert_eq!(outcome, SyncRequest::DeferredToEndFrame);
        assert!(!clock.is_frozen(), "the running frame completes normally");

        assert_eq!(clock.end_frame(0, &mut sink), EndFrame::Finished);
        assert!(clock.is_frozen());
        assert!(!clock.start_frame(false, &mut sink));

        clock.unfreeze();
        assert!(clock.start_frame(false, &mut sink));
    }

    #[test]
    fn sync_request_after_deferred_end_frame_finishes_and_freezes() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        clock.set_predict_refresh(true);
        clock.handle_frame_timings(1_000, 16_000, 0);
        assert!(clock.start_frame(false, &mut sink));

        // The end-frame defers to the predicted vblank.
        let deferred = clock.end_frame(9_000, &mut sink);
        assert!(matches!(deferred, EndFrame::Deferred(_)));
        assert!(clock.in_frame());

        // The freeze must finish the frame instead of waiting for the
        // timer the caller is about to cancel.
        let outcome = clock.handle_sync_request(100, &mut sink);
        assert_eq!(
            outcome,
            SyncRequest::Frozen {
                force_empty_frame: false
            }
        );
        assert!(!clock.in_frame());
        assert!(clock.is_frozen());
    }

    #[test]
    fn stale_sync_requests_are_discarded() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        assert!(clock.start_frame(false, &mut sink));
        clock.end_frame(0, &mut sink);
        let finished = clock.next_frame_id();
        clock.handle_frame_drawn(finished, 1_000);

        assert_eq!(
            clock.handle_sync_request(finished, &mut sink),
            SyncRequest::Stale
        );
        assert_eq!(
            clock.handle_sync_request(finished - 1, &mut sink),
            SyncRequest::Stale
        );
        assert!(!clock.is_frozen());
    }

    #[test]
    fn caught_up_configure_forces_an_empty_frame() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        assert!(clock.start_frame(false, &mut sink));
        clock.end_frame(0, &mut sink);
        // Not yet acknowledged by frame-drawn, and the value is at or
        // behind our counter: the host needs fresh contents.
        let value = clock.next_frame_id();
        assert_eq!(
            clock.handle_sync_request(value, &mut sink),
            SyncRequest::Frozen {
                force_empty_frame: true
            }
        );
    }

    #[test]
    fn frame_drawn_runs_after_frame_callbacks_once() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        let times = Rc::new(RefCell::new(Vec::new()));
        let times_in_callback = times.clone();
        clock.after_frame(Box::new(move |time| {
            times_in_callback.borrow_mut().push(time);
        }));

        assert!(clock.start_frame(false, &mut sink));
        clock.end_frame(0, &mut sink);
        let id = clock.next_frame_id();
        clock.handle_frame_drawn(id, 42_000);
        clock.handle_frame_drawn(id, 43_000);
        assert_eq!(*times.borrow(), vec![42_000]);
        assert_eq!(clock.finished_frame_id(), id);
        assert_eq!(clock.last_frame_time_us(), 42_000);
    }

    #[test]
    fn counter_follows_the_frame_id() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        clock.start_frame(true, &mut sink);
        clock.end_frame(0, &mut sink);
        assert_eq!(sink.0, vec![3, 4]);
    }

    #[test]
    fn deferred_end_frame_targets_the_vblank() {
        let mut clock = FrameClock::new(1, 2);
        let mut sink = Counter::default();
        clock.set_predict_refresh(true);
        clock.handle_frame_timings(1_000_000, 16_667, 1_000);
        assert!(clock.start_frame(false, &mut sink));
        match clock.end_frame(1_005_000, &mut sink) {
            EndFrame::Deferred(delay) => {
                // Next vblank at 1,016,667 minus the 1ms delay.
                assert_eq!(delay, Duration::from_micros(1_016_667 - 1_000 - 1_005_000));
            },
            other => panic!("expected deferral, got {other:?}"),
        }
        clock.end_frame_now(&mut sink);
        assert!(!clock.in_frame());
    }
}
