/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The sync helper bridges a role's subcompositor, its render target and
//! its frame clock. It picks, per frame, between the legacy frame-drawn
//! handshake and presentation-driven vsync, arbitrates resize freezes, and
//! translates the host's wrapping millisecond timestamps into the 64-bit
//! monotonic clock everything downstream uses.

use base::time::ServerTime;
use bitflags::bitflags;
use log::trace;

use crate::frame_clock::{CounterSink, EndFrame, FrameClock, SyncRequest};
use crate::subcompositor::{FrameEvent, Subcompositor};
use crate::surface::Surfaces;

/// How the next frame is driven.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncMode {
    /// The frame-drawn / sync-counter handshake; required during resize
    /// and when direct vsync is unavailable.
    Clock,
    /// Direct vsync from the host present extension.
    Present,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct SyncFlags: u8 {
        const FRAME_STARTED = 1 << 0;
        const FRAME_PENDING = 1 << 1;
        const FRAME_SYNCHRONIZED = 1 << 2;
        const FRAME_RESIZE = 1 << 3;
    }
}

pub struct SyncHelper {
    clock: FrameClock,
    mode: SyncMode,
    flags: SyncFlags,
    pending_frame_id: u64,
    last_msc: u64,
    last_ust: u64,
    /// Server-versus-local drift state used to extend frame-drawn
    /// timestamps.
    server_time: ServerTime,
    /// Asked whether the held-back frame is safe to skip because the
    /// incoming configure supersedes it.
    fast_forward: Option<Box<dyn FnMut() -> bool>>,
}

impl SyncHelper {
    pub fn new(clock: FrameClock) -> Self {
        SyncHelper {
            clock,
            mode: SyncMode::Clock,
            flags: SyncFlags::empty(),
            pending_frame_id: 0,
            last_msc: 0,
            last_ust: 0,
            server_time: ServerTime::new(),
            fast_forward: None,
        }
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut FrameClock {
        &mut self.clock
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn frame_pending(&self) -> bool {
        self.flags.contains(SyncFlags::FRAME_PENDING)
    }

    pub fn last_presentation(&self) -> (u64, u64) {
        (self.last_msc, self.last_ust)
    }

    /// Resize forces the clock mode until the role reports the resize
    /// settled.
    pub fn set_resizing(&mut self, resizing: bool) {
        self.flags.set(SyncFlags::FRAME_RESIZE, resizing);
    }

    pub fn is_resizing(&self) -> bool {
        self.flags.contains(SyncFlags::FRAME_RESIZE)
    }

    /// Chooses the synchronization mode for the next frame and tells the
    /// role through the note-frame callback.
    pub fn select_mode(
        &mut self,
        present_supported: bool,
        subcompositor: &mut Subcompositor,
    ) -> SyncMode {
        let mode = if present_supported && !self.is_resizing() {
            SyncMode::Present
        } else {
            SyncMode::Clock
        };
        if mode != self.mode {
            trace!("sync mode now {mode:?}");
        }
        self.mode = mode;
        subcompositor.note_frame(FrameEvent::ModeSet(mode));
        mode
    }

    /// Starts a frame. With more than one desynchronized descendant,
    /// refresh prediction is enabled so their subframes batch into one
    /// host vblank.
    pub fn begin_frame(
        &mut self,
        urgent: bool,
        surfaces: &Surfaces,
        subcompositor: &Subcompositor,
        sink: &mut dyn CounterSink,
    ) -> bool {
        if self.flags.contains(SyncFlags::FRAME_PENDING) {
            return false;
        }
        let desynchronized = subcompositor.desynchronized_children(surfaces);
        self.clock.set_predict_refresh(desynchronized > 1);
        if !self.clock.start_frame(urgent, sink) {
            return false;
        }
        self.flags
            .insert(SyncFlags::FRAME_STARTED | SyncFlags::FRAME_PENDING);
        self.pending_frame_id = self.clock.next_frame_id();
        true
    }

    /// The update finished on our side. In clock mode the after-frame is
    /// the host's frame-drawn message; in present mode the completion
    /// notify carries the timing, so the frame keeps pending either way
    /// and only the started flag clears.
    pub fn frame_complete(
        &mut self,
        now_us: u64,
        subcompositor: &mut Subcompositor,
        sink: &mut dyn CounterSink,
    ) -> EndFrame {
        self.flags.remove(SyncFlags::FRAME_STARTED);
        subcompositor.note_frame(FrameEvent::Completed);
        self.clock.end_frame(now_us, sink)
    }

    /// A presentation completion from the renderer, present mode's end of
    /// frame. Returns the timestamp for the client frame callbacks.
    pub fn presented(
        &mut self,
        msc: u64,
        ust: u64,
        subcompositor: &mut Subcompositor,
    ) -> u64 {
        self.last_msc = msc;
        self.last_ust = ust;
        self.flags.remove(SyncFlags::FRAME_PENDING);
        subcompositor.note_frame(FrameEvent::Presented { msc, ust });
        ust
    }

    /// A frame-drawn acknowledgement, clock mode's end of frame. The
    /// 32-bit millisecond stamp is folded into the extended server clock;
    /// the returned value feeds the client frame callbacks.
    pub fn frame_drawn(&mut self, value: u64, server_time_ms: u32) -> u64 {
        let time_us = self.server_time.observe_ms(server_time_ms);
        self.clock.handle_frame_drawn(value, time_us);
        if value >= self.pending_frame_id {
            self.flags.remove(SyncFlags::FRAME_PENDING);
        }
        time_us
    }

    /// A frame-timings update; values arrive as 32-bit halves already
    /// stitched by the event decoding layer.
    pub fn frame_timings(
        &mut self,
        presentation_time_us: u64,
        refresh_interval_us: u64,
        frame_delay_us: u64,
    ) {
        self.clock
            .handle_frame_timings(presentation_time_us, refresh_interval_us, frame_delay_us);
    }

    /// A sync-request from the window manager. `freeze` runs when the
    /// clock actually freezes, after in-flight release accounting was
    /// flushed by the caller. Returns whether an empty frame must be
    /// pushed.
    pub fn sync_request(
        &mut self,
        value: u64,
        sink: &mut dyn CounterSink,
        freeze: impl FnOnce(),
    ) -> Option<bool> {
        match self.clock.handle_sync_request(value, sink) {
            SyncRequest::Stale => None,
            SyncRequest::DeferredToEndFrame => Some(false),
            SyncRequest::Frozen { force_empty_frame } => {
                self.flags.remove(SyncFlags::FRAME_PENDING);
                freeze();
                // The role may know this frame will be superseded by the
                // configure anyway.
                let skip = force_empty_frame &&
                    self.fast_forward.as_mut().is_some_and(|safe_to_skip| safe_to_skip());
                Some(force_empty_frame && !skip)
            },
        }
    }

    /// Installs the role's fast-forward predicate.
    pub fn set_fast_forward(&mut self, callback: Box<dyn FnMut() -> bool>) {
        self.fast_forward = Some(callback);
    }

    /// The commit after ack-configure; thaws the clock.
    pub fn unfreeze(&mut self) {
        self.clock.unfreeze();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::subsurface::SubsurfaceRole;

    #[derive(Default)]
    struct Counter(Vec<u64>);

    impl CounterSink for Counter {
        fn set_sync_counter(&mut self, value: u64) {
            self.0.push(value);
        }
    }

    fn helper() -> SyncHelper {
        SyncHelper::new(FrameClock::new(1, 2))
    }

    #[test]
    fn resize_forces_clock_mode() {
        let mut helper = helper();
        let mut subcompositor = Subcompositor::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let events_in_callback = events.clone();
        subcompositor.set_note_frame_callback(Box::new(move |event| {
            events_in_callback.borrow_mut().push(event);
        }));

        assert_eq!(
            helper.select_mode(true, &mut subcompositor),
            SyncMode::Present
        );
        helper.set_resizing(true);
        assert_eq!(helper.select_mode(true, &mut subcompositor), SyncMode::Clock);
        helper.set_resizing(false);
        assert_eq!(
            helper.select_mode(false, &mut subcompositor),
            SyncMode::Clock
        );
        assert_eq!(
            *events.borrow(),
            vec![
                FrameEvent::ModeSet(SyncMode::Present),
                FrameEvent::ModeSet(SyncMode::Clock),
                FrameEvent::ModeSet(SyncMode::Clock),
            ]
        );
    }

    #[test]
    fn multiple_desynchronized_children_enable_prediction() {
        let mut helper = helper();
        let mut subcompositor = Subcompositor::new();
        let mut surfaces = Surfaces::default();
        let mut sink = Counter::default();

        // A parent with two desynchronized subsurface children.
        let parent = surfaces.create();
        let root_view = subcompositor.tree.create(Some(parent));
        subcompositor.tree.set_root(root_view);
        if let Some(view) = subcompositor.tree.get_mut(root_view) {
            view.mapped = true;
        }
        for _ in 0..2 {
            let child = surfaces.create();
            let view = subcompositor.tree.create(Some(child));
            subcompositor.tree.insert_last(root_view, view);
            if let Some(view) = subcompositor.tree.get_mut(view) {
                view.mapped = true;
            }
            let surface = surfaces.get_mut(child).expect("child");
            let mut role = SubsurfaceRole::new(parent);
            role.synchronized = false;
            surface.role = Some(Box::new(role));
        }

        assert_eq!(subcompositor.desynchronized_children(&surfaces), 2);
        assert!(helper.begin_frame(false, &surfaces, &subcompositor, &mut sink));
        assert!(helper.frame_pending());
    }

    #[test]
    fn frame_drawn_extends_the_wrapping_timestamp() {
        let mut helper = helper();
        let mut subcompositor = Subcompositor::new();
        let surfaces = Surfaces::default();
        let mut sink = Counter::default();
        let root = subcompositor.tree.create(None);
        subcompositor.tree.set_root(root);

        assert!(helper.begin_frame(false, &surfaces, &subcompositor, &mut sink));
        helper.frame_complete(0, &mut subcompositor, &mut sink);
        let frame = helper.clock().next_frame_id();

        let first = helper.frame_drawn(frame, 5_000);
        assert_eq!(first, 5_000_000);
        assert!(!helper.frame_pending());

        // Later frames move forward even when the host stamp regresses.
        assert!(helper.begin_frame(false, &surfaces, &subcompositor, &mut sink));
        helper.frame_complete(0, &mut subcompositor, &mut sink);
        let frame = helper.clock().next_frame_id();
        let second = helper.frame_drawn(frame, 4_000);
        assert!(second >= first);
    }

    #[test]
    fn presented_records_msc_and_clears_pending() {
        let mut helper = helper();
        let mut subcompositor = Subcompositor::new();
        let surfaces = Surfaces::default();
        let mut sink = Counter::default();
        let root = subcompositor.tree.create(None);
        subcompositor.tree.set_root(root);

        assert!(helper.begin_frame(false, &surfaces, &subcompositor, &mut sink));
        helper.frame_complete(0, &mut subcompositor, &mut sink);
        let time = helper.presented(77, 123_456, &mut subcompositor);
        assert_eq!(time, 123_456);
        assert_eq!(helper.last_presentation(), (77, 123_456));
        assert!(!helper.frame_pending());
    }

    #[test]
    fn freeze_callback_runs_on_sync_request() {
        let mut helper = helper();
        let mut sink = Counter::default();
        let froze = Rc::new(RefCell::new(false));
        let froze_in_callback = froze.clone();
        let outcome = helper.sync_request(10, &mut sink, || {
            *froze_in_callback.borrow_mut() = true;
        });
        assert_eq!(outcome, Some(false));
        assert!(*froze.borrow());
        assert!(helper.clock().is_frozen());
    }
}
