/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Render target state: a host window with up to two back buffers, their
//! ages, busy flags and idle fences, and the per-update list of buffers
//! touched. The host-side allocation lives in the backends; everything
//! here is bookkeeping, which keeps the swap rules testable.

use base::PresentSerial;
use fence::Fence;

use crate::{AGE_FOREIGN, BufferId};

#[derive(Clone, Copy, Debug)]
pub struct BackBuffer {
    pub pixmap: u32,
    pub picture: u32,
    /// Set while the host may still be scanning out of this pixmap.
    pub busy: bool,
    /// The serial of the presentation that made it busy; zero when never
    /// presented.
    pub present_serial: PresentSerial,
    /// The fence the host triggers when it is done reading; must be
    /// awaited before compositing into the buffer again.
    pub idle_fence: Option<Fence>,
    pub sync_needed: bool,
    /// Swaps since this buffer was last drawn to.
    pub age: i32,
    ever_drawn: bool,
    pub written: bool,
}

impl BackBuffer {
    pub fn new(pixmap: u32, picture: u32) -> Self {
        Self {
            pixmap,
            picture,
            busy: false,
            present_serial: PresentSerial(0),
            idle_fence: None,
            sync_needed: false,
            age: 0,
            ever_drawn: false,
            written: false,
        }
    }
}

#[derive(Debug)]
pub struct TargetState {
    /// The backing drawable: a window for role surface trees, a pixmap for
    /// intermediate render.
    pub window: u32,
    pub window_backed: bool,
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub back_buffers: [Option<BackBuffer>; 2],
    active: usize,
    /// Set right after a direct presentation; the next age query reports
    /// the foreign sentinel and the next composite clears it.
    pub just_presented: bool,
    /// Direct presentation disabled; the escape hatch for roles that need
    /// exact release timing.
    pub no_presentation: bool,
    /// Buffers composited during the current update, in first-use order.
    pub buffers_used: Vec<BufferId>,
    /// Present extension event context id on the window.
    pub present_event_id: u32,
}

impl TargetState {
    pub fn new(window: u32, width: u16, height: u16, depth: u8) -> Self {
        Self {
            window,
            window_backed: true,
            width,
            height,
            depth,
            back_buffers: [None, None],
            active: 0,
            just_presented: false,
            no_presentation: false,
            buffers_used: Vec::new(),
            present_event_id: 0,
        }
    }

    /// An intermediate target drawing straight into a pixmap; there is no
    /// swap and nothing to present.
    pub fn new_pixmap(pixmap: u32, width: u16, height: u16, depth: u8) -> Self {
        Self {
            window_backed: false,
            no_presentation: true,
            ..Self::new(pixmap, width, height, depth)
        }
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn current(&self) -> Option<&BackBuffer> {
        self.back_buffers[self.active].as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut BackBuffer> {
        self.back_buffers[self.active].as_mut()
    }

    /// Installs a freshly allocated back buffer in the active slot.
    pub fn install_back_buffer(&mut self, buffer: BackBuffer) {
        debug_assert!(self.back_buffers[self.active].is_none());
        self.back_buffers[self.active] = Some(buffer);
    }

    /// Marks a buffer used by the current update. Keeps first-use order and
    /// reports whether this is the first use this update.
    pub fn note_buffer_used(&mut self, buffer: BufferId) -> bool {
        if self.buffers_used.contains(&buffer) {
            return false;
        }
        self.buffers_used.push(buffer);
        true
    }

    pub fn take_buffers_used(&mut self) -> Vec<BufferId> {
        std::mem::take(&mut self.buffers_used)
    }

    /// Records a draw into the current back buffer.
    pub fn note_drawn(&mut self) {
        self.just_presented = false;
        if let Some(buffer) = self.current_mut() {
            buffer.age = 0;
            buffer.ever_drawn = true;
            buffer.written = true;
        }
    }

    /// Swap bookkeeping shared by the copy and present paths: every buffer
    /// that holds contents ages by one.
    fn age_buffers(&mut self) {
        for slot in self.back_buffers.iter_mut().flatten() {
            if slot.ever_drawn {
                slot.age += 1;
            }
        }
    }

    /// The copy path: damage was copied from the back buffer to the window,
    /// the same buffer stays active.
    pub fn swap_copy(&mut self) {
        self.age_buffers();
        if let Some(buffer) = self.current_mut() {
            buffer.written = false;
        }
    }

    /// The present path: the current buffer goes busy with `serial` and the
    /// other slot becomes active. Returns the presented pixmap.
    ///
    /// Of the two back buffers at most one is busy at any time; presenting
    /// while the other is still busy is a caller bug.
    pub fn swap_present(&mut self, serial: PresentSerial, idle_fence: Option<Fence>) -> u32 {
        debug_assert!(
            self.back_buffers[1 - self.active]
                .as_ref()
                .is_none_or(|buffer| !buffer.busy),
            "both back buffers busy"
        );
        self.age_buffers();
        let active = self.active;
        let buffer = self.back_buffers[active]
            .as_mut()
            .expect("presenting without a back buffer");
        buffer.busy = true;
        buffer.present_serial = serial;
        buffer.sync_needed = idle_fence.is_some();
        buffer.idle_fence = idle_fence;
        buffer.written = false;
        let pixmap = buffer.pixmap;
        self.active = 1 - active;
        pixmap
    }

    /// Clears the busy flag when the host reports the pixmap idle. The
    /// idle fence stays armed until the next composite awaits it.
    pub fn present_idle(&mut self, pixmap: u32, serial: PresentSerial) -> bool {
        for slot in self.back_buffers.iter_mut().flatten() {
            if slot.pixmap == pixmap && slot.present_serial == serial && slot.busy {
                slot.busy = false;
                return true;
            }
        }
        false
    }

    /// Drops both back buffers, returning the host pixmaps and pictures to
    /// free. Direct presentation releases them all on entry.
    pub fn release_back_buffers(&mut self) -> Vec<(u32, u32)> {
        let mut freed = Vec::new();
        for slot in &mut self.back_buffers {
            if let Some(buffer) = slot.take() {
                freed.push((buffer.pixmap, buffer.picture));
            }
        }
        freed
    }

    /// The age the renderer reports for the target.
    pub fn age(&self) -> i32 {
        if self.just_presented {
            return AGE_FOREIGN;
        }
        self.current().map_or(0, |buffer| buffer.age)
    }

    pub fn busy_count(&self) -> usize {
        self.back_buffers
            .iter()
            .flatten()
            .filter(|buffer| buffer.busy)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetState {
        let mut target = TargetState::new(0x100, 640, 480, 32);
        target.install_back_buffer(BackBuffer::new(0x200, 0x300));
        target
    }

    #[test]
    fn fresh_target_has_age_zero() {
        let target = target();
        assert_eq!(target.age(), 0);
    }

    #[test]
    fn copy_swaps_age_the_drawn_buffer() {
        let mut target = target();
        target.note_drawn();
        target.swap_copy();
        assert_eq!(target.age(), 1);
        target.swap_copy();
        assert_eq!(target.age(), 2);
        target.note_drawn();
        assert_eq!(target.age(), 0);
    }

    #[test]
    fn present_flips_to_the_other_slot() {
        let mut target = target();
        target.note_drawn();
        let presented = target.swap_present(PresentSerial(1), None);
        assert_eq!(presented, 0x200);
        assert_eq!(target.busy_count(), 1);
        // The new active slot is empty and must be allocated before use.
        assert!(target.current().is_none());
        assert_eq!(target.age(), 0);

        target.install_back_buffer(BackBuffer::new(0x201, 0x301));
        target.note_drawn();
        assert!(target.present_idle(0x200, PresentSerial(1)));
        let presented = target.swap_present(PresentSerial(2), None);
        assert_eq!(presented, 0x201);
        // Back on the first buffer, whose content is two swaps old.
        assert_eq!(target.age(), 2);
    }

    #[test]
    fn busy_implies_nonzero_serial() {
        let mut target = target();
        target.note_drawn();
        target.swap_present(PresentSerial(9), None);
        for buffer in target.back_buffers.iter().flatten() {
            if buffer.busy {
                assert_ne!(buffer.present_serial, PresentSerial(0));
            }
        }
    }

    #[test]
    fn present_idle_matches_serial_and_pixmap() {
        let mut target = target();
        target.note_drawn();
        target.swap_present(PresentSerial(3), None);
        assert!(!target.present_idle(0x200, PresentSerial(4)));
        assert!(!target.present_idle(0x999, PresentSerial(3)));
        assert!(target.present_idle(0x200, PresentSerial(3)));
        assert_eq!(target.busy_count(), 0);
        // A second idle for the same presentation is stale.
        assert!(!target.present_idle(0x200, PresentSerial(3)));
    }

    #[test]
    fn direct_present_reports_foreign_age() {
        let mut target = target();
        target.note_drawn();
        let freed = target.release_back_buffers();
        assert_eq!(freed, vec![(0x200, 0x300)]);
        target.just_presented = true;
        assert_eq!(target.age(), AGE_FOREIGN);
        // The next draw claims the target back.
        target.install_back_buffer(BackBuffer::new(0x202, 0x302));
        target.note_drawn();
        assert_eq!(target.age(), 0);
    }

    #[test]
    fn buffers_used_keeps_first_use_order() {
        let mut target = target();
        assert!(target.note_buffer_used(BufferId(5)));
        assert!(target.note_buffer_used(BufferId(3)));
        assert!(!target.note_buffer_used(BufferId(5)));
        assert_eq!(
            target.take_buffers_used(),
            vec![BufferId(5), BufferId(3)]
        );
        assert!(target.buffers_used.is_empty());
    }
}
