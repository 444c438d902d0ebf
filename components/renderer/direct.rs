/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The simpler backend, selectable at startup: no picture compositing, only
//! rectangle copies and direct presentation. What it lacks in blending it
//! makes up in synchronization: this is the backend that can import
//! client acquire fences and produce finish fences for fenced release.

use std::os::fd::OwnedFd;
use std::rc::Rc;

use base::{FxHashMap, FxHashSet, PresentSerial, RoundTripId, SerialGen};
use geometry::region::Region;
use geometry::{DrawParams, WindowPixel};
use log::{debug, trace};
use rustix::fs::{MemfdFlags, memfd_create};
use rustix::io::fcntl_dupfd_cloexec;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::sync::ConnectionExt as _;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{ChangeGCAux, ConnectionExt as _, CreateGCAux, Gcontext, Rectangle};
use x11rb::rust_connection::RustConnection;

use crate::host::{
    HostContext, MarkerKind, PRESENT_OPTION_ASYNC, connection_error, host_error, to_rectangle,
};
use crate::picture::pixmap_from_buffers;
use crate::records::{CompletionRecords, IdleTracker};
use crate::target::{BackBuffer, TargetState};
use crate::{
    BufferFlags, BufferId, BufferOps, CompletionHandle, CompositeOp, DmaBufImport, IdleCallback,
    IdleHandle, PictureFormat, PresentedCallback, PresentedInfo, RenderError, RenderOps,
    ShmImport, TargetId,
};

struct BufferState {
    pixmap: u32,
    width: u16,
    height: u16,
    depth: u8,
    flags: BufferFlags,
}

pub struct DirectRenderer {
    host: HostContext,
    buffers: FxHashMap<BufferId, BufferState>,
    targets: FxHashMap<TargetId, TargetState>,
    window_targets: FxHashMap<u32, TargetId>,
    pixmap_buffers: FxHashMap<u32, BufferId>,
    window_gcs: FxHashMap<TargetId, Gcontext>,
    pixmap_gcs: FxHashMap<u32, Gcontext>,
    imported_fences: FxHashSet<u32>,
    tracker: IdleTracker,
    completions: CompletionRecords,
    round_trips: SerialGen,
    present_serials: SerialGen,
    buffer_ids: SerialGen,
    target_ids: SerialGen,
}

impl DirectRenderer {
    pub fn new(connection: Rc<RustConnection>, screen: usize) -> Result<Self, RenderError> {
        Ok(Self {
            host: HostContext::new(connection, screen)?,
            buffers: FxHashMap::default(),
            targets: FxHashMap::default(),
            window_targets: FxHashMap::default(),
            pixmap_buffers: FxHashMap::default(),
            window_gcs: FxHashMap::default(),
            pixmap_gcs: FxHashMap::default(),
            imported_fences: FxHashSet::default(),
            tracker: IdleTracker::default(),
            completions: CompletionRecords::default(),
            round_trips: SerialGen::default(),
            present_serials: SerialGen::default(),
            buffer_ids: SerialGen::default(),
            target_ids: SerialGen::default(),
        })
    }

    fn connection(&self) -> &RustConnection {
        &self.host.connection
    }

    fn target_mut(&mut self, target: TargetId) -> Result<&mut TargetState, RenderError> {
        self.targets.get_mut(&target).ok_or(RenderError::UnknownTarget)
    }

    fn ensure_back_buffer(&mut self, target_id: TargetId) -> Result<(), RenderError> {
        let target = self.targets.get_mut(&target_id).ok_or(RenderError::UnknownTarget)?;
        target.just_presented = false;
        if target.current().is_some() {
            return Ok(());
        }
        if !target.window_backed {
            // Draw straight into the caller's pixmap.
            let pixmap = target.window;
            target.install_back_buffer(BackBuffer::new(pixmap, 0));
            return Ok(());
        }
        let connection = self.host.connection.clone();
        let pixmap = connection.generate_id().map_err(host_error)?;
        connection
            .create_pixmap(target.depth, pixmap, target.window, target.width, target.height)
            .map_err(connection_error)?;
        let gc = connection.generate_id().map_err(host_error)?;
        connection
            .create_gc(gc, pixmap, &CreateGCAux::new().graphics_exposures(0))
            .map_err(connection_error)?;
        self.pixmap_gcs.insert(pixmap, gc);
        target.install_back_buffer(BackBuffer::new(pixmap, 0));
        trace!("allocated copy back buffer {pixmap:#x}");
        Ok(())
    }

    fn free_back_buffers(&mut self, target_id: TargetId) {
        let Some(target) = self.targets.get_mut(&target_id) else {
            return;
        };
        let window_backed = target.window_backed;
        let drawable = target.window;
        for (pixmap, _) in target.release_back_buffers() {
            if !window_backed && pixmap == drawable {
                continue;
            }
            if let Some(gc) = self.pixmap_gcs.remove(&pixmap) {
                let _ = self.host.connection.free_gc(gc);
            }
            let _ = self.host.connection.free_pixmap(pixmap);
        }
    }

    fn present_pixmap(
        &mut self,
        window: u32,
        pixmap: u32,
        damage: &Region<WindowPixel>,
    ) -> Result<PresentSerial, RenderError> {
        let serial = PresentSerial(self.present_serials.next_u32());
        let rects: Vec<Rectangle> = damage.rects().iter().map(|&b| to_rectangle(b)).collect();
        let region = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .xfixes_create_region(region, &rects)
            .map_err(connection_error)?;
        self.connection()
            .present_pixmap(
                window,
                pixmap,
                serial.0,
                region,
                region,
                0,
                0,
                0,
                0,
                x11rb::NONE,
                PRESENT_OPTION_ASYNC,
                0,
                0,
                0,
                &[],
            )
            .map_err(connection_error)?;
        self.connection()
            .xfixes_destroy_region(region)
            .map_err(connection_error)?;
        Ok(serial)
    }

    fn window_gc(&mut self, target_id: TargetId) -> Result<Gcontext, RenderError> {
        if let Some(&gc) = self.window_gcs.get(&target_id) {
            return Ok(gc);
        }
        let window = self.targets.get(&target_id).ok_or(RenderError::UnknownTarget)?.window;
        let gc = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))
            .map_err(connection_error)?;
        self.window_gcs.insert(target_id, gc);
        Ok(gc)
    }

    fn install_buffer(&mut self, state: BufferState) -> BufferId {
        let id = BufferId(self.buffer_ids.next());
        self.pixmap_buffers.insert(state.pixmap, id);
        self.buffers.insert(id, state);
        id
    }
}

impl RenderOps for DirectRenderer {
    fn create_window_target(
        &mut self,
        window: u32,
        width: u16,
        height: u16,
        depth: u8,
    ) -> Result<TargetId, RenderError> {
        let id = TargetId(self.target_ids.next());
        let mut target = TargetState::new(window, width, height, depth);
        let event_id = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .present_select_input(
                event_id,
                window,
                present::EventMask::COMPLETE_NOTIFY | present::EventMask::IDLE_NOTIFY,
            )
            .map_err(connection_error)?;
        target.present_event_id = event_id;
        self.window_targets.insert(window, id);
        self.targets.insert(id, target);
        Ok(id)
    }

    fn create_pixmap_target(
        &mut self,
        pixmap: u32,
        width: u16,
        height: u16,
        depth: u8,
    ) -> Result<TargetId, RenderError> {
        let id = TargetId(self.target_ids.next());
        let gc = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .create_gc(gc, pixmap, &CreateGCAux::new().graphics_exposures(0))
            .map_err(connection_error)?;
        self.pixmap_gcs.insert(pixmap, gc);
        self.targets
            .insert(id, TargetState::new_pixmap(pixmap, width, height, depth));
        Ok(id)
    }

    fn destroy_target(&mut self, target_id: TargetId) {
        self.free_back_buffers(target_id);
        let Some(target) = self.targets.remove(&target_id) else {
            return;
        };
        if let Some(gc) = self.window_gcs.remove(&target_id) {
            let _ = self.connection().free_gc(gc);
        }
        self.window_targets.remove(&target.window);
        self.tracker.forget_target(target_id);
        self.completions.forget_target(target_id);
    }

    fn resize_target(&mut self, target_id: TargetId, width: u16, height: u16) {
        self.free_back_buffers(target_id);
        if let Ok(target) = self.target_mut(target_id) {
            target.width = width;
            target.height = height;
        }
    }

    fn fill_boxes_with_transparency(
        &mut self,
        target_id: TargetId,
        boxes: &[geometry::WindowBox],
    ) -> Result<(), RenderError> {
        self.ensure_back_buffer(target_id)?;
        let target = self.target_mut(target_id)?;
        let pixmap = target.current().map(|b| b.pixmap).unwrap_or_default();
        target.note_drawn();
        let gc = *self.pixmap_gcs.get(&pixmap).ok_or(RenderError::UnknownTarget)?;
        self.connection()
            .change_gc(gc, &ChangeGCAux::new().foreground(0))
            .map_err(connection_error)?;
        let rects: Vec<Rectangle> = boxes.iter().map(|&b| to_rectangle(b)).collect();
        self.connection()
            .poly_fill_rectangle(pixmap, gc, &rects)
            .map_err(connection_error)?;
        Ok(())
    }

    fn clear_rectangle(
        &mut self,
        target_id: TargetId,
        rect: geometry::WindowBox,
    ) -> Result<(), RenderError> {
        self.fill_boxes_with_transparency(target_id, &[rect])
    }

    fn composite(
        &mut self,
        buffer_id: BufferId,
        target_id: TargetId,
        _op: CompositeOp,
        src_x: i16,
        src_y: i16,
        dst_x: i16,
        dst_y: i16,
        width: u16,
        height: u16,
        _params: &DrawParams,
    ) -> Result<(), RenderError> {
        // No blending and no transforms here; the copy backend draws every
        // buffer one-to-one.
        self.ensure_back_buffer(target_id)?;
        let source = self
            .buffers
            .get(&buffer_id)
            .ok_or(RenderError::UnknownBuffer)?
            .pixmap;
        let target = self.targets.get_mut(&target_id).ok_or(RenderError::UnknownTarget)?;
        let back = target.current().map(|b| b.pixmap).unwrap_or_default();
        target.note_drawn();
        target.note_buffer_used(buffer_id);
        let gc = *self.pixmap_gcs.get(&back).ok_or(RenderError::UnknownTarget)?;
        self.connection()
            .copy_area(source, back, gc, src_x, src_y, dst_x, dst_y, width, height)
            .map_err(connection_error)?;
        Ok(())
    }

    fn finish_render(
        &mut self,
        target_id: TargetId,
        damage: &Region<WindowPixel>,
        callback: Option<PresentedCallback>,
    ) -> Result<(), RenderError> {
        let used = self.target_mut(target_id)?.take_buffers_used();
        if !used.is_empty() {
            let round_trip = RoundTripId(self.round_trips.next());
            for buffer in used {
                self.tracker.note_activity(buffer, target_id, round_trip);
            }
            self.host.send_marker(MarkerKind::BufferRelease, round_trip)?;
        }

        let target = self.targets.get(&target_id).ok_or(RenderError::UnknownTarget)?;
        let written = target.current().is_some_and(|buffer| buffer.written);
        if !written || !target.window_backed {
            if let Some(callback) = callback {
                callback(PresentedInfo::default());
            }
            return Ok(());
        }

        match callback {
            Some(callback) => {
                let (window, pixmap) = {
                    let target = self.target_mut(target_id)?;
                    (target.window, target.current().map(|b| b.pixmap).unwrap_or_default())
                };
                let serial = self.present_pixmap(window, pixmap, damage)?;
                self.completions.add(target_id, serial, callback);
                self.target_mut(target_id)?.swap_present(serial, None);
            },
            None => {
                let gc = self.window_gc(target_id)?;
                let target = self.targets.get_mut(&target_id).ok_or(RenderError::UnknownTarget)?;
                let window = target.window;
                let pixmap = target.current().map(|b| b.pixmap).unwrap_or_default();
                for rect in damage.rects() {
                    let r = to_rectangle(*rect);
                    self.host
                        .connection
                        .copy_area(pixmap, window, gc, r.x, r.y, r.x, r.y, r.width, r.height)
                        .map_err(connection_error)?;
                }
                target.swap_copy();
            },
        }
        self.connection().flush().map_err(connection_error)?;
        Ok(())
    }

    fn present_to_window(
        &mut self,
        target_id: TargetId,
        source: BufferId,
        damage: &Region<WindowPixel>,
        callback: PresentedCallback,
    ) -> Result<bool, RenderError> {
        let (window, source_pixmap) = {
            let target = self.targets.get(&target_id).ok_or(RenderError::UnknownTarget)?;
            let buffer = self.buffers.get(&source).ok_or(RenderError::UnknownBuffer)?;
            if !target.window_backed ||
                target.no_presentation ||
                buffer.depth != target.depth ||
                !buffer.flags.contains(BufferFlags::CAN_PRESENT)
            {
                return Ok(false);
            }
            (target.window, buffer.pixmap)
        };
        self.free_back_buffers(target_id);
        let serial = self.present_pixmap(window, source_pixmap, damage)?;
        self.tracker.note_present(source, target_id, serial);
        self.completions.add(target_id, serial, callback);
        self.target_mut(target_id)?.just_presented = true;
        self.connection().flush().map_err(connection_error)?;
        Ok(true)
    }

    fn cancel_presented_callback(&mut self, handle: CompletionHandle) {
        self.completions.cancel(handle);
    }

    fn target_age(&mut self, target: TargetId) -> i32 {
        self.targets.get(&target).map_or(0, |target| target.age())
    }

    fn import_fence_fd(&mut self, fd: OwnedFd) -> Result<u32, RenderError> {
        let fence = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .dri3_fence_from_fd(self.host.root, fence, false, fd)
            .map_err(connection_error)?;
        self.imported_fences.insert(fence);
        debug!("imported acquire fence {fence}");
        Ok(fence)
    }

    fn await_imported_fence(&mut self, fence: u32) -> Result<(), RenderError> {
        if !self.imported_fences.contains(&fence) {
            return Err(RenderError::Host("unknown imported fence".into()));
        }
        // Queued server-side: subsequent reads of the guarded buffer are
        // ordered after the client signals.
        self.connection()
            .sync_await_fence(&[fence])
            .map_err(connection_error)?;
        Ok(())
    }

    fn delete_imported_fence(&mut self, fence: u32) {
        if self.imported_fences.remove(&fence) {
            let _ = self.connection().sync_destroy_fence(fence);
        }
    }

    fn finish_fence(&mut self, _target: TargetId) -> Result<Option<OwnedFd>, RenderError> {
        let fd = memfd_create("waybridge-finish-fence", MemfdFlags::CLOEXEC)
            .map_err(|error| RenderError::Host(error.to_string()))?;
        rustix::fs::ftruncate(&fd, 4).map_err(|error| RenderError::Host(error.to_string()))?;
        let server_fd = fcntl_dupfd_cloexec(&fd, 0)
            .map_err(|error| RenderError::Host(error.to_string()))?;
        let fence = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .dri3_fence_from_fd(self.host.root, fence, false, server_fd)
            .map_err(connection_error)?;
        // The trigger is processed only after everything queued before it,
        // which is exactly the release point.
        self.connection().sync_trigger_fence(fence).map_err(connection_error)?;
        self.connection().sync_destroy_fence(fence).map_err(connection_error)?;
        self.connection().flush().map_err(connection_error)?;
        Ok(Some(fd))
    }

    fn handle_host_event(&mut self, event: &Event) -> bool {
        match event {
            Event::ClientMessage(message) => {
                let Some((kind, id)) = self.host.decode_marker(message) else {
                    return false;
                };
                if kind == MarkerKind::BufferRelease {
                    for idle in self.tracker.acknowledge_round_trip(id) {
                        idle.run();
                    }
                }
                true
            },
            Event::PresentCompleteNotify(notify) => {
                let Some(&target) = self.window_targets.get(&notify.window) else {
                    return false;
                };
                let serial = PresentSerial(notify.serial);
                if let Some(callback) = self.completions.complete(target, serial) {
                    callback(PresentedInfo {
                        serial,
                        msc: notify.msc,
                        ust: notify.ust,
                    });
                }
                true
            },
            Event::PresentIdleNotify(notify) => {
                let Some(&target_id) = self.window_targets.get(&notify.window) else {
                    return false;
                };
                let serial = PresentSerial(notify.serial);
                if let Some(&buffer) = self.pixmap_buffers.get(&notify.pixmap) {
                    for idle in self.tracker.present_idle(buffer, target_id, serial) {
                        idle.run();
                    }
                } else if let Some(target) = self.targets.get_mut(&target_id) {
                    target.present_idle(notify.pixmap, serial);
                }
                true
            },
            _ => false,
        }
    }
}

impl BufferOps for DirectRenderer {
    fn create_shm_buffer(&mut self, import: ShmImport) -> Result<BufferId, RenderError> {
        use x11rb::protocol::shm::ConnectionExt as _;

        let segment = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .shm_attach_fd(segment, import.pool_fd, false)
            .map_err(connection_error)?;
        let pixmap = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .shm_create_pixmap(
                pixmap,
                self.host.root,
                import.width,
                import.height,
                import.depth,
                segment,
                import.offset,
            )
            .map_err(connection_error)?;
        self.connection().shm_detach(segment).map_err(connection_error)?;

        let mut flags = BufferFlags::empty();
        if import.depth == self.host.root_depth {
            flags |= BufferFlags::CAN_PRESENT;
        }
        if import.opaque {
            flags |= BufferFlags::IS_OPAQUE;
        }
        Ok(self.install_buffer(BufferState {
            pixmap,
            width: import.width,
            height: import.height,
            depth: import.depth,
            flags,
        }))
    }

    fn create_dmabuf_buffer(&mut self, import: DmaBufImport) -> Result<BufferId, RenderError> {
        let pixmap = self.connection().generate_id().map_err(host_error)?;
        let cookie = pixmap_from_buffers(self.connection(), pixmap, self.host.root, &import)?;
        cookie
            .check()
            .map_err(|error| RenderError::BadBuffer(format!("pixmap creation failed: {error}")))?;
        let mut flags = BufferFlags::empty();
        if import.depth == self.host.root_depth {
            flags |= BufferFlags::CAN_PRESENT;
        }
        if import.opaque {
            flags |= BufferFlags::IS_OPAQUE;
        }
        Ok(self.install_buffer(BufferState {
            pixmap,
            width: import.width,
            height: import.height,
            depth: import.depth,
            flags,
        }))
    }

    fn create_dmabuf_buffer_async(
        &mut self,
        import: DmaBufImport,
        done: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
    ) -> Result<(), RenderError> {
        // The copy backend takes the synchronous path; its users are test
        // and fallback configurations where the extra round trip is fine.
        done(self.create_dmabuf_buffer(import));
        Ok(())
    }

    fn create_single_pixel_buffer(
        &mut self,
        _red: u16,
        _green: u16,
        _blue: u16,
        _alpha: u16,
    ) -> Result<BufferId, RenderError> {
        // Needs a fill with alpha, which this backend cannot express.
        Err(RenderError::Unsupported)
    }

    fn free_buffer(&mut self, buffer: BufferId) {
        let Some(state) = self.buffers.remove(&buffer) else {
            return;
        };
        self.pixmap_buffers.remove(&state.pixmap);
        let _ = self.connection().free_pixmap(state.pixmap);
        for idle in self.tracker.forget_buffer(buffer) {
            idle.run();
        }
    }

    fn buffer_flags(&self, buffer: BufferId) -> BufferFlags {
        self.buffers
            .get(&buffer)
            .map(|state| state.flags)
            .unwrap_or_default()
    }

    fn add_idle_callback(
        &mut self,
        buffer: BufferId,
        target: TargetId,
        callback: IdleCallback,
    ) -> IdleHandle {
        self.tracker.add_idle_callback(buffer, target, callback)
    }

    fn cancel_idle_callback(&mut self, handle: IdleHandle) {
        self.tracker.cancel_idle_callback(handle);
    }

    fn is_buffer_idle(&self, buffer: BufferId, target: TargetId) -> bool {
        self.tracker.is_idle(buffer, target)
    }

    fn wait_for_idle(
        &mut self,
        buffer: BufferId,
        target: TargetId,
    ) -> Result<(), RenderError> {
        while !self.tracker.is_idle(buffer, target) {
            let event = self
                .host
                .connection
                .wait_for_event()
                .map_err(connection_error)?;
            self.handle_host_event(&event);
        }
        Ok(())
    }

    fn set_need_wait_for_idle(&mut self, target: TargetId, needed: bool) {
        if let Some(target) = self.targets.get_mut(&target) {
            target.no_presentation = needed;
        }
    }

    fn picture_formats(&self) -> &[PictureFormat] {
        self.host.formats()
    }

    fn supported_modifiers(&mut self, depth: u8, bpp: u8) -> Result<Vec<u64>, RenderError> {
        let reply = self
            .connection()
            .dri3_get_supported_modifiers(self.host.root, depth, bpp)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        let mut modifiers = reply.window_modifiers;
        for modifier in reply.screen_modifiers {
            if !modifiers.contains(&modifier) {
                modifiers.push(modifier);
            }
        }
        Ok(modifiers)
    }

    fn render_device_fd(&mut self) -> Result<OwnedFd, RenderError> {
        let reply = self
            .connection()
            .dri3_open(self.host.root, 0)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        Ok(reply.device_fd)
    }
}
