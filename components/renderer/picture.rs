/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The production renderer: XRender compositing into double-buffered back
//! pixmaps, direct pixmap presentation through the Present extension, and
//! the round-trip accounting that turns host acknowledgements into buffer
//! idle events. Fenced release is not supported here; the direct backend
//! carries that.

use std::os::fd::OwnedFd;
use std::rc::Rc;

use base::{FxHashMap, PresentSerial, RoundTripId, SerialGen};
use fence::{FencePool, X11FenceHost};
use geometry::region::Region;
use geometry::{DrawParams, WindowPixel};
use log::{debug, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::render::{self, ConnectionExt as _, PictOp};
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, CreateGCAux, Gcontext, Rectangle};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::host::{
    connection_error, host_error, to_color, to_rectangle, HostContext, MarkerKind,
    PRESENT_OPTION_ASYNC,
};
use crate::records::{CompletionRecords, IdleTracker, ReadyIdle};
use crate::target::{BackBuffer, TargetState};
use crate::{
    BufferFlags, BufferId, BufferOps, CompletionHandle, CompositeOp, DmaBufImport, IdleCallback,
    IdleHandle, PictureFormat, PresentedCallback, PresentedInfo, RenderError, RenderOps,
    ShmImport, TargetId,
};

struct BufferState {
    pixmap: u32,
    picture: u32,
    width: u16,
    height: u16,
    depth: u8,
    flags: BufferFlags,
    /// The draw parameters last applied to the picture transform; `None`
    /// until the first non-identity composite.
    cached_params: Option<DrawParams>,
}

/// An asynchronous dma-buf pixmap creation awaiting its round trip.
struct PendingDmaBuf {
    /// Low 16 bits of the pixmap request's sequence number; host errors
    /// carry the same truncated counter.
    sequence: u16,
    round_trip: RoundTripId,
    state: Option<BufferState>,
    buffer: BufferId,
    done: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
    failed: bool,
}

pub struct PictureRenderer {
    host: HostContext,
    fences: FencePool<X11FenceHost>,
    buffers: FxHashMap<BufferId, BufferState>,
    targets: FxHashMap<TargetId, TargetState>,
    window_targets: FxHashMap<u32, TargetId>,
    pixmap_buffers: FxHashMap<u32, BufferId>,
    gcs: FxHashMap<TargetId, Gcontext>,
    tracker: IdleTracker,
    completions: CompletionRecords,
    pending_dmabuf: Vec<PendingDmaBuf>,
    round_trips: SerialGen,
    present_serials: SerialGen,
    buffer_ids: SerialGen,
    target_ids: SerialGen,
}

impl PictureRenderer {
    pub fn new(connection: Rc<RustConnection>, screen: usize) -> Result<Self, RenderError> {
        let host = HostContext::new(connection.clone(), screen)?;
        let fences = FencePool::new(X11FenceHost::new(connection, host.root));
        Ok(Self {
            host,
            fences,
            buffers: FxHashMap::default(),
            targets: FxHashMap::default(),
            window_targets: FxHashMap::default(),
            pixmap_buffers: FxHashMap::default(),
            gcs: FxHashMap::default(),
            tracker: IdleTracker::default(),
            completions: CompletionRecords::default(),
            pending_dmabuf: Vec::new(),
            round_trips: SerialGen::default(),
            present_serials: SerialGen::default(),
            buffer_ids: SerialGen::default(),
            target_ids: SerialGen::default(),
        })
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    fn connection(&self) -> &RustConnection {
        &self.host.connection
    }

    fn target_mut(&mut self, target: TargetId) -> Result<&mut TargetState, RenderError> {
        self.targets.get_mut(&target).ok_or(RenderError::UnknownTarget)
    }

    /// Makes sure the target has a usable current back buffer: allocates a
    /// pixmap and picture on demand and awaits the idle fence of a buffer
    /// that came back from a presentation.
    fn ensure_back_buffer(&mut self, target_id: TargetId) -> Result<(), RenderError> {
        let format = {
            let target = self.targets.get(&target_id).ok_or(RenderError::UnknownTarget)?;
            self.host
                .format_for_depth(target.depth)
                .ok_or_else(|| RenderError::Host("no picture format for target depth".into()))?
                .id
        };
        let target = self.targets.get_mut(&target_id).ok_or(RenderError::UnknownTarget)?;
        target.just_presented = false;

        if target.current().is_none() {
            let connection = self.host.connection.clone();
            let pixmap = if target.window_backed {
                let pixmap = connection.generate_id().map_err(host_error)?;
                connection
                    .create_pixmap(target.depth, pixmap, target.window, target.width, target.height)
                    .map_err(connection_error)?;
                pixmap
            } else {
                // Intermediate targets draw into their pixmap directly.
                target.window
            };
            let picture = connection.generate_id().map_err(host_error)?;
            connection
                .render_create_picture(picture, pixmap, format, &render::CreatePictureAux::new())
                .map_err(connection_error)?;
            target.install_back_buffer(BackBuffer::new(pixmap, picture));
            trace!("allocated back buffer {pixmap:#x} for target {target_id:?}");
        }

        let fence_to_await = target.current_mut().and_then(|buffer| {
            if buffer.sync_needed {
                buffer.sync_needed = false;
                buffer.busy = false;
                buffer.idle_fence.take()
            } else {
                None
            }
        });
        if let Some(fence) = fence_to_await {
            self.fences.await_fence(fence);
        }
        Ok(())
    }

    fn gc_for_target(&mut self, target_id: TargetId) -> Result<Gcontext, RenderError> {
        if let Some(&gc) = self.gcs.get(&target_id) {
            return Ok(gc);
        }
        let window = self.targets.get(&target_id).ok_or(RenderError::UnknownTarget)?.window;
        let gc = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))
            .map_err(connection_error)?;
        self.gcs.insert(target_id, gc);
        Ok(gc)
    }

    fn make_region(&self, damage: &Region<WindowPixel>) -> Result<u32, RenderError> {
        let rects: Vec<Rectangle> = damage.rects().iter().map(|&b| to_rectangle(b)).collect();
        let region = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .xfixes_create_region(region, &rects)
            .map_err(connection_error)?;
        Ok(region)
    }

    /// Presents a pixmap asynchronously and returns the serial used.
    fn present_pixmap(
        &mut self,
        window: u32,
        pixmap: u32,
        damage: &Region<WindowPixel>,
        idle_fence: u32,
    ) -> Result<PresentSerial, RenderError> {
        let serial = PresentSerial(self.present_serials.next_u32());
        let region = self.make_region(damage)?;
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
                idle_fence,
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

    fn run_ready_idles(ready: Vec<ReadyIdle>) {
        for idle in ready {
            idle.run();
        }
    }

    fn resolve_pending_dmabuf(&mut self, up_to: RoundTripId) {
        let mut resolved: Vec<PendingDmaBuf> = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending_dmabuf.len());
        for pending in self.pending_dmabuf.drain(..) {
            if pending.round_trip <= up_to {
                resolved.push(pending);
            } else {
                remaining.push(pending);
            }
        }
        self.pending_dmabuf = remaining;
        for pending in resolved {
            if pending.failed {
                debug!("async dma-buf import failed for {:?}", pending.buffer);
                if let Some(state) = pending.state {
                    // The pixmap never came to exist; the picture request
                    // failed along with it. Nothing to free beyond the ids.
                    let _ = self.connection().render_free_picture(state.picture);
                    let _ = self.connection().free_pixmap(state.pixmap);
                }
                (pending.done)(Err(RenderError::BadBuffer(
                    "the host rejected the dma-buf".into(),
                )));
            } else if let Some(state) = pending.state {
                self.pixmap_buffers.insert(state.pixmap, pending.buffer);
                self.buffers.insert(pending.buffer, state);
                (pending.done)(Ok(pending.buffer));
            }
        }
    }

    fn create_picture_for_pixmap(
        &self,
        pixmap: u32,
        pictformat: u32,
    ) -> Result<u32, RenderError> {
        let picture = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .render_create_picture(picture, pixmap, pictformat, &render::CreatePictureAux::new())
            .map_err(connection_error)?;
        Ok(picture)
    }

    fn install_buffer(&mut self, state: BufferState) -> BufferId {
        let id = BufferId(self.buffer_ids.next());
        self.pixmap_buffers.insert(state.pixmap, id);
        self.buffers.insert(id, state);
        id
    }

    fn presentable_flags(&self, depth: u8, opaque: bool) -> BufferFlags {
        let mut flags = BufferFlags::empty();
        if depth == self.host.root_depth {
            flags |= BufferFlags::CAN_PRESENT;
        }
        if opaque {
            flags |= BufferFlags::IS_OPAQUE;
        }
        flags
    }
}

impl RenderOps for PictureRenderer {
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
        debug!("created target {id:?} on window {window:#x}");
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
        self.targets
            .insert(id, TargetState::new_pixmap(pixmap, width, height, depth));
        Ok(id)
    }

    fn destroy_target(&mut self, target_id: TargetId) {
        let Some(mut target) = self.targets.remove(&target_id) else {
            return;
        };
        for (pixmap, picture) in target.release_back_buffers() {
            let _ = self.connection().render_free_picture(picture);
            // Pixmap targets draw into a drawable the caller owns.
            if pixmap != target.window {
                let _ = self.connection().free_pixmap(pixmap);
            }
        }
        if let Some(gc) = self.gcs.remove(&target_id) {
            let _ = self.connection().free_gc(gc);
        }
        self.window_targets.remove(&target.window);
        self.tracker.forget_target(target_id);
        self.completions.forget_target(target_id);
    }

    fn resize_target(&mut self, target_id: TargetId, width: u16, height: u16) {
        let Ok(target) = self.target_mut(target_id) else {
            return;
        };
        if (target.width, target.height) == (width, height) {
            return;
        }
        target.width = width;
        target.height = height;
        let drawable = target.window;
        let window_backed = target.window_backed;
        // Stale back buffers are dropped; the next composite reallocates.
        for (pixmap, picture) in target.release_back_buffers() {
            let _ = self.connection().render_free_picture(picture);
            if window_backed || pixmap != drawable {
                let _ = self.connection().free_pixmap(pixmap);
            }
        }
    }

    fn fill_boxes_with_transparency(
        &mut self,
        target_id: TargetId,
        boxes: &[geometry::WindowBox],
    ) -> Result<(), RenderError> {
        self.ensure_back_buffer(target_id)?;
        let target = self.target_mut(target_id)?;
        let picture = target.current().map(|b| b.picture).unwrap_or_default();
        target.note_drawn();
        let rects: Vec<Rectangle> = boxes.iter().map(|&b| to_rectangle(b)).collect();
        self.connection()
            .render_fill_rectangles(PictOp::CLEAR, picture, to_color(0, 0, 0, 0), &rects)
            .map_err(connection_error)?;
        Ok(())
    }

    fn clear_rectangle(
        &mut self,
        target_id: TargetId,
        rect: geometry::WindowBox,
    ) -> Result<(), RenderError> {
        self.ensure_back_buffer(target_id)?;
        let target = self.target_mut(target_id)?;
        let picture = target.current().map(|b| b.picture).unwrap_or_default();
        target.note_drawn();
        self.connection()
            .render_fill_rectangles(
                PictOp::SRC,
                picture,
                to_color(0, 0, 0, 0),
                &[to_rectangle(rect)],
            )
            .map_err(connection_error)?;
        Ok(())
    }

    fn composite(
        &mut self,
        buffer_id: BufferId,
        target_id: TargetId,
        op: CompositeOp,
        src_x: i16,
        src_y: i16,
        dst_x: i16,
        dst_y: i16,
        width: u16,
        height: u16,
        params: &DrawParams,
    ) -> Result<(), RenderError> {
        self.ensure_back_buffer(target_id)?;

        let buffer = self.buffers.get_mut(&buffer_id).ok_or(RenderError::UnknownBuffer)?;
        if buffer.cached_params.as_ref() != Some(params) {
            let size = geometry::BufferSize::new(i32::from(buffer.width), i32::from(buffer.height));
            let m = params.to_fixed_matrix(size);
            self.host
                .connection
                .render_set_picture_transform(
                    buffer.picture,
                    render::Transform {
                        matrix11: m[0][0],
                        matrix12: m[0][1],
                        matrix13: m[0][2],
                        matrix21: m[1][0],
                        matrix22: m[1][1],
                        matrix23: m[1][2],
                        matrix31: m[2][0],
                        matrix32: m[2][1],
                        matrix33: m[2][2],
                    },
                )
                .map_err(connection_error)?;
            let smooth = params.scale != 1 || params.stretch.is_some();
            let filter: &[u8] = if smooth { b"bilinear" } else { b"nearest" };
            self.host
                .connection
                .render_set_picture_filter(buffer.picture, filter, &[])
                .map_err(connection_error)?;
            buffer.cached_params = Some(*params);
        }
        let src_picture = buffer.picture;

        let target = self.targets.get_mut(&target_id).ok_or(RenderError::UnknownTarget)?;
        let dst_picture = target.current().map(|b| b.picture).unwrap_or_default();
        target.note_drawn();
        target.note_buffer_used(buffer_id);

        let op = match op {
            CompositeOp::Over => PictOp::OVER,
            CompositeOp::Source => PictOp::SRC,
        };
        self.connection()
            .render_composite(
                op,
                src_picture,
                x11rb::NONE,
                dst_picture,
                src_x,
                src_y,
                0,
                0,
                dst_x,
                dst_y,
                width,
                height,
            )
            .map_err(connection_error)?;
        Ok(())
    }

    fn finish_render(
        &mut self,
        target_id: TargetId,
        damage: &Region<WindowPixel>,
        callback: Option<PresentedCallback>,
    ) -> Result<(), RenderError> {
        let used = {
            let target = self.target_mut(target_id)?;
            target.take_buffers_used()
        };
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
            // Pixmap targets have their result in place already.
            if let Some(callback) = callback {
                callback(PresentedInfo::default());
            }
            return Ok(());
        }

        match callback {
            Some(callback) => {
                let fence = self.fences.acquire().map_err(|e| RenderError::Host(e.to_string()))?;
                let fence_id = self.fences.id(fence);
                let (window, pixmap) = {
                    let target = self.target_mut(target_id)?;
                    let pixmap = target.current().map(|b| b.pixmap).unwrap_or_default();
                    (target.window, pixmap)
                };
                let serial = self.present_pixmap(window, pixmap, damage, fence_id)?;
                self.completions.add(target_id, serial, callback);
                let target = self.target_mut(target_id)?;
                target.swap_present(serial, Some(fence));
            },
            None => {
                let gc = self.gc_for_target(target_id)?;
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

        let freed = {
            let target = self.target_mut(target_id)?;
            target.release_back_buffers()
        };
        for (pixmap, picture) in freed {
            let _ = self.connection().render_free_picture(picture);
            let _ = self.connection().free_pixmap(pixmap);
        }

        let serial = self.present_pixmap(window, source_pixmap, damage, x11rb::NONE)?;
        self.tracker.note_present(source, target_id, serial);
        self.completions.add(target_id, serial, callback);
        let target = self.target_mut(target_id)?;
        target.just_presented = true;
        self.connection().flush().map_err(connection_error)?;
        trace!("presented buffer {source:?} directly with serial {serial:?}");
        Ok(true)
    }

    fn cancel_presented_callback(&mut self, handle: CompletionHandle) {
        self.completions.cancel(handle);
    }

    fn target_age(&mut self, target: TargetId) -> i32 {
        self.targets.get(&target).map_or(0, |target| target.age())
    }

    fn import_fence_fd(&mut self, _fd: OwnedFd) -> Result<u32, RenderError> {
        // Fenced synchronization is the direct backend's job.
        Err(RenderError::Unsupported)
    }

    fn await_imported_fence(&mut self, _fence: u32) -> Result<(), RenderError> {
        Err(RenderError::Unsupported)
    }

    fn delete_imported_fence(&mut self, _fence: u32) {}

    fn finish_fence(&mut self, _target: TargetId) -> Result<Option<OwnedFd>, RenderError> {
        Ok(None)
    }

    fn handle_host_event(&mut self, event: &Event) -> bool {
        match event {
            Event::ClientMessage(message) => {
                let Some((kind, id)) = self.host.decode_marker(message) else {
                    return false;
                };
                match kind {
                    MarkerKind::BufferRelease => {
                        Self::run_ready_idles(self.tracker.acknowledge_round_trip(id));
                    },
                    MarkerKind::DmaBufCreated => self.resolve_pending_dmabuf(id),
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
                    Self::run_ready_idles(self.tracker.present_idle(buffer, target_id, serial));
                } else if let Some(target) = self.targets.get_mut(&target_id) {
                    target.present_idle(notify.pixmap, serial);
                }
                true
            },
            Event::Error(error) => {
                let mut matched = false;
                for pending in &mut self.pending_dmabuf {
                    if pending.sequence == error.sequence {
                        pending.failed = true;
                        matched = true;
                    }
                }
                if matched {
                    warn!(
                        "host rejected async pixmap creation (major {}, minor {})",
                        error.major_opcode, error.minor_opcode
                    );
                }
                matched
            },
            _ => false,
        }
    }
}

impl BufferOps for PictureRenderer {
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
        // The pixmap keeps the segment alive on the host side.
        self.connection().shm_detach(segment).map_err(connection_error)?;

        let picture = self.create_picture_for_pixmap(pixmap, import.pictformat)?;
        let flags = self.presentable_flags(import.depth, import.opaque);
        Ok(self.install_buffer(BufferState {
            pixmap,
            picture,
            width: import.width,
            height: import.height,
            depth: import.depth,
            flags,
            cached_params: None,
        }))
    }

    fn create_dmabuf_buffer(&mut self, import: DmaBufImport) -> Result<BufferId, RenderError> {
        let pixmap = self.connection().generate_id().map_err(host_error)?;
        let cookie = pixmap_from_buffers(self.connection(), pixmap, self.host.root, &import)?;
        // The synchronous path trades a round trip for immediate errors.
        cookie.check().map_err(|error| {
            RenderError::BadBuffer(format!("pixmap creation failed: {error}"))
        })?;
        let picture = self.create_picture_for_pixmap(pixmap, import.pictformat)?;
        let flags = self.presentable_flags(import.depth, import.opaque);
        Ok(self.install_buffer(BufferState {
            pixmap,
            picture,
            width: import.width,
            height: import.height,
            depth: import.depth,
            flags,
            cached_params: None,
        }))
    }

    fn create_dmabuf_buffer_async(
        &mut self,
        import: DmaBufImport,
        done: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
    ) -> Result<(), RenderError> {
        let pixmap = self.connection().generate_id().map_err(host_error)?;
        let cookie = pixmap_from_buffers(self.connection(), pixmap, self.host.root, &import)?;
        let sequence = cookie.sequence_number() as u16;
        // Errors for the dropped cookie surface through the event queue,
        // where handle_host_event matches them back to this record.
        drop(cookie);

        let picture = self.create_picture_for_pixmap(pixmap, import.pictformat)?;
        let flags = self.presentable_flags(import.depth, import.opaque);
        let buffer = BufferId(self.buffer_ids.next());
        let round_trip = RoundTripId(self.round_trips.next());
        self.pending_dmabuf.push(PendingDmaBuf {
            sequence,
            round_trip,
            state: Some(BufferState {
                pixmap,
                picture,
                width: import.width,
                height: import.height,
                depth: import.depth,
                flags,
                cached_params: None,
            }),
            buffer,
            done,
            failed: false,
        });
        self.host.send_marker(MarkerKind::DmaBufCreated, round_trip)?;
        self.connection().flush().map_err(connection_error)?;
        Ok(())
    }

    fn create_single_pixel_buffer(
        &mut self,
        red: u16,
        green: u16,
        blue: u16,
        alpha: u16,
    ) -> Result<BufferId, RenderError> {
        let format = self
            .host
            .formats()
            .iter()
            .find(|format| format.depth == 32 && format.alpha_mask != 0)
            .copied()
            .ok_or_else(|| RenderError::Host("host has no ARGB32 picture format".into()))?;
        let pixmap = self.connection().generate_id().map_err(host_error)?;
        self.connection()
            .create_pixmap(32, pixmap, self.host.root, 1, 1)
            .map_err(connection_error)?;
        let picture = self.create_picture_for_pixmap(pixmap, format.id)?;
        self.connection()
            .render_fill_rectangles(
                PictOp::SRC,
                picture,
                to_color(red, green, blue, alpha),
                &[Rectangle {
                    x: 0,
                    y: 0,
                    width: 1,
                    height: 1,
                }],
            )
            .map_err(connection_error)?;
        let flags = self.presentable_flags(32, alpha == u16::MAX);
        Ok(self.install_buffer(BufferState {
            pixmap,
            picture,
            width: 1,
            height: 1,
            depth: 32,
            flags,
            cached_params: None,
        }))
    }

    fn free_buffer(&mut self, buffer: BufferId) {
        let Some(state) = self.buffers.remove(&buffer) else {
            return;
        };
        self.pixmap_buffers.remove(&state.pixmap);
        let _ = self.connection().render_free_picture(state.picture);
        let _ = self.connection().free_pixmap(state.pixmap);
        Self::run_ready_idles(self.tracker.forget_buffer(buffer));
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
        // Hard serialization: drain host events until the pair is released.
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

/// Issues the four-plane pixmap request. The connection takes ownership of
/// every plane descriptor, so they are closed exactly once whether or not
/// the host accepts the buffers.
pub(crate) fn pixmap_from_buffers<'c>(
    connection: &'c RustConnection,
    pixmap: u32,
    window: u32,
    import: &DmaBufImport,
) -> Result<x11rb::cookie::VoidCookie<'c, RustConnection>, RenderError> {
    let mut strides = [0u32; 4];
    let mut offsets = [0u32; 4];
    let mut fds = Vec::with_capacity(import.planes.len());
    for (index, plane) in import.planes.iter().enumerate().take(4) {
        strides[index] = plane.stride;
        offsets[index] = plane.offset;
        fds.push(
            plane
                .fd
                .try_clone()
                .map_err(|error| RenderError::BadBuffer(error.to_string()))?,
        );
    }
    connection
        .dri3_pixmap_from_buffers(
            pixmap,
            window,
            import.width,
            import.height,
            strides[0],
            offsets[0],
            strides[1],
            offsets[1],
            strides[2],
            offsets[2],
            strides[3],
            offsets[3],
            import.depth,
            import.bpp,
            import.modifier,
            fds,
        )
        .map_err(connection_error)
}
