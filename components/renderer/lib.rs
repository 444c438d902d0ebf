/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The renderer: client buffers mapped to host pixmaps and pictures, render
//! targets with double-buffered back buffers, reference-counted idle
//! tracking, and the round-trip acknowledgement protocol.
//!
//! Two backends implement the same trait pair. [`picture::PictureRenderer`]
//! is the production backend: XRender compositing with cached picture
//! transforms, plus direct pixmap presentation. [`direct::DirectRenderer`]
//! is the simpler backend selectable at startup: plain copies instead of
//! composites, but with explicit-synchronization fence support the picture
//! backend stubs out.

pub mod direct;
pub mod host;
pub mod picture;
pub mod records;
pub mod target;

use std::os::fd::OwnedFd;

use base::PresentSerial;
use bitflags::bitflags;
use geometry::region::Region;
use geometry::{DrawParams, WindowPixel};
use thiserror::Error;
use x11rb::protocol::Event;

pub use crate::records::{CompletionHandle, IdleHandle};

/// A render buffer owned by the renderer; clients hold this id through
/// their protocol resources.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BufferId(pub u64);

/// A render target: a host window for role surface trees, or a pixmap for
/// intermediate rendering.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TargetId(pub u64);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("host request failed: {0}")]
    Host(String),
    #[error("the host connection is gone: {0}")]
    Connection(String),
    #[error("no such buffer")]
    UnknownBuffer,
    #[error("no such target")]
    UnknownTarget,
    #[error("the backend does not support this operation")]
    Unsupported,
    #[error("buffer import was rejected: {0}")]
    BadBuffer(String),
}

bitflags! {
    /// Properties of a render buffer established at import time.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct BufferFlags: u8 {
        /// The buffer's format matches the target window's and it may be
        /// handed to the host for direct presentation.
        const CAN_PRESENT = 1 << 0;
        /// Every pixel is alpha-opaque.
        const IS_OPAQUE = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompositeOp {
    Over,
    Source,
}

/// Timing data delivered with a presentation completion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PresentedInfo {
    pub serial: PresentSerial,
    /// Media stream counter of the vblank the frame was shown at.
    pub msc: u64,
    /// Host timestamp of that vblank, in microseconds.
    pub ust: u64,
}

pub type PresentedCallback = Box<dyn FnOnce(PresentedInfo)>;
pub type IdleCallback = Box<dyn FnOnce(BufferId, TargetId)>;

/// The sentinel age reported after a direct presentation: the back buffer
/// contents are not ours to reason about.
pub const AGE_FOREIGN: i32 = -2;

/// One shared-memory plane already validated and duplicated by the buffer
/// registry.
#[derive(Debug)]
pub struct ShmImport {
    pub pool_fd: OwnedFd,
    pub pool_size: u32,
    pub offset: u32,
    pub stride: u32,
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub pictformat: u32,
    pub opaque: bool,
}

#[derive(Debug)]
pub struct DmaBufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

#[derive(Debug)]
pub struct DmaBufImport {
    pub planes: Vec<DmaBufPlane>,
    pub modifier: u64,
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub bpp: u8,
    pub pictformat: u32,
    pub opaque: bool,
}

/// A picture format supported by the host, as cached at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PictureFormat {
    pub id: u32,
    pub depth: u8,
    pub bpp: u8,
    pub scanline_pad: u8,
    pub red_mask: u16,
    pub green_mask: u16,
    pub blue_mask: u16,
    pub alpha_mask: u16,
    pub red_shift: u16,
    pub green_shift: u16,
    pub blue_shift: u16,
    pub alpha_shift: u16,
}

/// Rendering operations, one vtable per backend.
pub trait RenderOps {
    /// Creates a target backed by a host window.
    fn create_window_target(
        &mut self,
        window: u32,
        width: u16,
        height: u16,
        depth: u8,
    ) -> Result<TargetId, RenderError>;

    /// Creates a target that renders straight into an existing pixmap;
    /// used for intermediate render passes. Such targets never present.
    fn create_pixmap_target(
        &mut self,
        pixmap: u32,
        width: u16,
        height: u16,
        depth: u8,
    ) -> Result<TargetId, RenderError>;

    fn destroy_target(&mut self, target: TargetId);

    /// Notes a host-side resize so back buffers are reallocated lazily.
    fn resize_target(&mut self, target: TargetId, width: u16, height: u16);

    /// Fills boxes with transparent black, used to punch holes for
    /// subsurfaces below their parent.
    fn fill_boxes_with_transparency(
        &mut self,
        target: TargetId,
        boxes: &[geometry::WindowBox],
    ) -> Result<(), RenderError>;

    fn clear_rectangle(
        &mut self,
        target: TargetId,
        rect: geometry::WindowBox,
    ) -> Result<(), RenderError>;

    /// Composites `width`×`height` pixels of `buffer` starting at
    /// (`src_x`, `src_y`) to (`dst_x`, `dst_y`) on the target's back
    /// buffer. Updates the cached picture transform when `params` differ
    /// from the last composite of this buffer.
    #[allow(clippy::too_many_arguments)]
    fn composite(
        &mut self,
        buffer: BufferId,
        target: TargetId,
        op: CompositeOp,
        src_x: i16,
        src_y: i16,
        dst_x: i16,
        dst_y: i16,
        width: u16,
        height: u16,
        params: &DrawParams,
    ) -> Result<(), RenderError>;

    /// Ends one subcompositor update: issues the round-trip marker for the
    /// buffers used, then either presents the back buffer (when a callback
    /// wants presentation timing) or copies the damage to the window.
    fn finish_render(
        &mut self,
        target: TargetId,
        damage: &Region<WindowPixel>,
        callback: Option<PresentedCallback>,
    ) -> Result<(), RenderError>;

    /// Flips `source` directly to the window, bypassing compositing.
    /// Returns false, without side effects, when a precondition fails and
    /// the caller must composite instead.
    fn present_to_window(
        &mut self,
        target: TargetId,
        source: BufferId,
        damage: &Region<WindowPixel>,
        callback: PresentedCallback,
    ) -> Result<bool, RenderError>;

    fn cancel_presented_callback(&mut self, handle: CompletionHandle);

    /// The age of the current back buffer in swaps, or [`AGE_FOREIGN`]
    /// right after a direct presentation.
    fn target_age(&mut self, target: TargetId) -> i32;

    /// Imports a client-exported acquire fence. Only the direct backend
    /// supports this.
    fn import_fence_fd(&mut self, fd: OwnedFd) -> Result<u32, RenderError>;

    /// Queues a host-side await of an imported fence, ordering it before
    /// subsequent reads of the guarded buffer.
    fn await_imported_fence(&mut self, fence: u32) -> Result<(), RenderError>;

    fn delete_imported_fence(&mut self, fence: u32);

    /// A fence that triggers once every request issued so far has been
    /// processed, for fenced buffer release. `Ok(None)` when the backend
    /// cannot provide one.
    fn finish_fence(&mut self, target: TargetId) -> Result<Option<OwnedFd>, RenderError>;

    /// Feeds one host event to the backend. Returns true when the event was
    /// consumed (marker echo, present notify, caught request error).
    fn handle_host_event(&mut self, event: &Event) -> bool;
}

/// Buffer operations, the second vtable of each backend.
pub trait BufferOps {
    fn create_shm_buffer(&mut self, import: ShmImport) -> Result<BufferId, RenderError>;

    /// Synchronous dma-buf import; on failure every plane fd is closed.
    fn create_dmabuf_buffer(&mut self, import: DmaBufImport) -> Result<BufferId, RenderError>;

    /// Optimistic asynchronous dma-buf import: the pixmap request is issued
    /// and a round trip forced; a host error for that specific request
    /// resolves to the callback's `Err` arm.
    fn create_dmabuf_buffer_async(
        &mut self,
        import: DmaBufImport,
        done: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
    ) -> Result<(), RenderError>;

    /// A 1×1 buffer holding a single solid color, 16-bit channels.
    fn create_single_pixel_buffer(
        &mut self,
        red: u16,
        green: u16,
        blue: u16,
        alpha: u16,
    ) -> Result<BufferId, RenderError>;

    fn free_buffer(&mut self, buffer: BufferId);

    fn buffer_flags(&self, buffer: BufferId) -> BufferFlags;

    fn is_buffer_opaque(&self, buffer: BufferId) -> bool {
        self.buffer_flags(buffer).contains(BufferFlags::IS_OPAQUE)
    }

    /// Registers a one-shot callback run when the pair goes idle.
    fn add_idle_callback(
        &mut self,
        buffer: BufferId,
        target: TargetId,
        callback: IdleCallback,
    ) -> IdleHandle;

    fn cancel_idle_callback(&mut self, handle: IdleHandle);

    /// A pair is idle iff no activity record and no present record links it.
    fn is_buffer_idle(&self, buffer: BufferId, target: TargetId) -> bool;

    /// Drains host events synchronously until the pair is idle. Only used
    /// when hard serialization is required, e.g. before unmapping the shm
    /// pool backing the buffer.
    fn wait_for_idle(&mut self, buffer: BufferId, target: TargetId)
    -> Result<(), RenderError>;

    /// Disables direct presentation on the target so buffer release timing
    /// stays exact.
    fn set_need_wait_for_idle(&mut self, target: TargetId, needed: bool);

    /// The host picture formats cached at startup.
    fn picture_formats(&self) -> &[PictureFormat];

    /// Host-supported dma-buf modifiers for a format of the given geometry.
    fn supported_modifiers(&mut self, depth: u8, bpp: u8) -> Result<Vec<u64>, RenderError>;

    /// The render node of the host's DRI3 device.
    fn render_device_fd(&mut self) -> Result<OwnedFd, RenderError>;
}
