/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Surfaces: the atomic unit of display. Every surface carries a current
//! and a pending state; client requests mutate pending, and a commit
//! atomically applies exactly the fields flagged pending, clears the flag
//! set and bumps the commit serial.

use std::os::fd::OwnedFd;

use base::{FxHashMap, SerialGen};
use bitflags::bitflags;
use euclid::Vector2D;
use geometry::region::Region;
use geometry::{BufferSize, BufferTransform, SurfacePixel};
use renderer::BufferId;

use crate::explicit_sync::ReleasePoint;
use crate::role::Role;
use crate::view::ViewId;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SurfaceId(pub u64);

/// Client callbacks waiting for "you may draw the next frame", fired with
/// the millisecond timestamp of the presented frame.
pub type FrameCallback = Box<dyn FnOnce(u32)>;

bitflags! {
    /// Which pending fields a commit applies.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Pending: u16 {
        const BUFFER = 1 << 0;
        const DAMAGE = 1 << 1;
        const OPAQUE = 1 << 2;
        const INPUT = 1 << 3;
        const VIEWPORT_SRC = 1 << 4;
        const VIEWPORT_DST = 1 << 5;
        const SCALE = 1 << 6;
        const TRANSFORM = 1 << 7;
        const OFFSET = 1 << 8;
        const ACQUIRE_FENCE = 1 << 9;
        const RELEASE = 1 << 10;
    }
}

/// A fractional source crop in buffer coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportSource {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Per-surface client data, keyed by type. Protocol layers hang role- and
/// extension-specific state off a surface without the core knowing the
/// concrete types.
#[derive(Default)]
pub struct DataBag {
    map: FxHashMap<std::any::TypeId, Box<dyn std::any::Any>>,
}

impl DataBag {
    pub fn insert<T: 'static>(&mut self, value: T) {
        self.map.insert(std::any::TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&std::any::TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&std::any::TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    pub fn remove<T: 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&std::any::TypeId::of::<T>())
            .and_then(|value| value.downcast().ok())
            .map(|value| *value)
    }
}

/// One of the two state copies each surface holds.
#[derive(Default)]
pub struct SurfaceState {
    pub buffer: Option<BufferId>,
    /// Pixel size of the attached buffer, recorded at attach time so size
    /// math never needs the renderer.
    pub buffer_size: Option<BufferSize>,
    /// Damage since the previous commit, in surface coordinates before
    /// scale and transform.
    pub damage: Region<SurfacePixel>,
    pub opaque: Region<SurfacePixel>,
    pub input: Region<SurfacePixel>,
    pub viewport_src: Option<ViewportSource>,
    pub viewport_dst: Option<(i32, i32)>,
    pub buffer_scale: i32,
    pub buffer_transform: BufferTransform,
    pub frame_callbacks: Vec<FrameCallback>,
    pub acquire_fence: Option<OwnedFd>,
    pub release: Option<ReleasePoint>,
    pub offset: Vector2D<i32, SurfacePixel>,
}

impl SurfaceState {
    fn new() -> Self {
        SurfaceState {
            buffer_scale: 1,
            ..Default::default()
        }
    }
}

pub struct Surface {
    pub current: SurfaceState,
    pub pending: SurfaceState,
    pub pending_flags: Pending,
    /// A surface holds at most one role for its whole lifetime.
    pub role: Option<Box<dyn Role>>,
    /// The primary content view and the phantom view kept beneath it for
    /// subsurface layering.
    pub view: Option<ViewId>,
    pub under_view: Option<ViewId>,
    /// Attached subsurface children, in attach order.
    pub subsurfaces: Vec<SurfaceId>,
    /// Client data attached by the dispatch layer.
    pub data: DataBag,
    pub commit_serial: u64,
}

/// What a commit produced, for the role and the subcompositor to act on.
#[derive(Default)]
pub struct CommitResult {
    /// The buffer the surface stopped referencing, if any. Release timing
    /// is the renderer's business; this only reports the handoff.
    pub replaced_buffer: Option<BufferId>,
    /// Damage applied by this commit, already in surface coordinates.
    pub damage: Region<SurfacePixel>,
    pub buffer_changed: bool,
}

impl Surface {
    fn new() -> Self {
        Surface {
            current: SurfaceState::new(),
            pending: SurfaceState::new(),
            pending_flags: Pending::empty(),
            role: None,
            view: None,
            under_view: None,
            subsurfaces: Vec::new(),
            data: DataBag::default(),
            commit_serial: 0,
        }
    }

    pub fn attach_buffer(&mut self, buffer: Option<BufferId>, size: Option<BufferSize>) {
        self.pending.buffer = buffer;
        self.pending.buffer_size = size;
        self.pending_flags |= Pending::BUFFER;
    }

    pub fn damage(&mut self, region: &Region<SurfacePixel>) {
        self.pending.damage.union(region);
        self.pending_flags |= Pending::DAMAGE;
    }

    pub fn set_opaque_region(&mut self, region: Region<SurfacePixel>) {
        self.pending.opaque = region;
        self.pending_flags |= Pending::OPAQUE;
    }

    pub fn set_input_region(&mut self, region: Region<SurfacePixel>) {
        self.pending.input = region;
        self.pending_flags |= Pending::INPUT;
    }

    pub fn set_viewport_src(&mut self, src: Option<ViewportSource>) {
        self.pending.viewport_src = src;
        self.pending_flags |= Pending::VIEWPORT_SRC;
    }

    pub fn set_viewport_dst(&mut self, dst: Option<(i32, i32)>) {
        self.pending.viewport_dst = dst;
        self.pending_flags |= Pending::VIEWPORT_DST;
    }

    pub fn set_buffer_scale(&mut self, scale: i32) {
        self.pending.buffer_scale = scale.max(1);
        self.pending_flags |= Pending::SCALE;
    }

    pub fn set_buffer_transform(&mut self, transform: BufferTransform) {
        self.pending.buffer_transform = transform;
        self.pending_flags |= Pending::TRANSFORM;
    }

    pub fn set_offset(&mut self, offset: Vector2D<i32, SurfacePixel>) {
        self.pending.offset = offset;
        self.pending_flags |= Pending::OFFSET;
    }

    pub fn request_frame_callback(&mut self, callback: FrameCallback) {
        self.pending.frame_callbacks.push(callback);
    }

    pub fn set_acquire_fence(&mut self, fence: OwnedFd) {
        self.pending.acquire_fence = Some(fence);
        self.pending_flags |= Pending::ACQUIRE_FENCE;
    }

    pub fn set_release(&mut self, release: ReleasePoint) {
        self.pending.release = Some(release);
        self.pending_flags |= Pending::RELEASE;
    }

    pub fn has_role(&self) -> bool {
        self.role.is_some()
    }

    pub fn mapped(&self) -> bool {
        self.current.buffer.is_some()
    }

    /// Applies the pending state. Only fields in the flag set move;
    /// afterwards the flag set is empty and the commit serial has grown,
    /// whether or not anything was pending.
    pub fn apply_pending(&mut self) -> CommitResult {
        let flags = std::mem::take(&mut self.pending_flags);
        let mut result = CommitResult::default();

        if flags.contains(Pending::BUFFER) {
            let next = self.pending.buffer.take();
            let previous = std::mem::replace(&mut self.current.buffer, next);
            self.current.buffer_size = self.pending.buffer_size.take();
            result.buffer_changed = true;
            if previous != self.current.buffer {
                result.replaced_buffer = previous;
            }
        }
        if flags.contains(Pending::DAMAGE) {
            let damage = std::mem::take(&mut self.pending.damage);
            result.damage = damage.clone();
            self.current.damage = damage;
        }
        if flags.contains(Pending::OPAQUE) {
            self.current.opaque = std::mem::take(&mut self.pending.opaque);
        }
        if flags.contains(Pending::INPUT) {
            self.current.input = std::mem::take(&mut self.pending.input);
        }
        if flags.contains(Pending::VIEWPORT_SRC) {
            self.current.viewport_src = self.pending.viewport_src;
        }
        if flags.contains(Pending::VIEWPORT_DST) {
            self.current.viewport_dst = self.pending.viewport_dst;
        }
        if flags.contains(Pending::SCALE) {
            self.current.buffer_scale = self.pending.buffer_scale;
        }
        if flags.contains(Pending::TRANSFORM) {
            self.current.buffer_transform = self.pending.buffer_transform;
        }
        if flags.contains(Pending::OFFSET) {
            self.current.offset = self.pending.offset;
        }
        if flags.contains(Pending::ACQUIRE_FENCE) {
            self.current.acquire_fence = self.pending.acquire_fence.take();
        }
        if flags.contains(Pending::RELEASE) {
            self.current.release = self.pending.release.take();
        }

        // Frame callbacks always ride along with the commit.
        let queued = std::mem::take(&mut self.pending.frame_callbacks);
        self.current.frame_callbacks.extend(queued);

        self.commit_serial += 1;
        result
    }

    /// Takes the frame callbacks due after presentation.
    pub fn take_frame_callbacks(&mut self) -> Vec<FrameCallback> {
        std::mem::take(&mut self.current.frame_callbacks)
    }
}

/// The table of all live surfaces.
#[derive(Default)]
pub struct Surfaces {
    map: FxHashMap<SurfaceId, Surface>,
    ids: SerialGen,
}

impl Surfaces {
    pub fn create(&mut self) -> SurfaceId {
        let id = SurfaceId(self.ids.next());
        self.map.insert(id, Surface::new());
        id
    }

    pub fn destroy(&mut self, id: SurfaceId) -> Option<Surface> {
        self.map.remove(&id)
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.map.get_mut(&id)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.map.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use euclid::point2;
    use geometry::SurfaceBox;

    use super::*;

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> SurfaceBox {
        SurfaceBox::new(point2(x0, y0), point2(x1, y1))
    }

    #[test]
    fn commit_applies_only_flagged_fields() {
        let mut surfaces = Surfaces::default();
        let id = surfaces.create();
        let surface = surfaces.get_mut(id).expect("surface");

        surface.attach_buffer(Some(BufferId(7)), Some(BufferSize::new(64, 64)));
        surface.pending.buffer_scale = 2; // mutated without the flag
        let result = surface.apply_pending();

        assert!(result.buffer_changed);
        assert_eq!(surface.current.buffer, Some(BufferId(7)));
        assert_eq!(surface.current.buffer_scale, 1, "unflagged field must not move");
        assert!(surface.pending_flags.is_empty());
    }

    #[test]
    fn commit_with_no_pending_flags_only_bumps_the_serial() {
        let mut surfaces = Surfaces::default();
        let id = surfaces.create();
        let surface = surfaces.get_mut(id).expect("surface");

        surface.attach_buffer(Some(BufferId(1)), None);
        surface.damage(&Region::from_rect(rect(0, 0, 4, 4)));
        surface.apply_pending();
        let serial = surface.commit_serial;
        let buffer = surface.current.buffer;

        let result = surface.apply_pending();
        assert_eq!(surface.commit_serial, serial + 1);
        assert_eq!(surface.current.buffer, buffer);
        assert!(result.damage.is_empty());
        assert!(!result.buffer_changed);
        assert!(result.replaced_buffer.is_none());
    }

    #[test]
    fn replacing_a_buffer_reports_the_old_one() {
        let mut surfaces = Surfaces::default();
        let id = surfaces.create();
        let surface = surfaces.get_mut(id).expect("surface");

        surface.attach_buffer(Some(BufferId(1)), None);
        surface.apply_pending();
        surface.attach_buffer(Some(BufferId(2)), None);
        let result = surface.apply_pending();
        assert_eq!(result.replaced_buffer, Some(BufferId(1)));

        // Re-attaching the same buffer is a change without a replacement.
        surface.attach_buffer(Some(BufferId(2)), None);
        let result = surface.apply_pending();
        assert!(result.buffer_changed);
        assert_eq!(result.replaced_buffer, None);
    }

    #[test]
    fn damage_accumulates_until_commit() {
        let mut surfaces = Surfaces::default();
        let id = surfaces.create();
        let surface = surfaces.get_mut(id).expect("surface");

        surface.damage(&Region::from_rect(rect(0, 0, 10, 10)));
        surface.damage(&Region::from_rect(rect(20, 0, 30, 10)));
        let result = surface.apply_pending();
        assert_eq!(result.damage.area(), 200);

        let result = surface.apply_pending();
        assert!(result.damage.is_empty(), "damage must not survive the commit");
    }

    #[test]
    fn data_bag_stores_one_value_per_type() {
        struct CursorHotspot(i32, i32);
        let mut surfaces = Surfaces::default();
        let id = surfaces.create();
        let surface = surfaces.get_mut(id).expect("surface");
        surface.data.insert(CursorHotspot(3, 4));
        surface.data.insert(7u32);
        assert_eq!(surface.data.get::<u32>(), Some(&7));
        surface.data.insert(9u32);
        assert_eq!(surface.data.get::<u32>(), Some(&9));
        let hotspot = surface.data.remove::<CursorHotspot>().expect("hotspot");
        assert_eq!((hotspot.0, hotspot.1), (3, 4));
        assert!(surface.data.get::<CursorHotspot>().is_none());
    }

    #[test]
    fn frame_callbacks_queue_through_commit() {
        let mut surfaces = Surfaces::default();
        let id = surfaces.create();
        let surface = surfaces.get_mut(id).expect("surface");

        surface.request_frame_callback(Box::new(|_| {}));
        surface.request_frame_callback(Box::new(|_| {}));
        surface.apply_pending();
        assert_eq!(surface.take_frame_callbacks().len(), 2);
        assert!(surface.take_frame_callbacks().is_empty());
    }
}
