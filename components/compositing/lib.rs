/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The surface graph and its update machinery: surfaces with double
//! state, the view tree and damage-driven subcompositor, surface roles,
//! the frame clock, the sync helper and per-surface explicit
//! synchronization.
//!
//! [`Scene`] ties the pieces together for one output: it owns the surface
//! table, the subcompositor and the queue of pending subsurface restack
//! requests, and runs the commit pipeline. Pending state applies
//! atomically, synchronized subsurfaces defer to their parent, and restack
//! requests replay in reverse insertion order at the parent's commit.

pub mod clock_host;
pub mod explicit_sync;
pub mod frame_clock;
pub mod role;
pub mod subcompositor;
pub mod subsurface;
pub mod surface;
pub mod sync_helper;
pub mod view;
pub mod wm_events;

use base::FxHashMap;
use log::debug;

use crate::role::{ErrorSink, ProtocolError, RoleKind};
use crate::subcompositor::Subcompositor;
use crate::subsurface::{Placement, PlacementKind, SubsurfaceRole};
use crate::surface::{FrameCallback, SurfaceId, Surfaces};

pub use crate::frame_clock::FrameClock;
pub use crate::sync_helper::{SyncHelper, SyncMode};

/// The per-output scene: surfaces, their views, and the pending subsurface
/// placements.
#[derive(Default)]
pub struct Scene {
    pub surfaces: Surfaces,
    pub subcompositor: Subcompositor,
    /// Restack requests recorded against each parent between its commits.
    pending_placements: FxHashMap<SurfaceId, Vec<Placement>>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a surface together with its two views: the content view and
    /// the phantom view kept beneath it for subsurface layering.
    pub fn create_surface(&mut self) -> SurfaceId {
        let id = self.surfaces.create();
        let under = self.subcompositor.tree.create(None);
        let view = self.subcompositor.tree.create(Some(id));
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.under_view = Some(under);
            surface.view = Some(view);
        }
        id
    }

    /// Makes `surface`'s content view the root of the view tree; the role
    /// owning the output calls this once.
    pub fn set_root_surface(&mut self, surface: SurfaceId) {
        if let Some(view) = self.surfaces.get(surface).and_then(|surface| surface.view) {
            self.subcompositor.tree.set_root(view);
        }
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) {
        let Some(surface) = self.surfaces.destroy(id) else {
            return;
        };
        if let Some(role) = surface.role.as_ref() {
            if let Some(subsurface) = role.as_subsurface() {
                if let Some(parent) = self.surfaces.get_mut(subsurface.parent) {
                    parent.subsurfaces.retain(|&child| child != id);
                }
            }
        }
        for view in [surface.view, surface.under_view].into_iter().flatten() {
            self.subcompositor.damage_view(view, &self.surfaces);
            self.subcompositor.tree.remove(view);
        }
        self.pending_placements.remove(&id);
        debug!("destroyed surface {id:?}");
    }

    /// Gives `child` the subsurface role under `parent` and stacks it on
    /// top of the parent's children.
    pub fn make_subsurface(
        &mut self,
        child: SurfaceId,
        parent: SurfaceId,
        sink: &mut dyn ErrorSink,
    ) -> bool {
        if child == parent || !self.surfaces.contains(parent) {
            sink.post_error(ProtocolError::BadPlacement);
            return false;
        }
        let Some(child_surface) = self.surfaces.get(child) else {
            sink.post_error(ProtocolError::BadPlacement);
            return false;
        };
        if child_surface.has_role() {
            sink.post_error(ProtocolError::RoleAlreadyTaken);
            return false;
        }
        let (Some(child_under), Some(child_view)) =
            (child_surface.under_view, child_surface.view)
        else {
            sink.post_error(ProtocolError::BadPlacement);
            return false;
        };
        let Some(parent_view) = self.surfaces.get(parent).and_then(|surface| surface.view)
        else {
            sink.post_error(ProtocolError::BadPlacement);
            return false;
        };

        self.subcompositor.tree.insert_last(parent_view, child_under);
        self.subcompositor.tree.insert_last(parent_view, child_view);
        if let Some(surface) = self.surfaces.get_mut(child) {
            surface.role = Some(Box::new(SubsurfaceRole::new(parent)));
        }
        if let Some(surface) = self.surfaces.get_mut(parent) {
            surface.subsurfaces.push(child);
        }
        true
    }

    fn parent_of_subsurface(&self, surface: SurfaceId) -> Option<SurfaceId> {
        self.surfaces
            .get(surface)?
            .role
            .as_ref()?
            .as_subsurface()
            .map(|subsurface| subsurface.parent)
    }

    fn queue_placement(
        &mut self,
        kind: PlacementKind,
        surface: SurfaceId,
        sibling: SurfaceId,
        sink: &mut dyn ErrorSink,
    ) {
        let Some(parent) = self.parent_of_subsurface(surface) else {
            sink.post_error(ProtocolError::BadPlacement);
            return;
        };
        let sibling_ok = sibling == parent ||
            self.parent_of_subsurface(sibling) == Some(parent);
        if !sibling_ok || sibling == surface {
            sink.post_error(ProtocolError::BadPlacement);
            return;
        }
        // Newest requests sit at the head; the replay walks the list
        // backwards, so the request issued last takes effect last.
        self.pending_placements.entry(parent).or_default().insert(
            0,
            Placement {
                kind,
                surface,
                sibling,
            },
        );
    }

    /// Queues a place-above request, applied at the parent's next commit.
    pub fn place_above(
        &mut self,
        surface: SurfaceId,
        sibling: SurfaceId,
        sink: &mut dyn ErrorSink,
    ) {
        self.queue_placement(PlacementKind::Above, surface, sibling, sink);
    }

    pub fn place_below(
        &mut self,
        surface: SurfaceId,
        sibling: SurfaceId,
        sink: &mut dyn ErrorSink,
    ) {
        self.queue_placement(PlacementKind::Below, surface, sibling, sink);
    }

    /// Sets a subsurface's position in parent coordinates, applied at the
    /// parent's next commit. The fractional part becomes a sub-pixel
    /// offset at composite time.
    pub fn set_subsurface_position(&mut self, surface: SurfaceId, x: f64, y: f64) {
        if let Some(subsurface) = self
            .surfaces
            .get_mut(surface)
            .and_then(|surface| surface.role.as_mut())
            .and_then(|role| role.as_subsurface_mut())
        {
            subsurface.pending_position = Some((x, y));
        }
    }

    /// Switches a subsurface between synchronized and desynchronized
    /// commits. Leaving synchronized mode applies any deferred commit.
    pub fn set_subsurface_synchronized(
        &mut self,
        surface: SurfaceId,
        synchronized: bool,
        sink: &mut dyn ErrorSink,
    ) {
        let mut apply_now = false;
        if let Some(subsurface) = self
            .surfaces
            .get_mut(surface)
            .and_then(|surface| surface.role.as_mut())
            .and_then(|role| role.as_subsurface_mut())
        {
            if subsurface.synchronized && !synchronized && subsurface.needs_apply {
                apply_now = true;
            }
            subsurface.synchronized = synchronized;
        }
        if apply_now {
            self.effective_commit(surface, sink);
        }
    }

    /// A client commit. Synchronized subsurfaces only note that state is
    /// waiting; everything else applies immediately.
    pub fn commit(&mut self, surface_id: SurfaceId, sink: &mut dyn ErrorSink) {
        let deferred = self
            .surfaces
            .get_mut(surface_id)
            .and_then(|surface| surface.role.as_mut())
            .and_then(|role| role.as_subsurface_mut())
            .map(|subsurface| {
                if subsurface.synchronized {
                    subsurface.needs_apply = true;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !deferred {
            self.effective_commit(surface_id, sink);
        }
    }

    /// The effective commit: applies pending state, updates the view,
    /// replays queued restacks newest-first, and walks synchronized
    /// children.
    fn effective_commit(&mut self, surface_id: SurfaceId, sink: &mut dyn ErrorSink) {
        let Some(surface) = self.surfaces.get_mut(surface_id) else {
            return;
        };
        let mut role = surface.role.take();
        if let Some(role) = role.as_mut() {
            role.early_commit(self, surface_id);
        }

        let Some(surface) = self.surfaces.get_mut(surface_id) else {
            return;
        };
        let result = surface.apply_pending();
        let view = surface.view;

        subsurface::apply_map_state(self, surface_id);
        if let Some(view) = view {
            self.subcompositor
                .note_surface_damage(view, &result.damage, &self.surfaces);
        }

        if let Some(role) = role.as_mut() {
            role.commit(self, surface_id, sink);
        }
        if let Some(surface) = self.surfaces.get_mut(surface_id) {
            surface.role = role;
        }

        self.replay_placements(surface_id);
        self.commit_children(surface_id, sink);
    }

    /// Replays the queued restacks in reverse of their insertion order,
    /// so the final z-order matches the order the requests were issued in.
    fn replay_placements(&mut self, parent: SurfaceId) {
        let Some(placements) = self.pending_placements.remove(&parent) else {
            return;
        };
        for placement in placements.into_iter().rev() {
            self.apply_placement(parent, placement);
        }
    }

    fn apply_placement(&mut self, parent: SurfaceId, placement: Placement) {
        // A request whose other surface died before the replay is dropped.
        if !self.surfaces.contains(placement.surface) {
            return;
        }
        if placement.sibling != parent && !self.surfaces.contains(placement.sibling) {
            return;
        }
        let Some((child_under, child_view)) = self
            .surfaces
            .get(placement.surface)
            .and_then(|surface| Some((surface.under_view?, surface.view?)))
        else {
            return;
        };

        let tree = &mut self.subcompositor.tree;
        tree.unparent(child_under);
        tree.unparent(child_view);

        match placement.kind {
            PlacementKind::Above => {
                if placement.sibling == parent {
                    // Bottom of the above-parent stack.
                    let Some(parent_view) =
                        self.surfaces.get(parent).and_then(|surface| surface.view)
                    else {
                        return;
                    };
                    let tree = &mut self.subcompositor.tree;
                    tree.insert_first(parent_view, child_view);
                    tree.insert_first(parent_view, child_under);
                } else {
                    let Some(anchor) = self
                        .surfaces
                        .get(placement.sibling)
                        .and_then(|surface| surface.view)
                    else {
                        return;
                    };
                    let tree = &mut self.subcompositor.tree;
                    tree.insert_after(anchor, child_under);
                    tree.insert_after(child_under, child_view);
                }
            },
            PlacementKind::Below => {
                if placement.sibling == parent {
                    // Top of the below-parent stack.
                    let Some(parent_under) = self
                        .surfaces
                        .get(parent)
                        .and_then(|surface| surface.under_view)
                    else {
                        return;
                    };
                    let tree = &mut self.subcompositor.tree;
                    tree.insert_last(parent_under, child_under);
                    tree.insert_last(parent_under, child_view);
                } else {
                    let Some(anchor) = self
                        .surfaces
                        .get(placement.sibling)
                        .and_then(|surface| surface.under_view)
                    else {
                        return;
                    };
                    let tree = &mut self.subcompositor.tree;
                    tree.insert_before(anchor, child_under);
                    tree.insert_after(child_under, child_view);
                }
            },
        }
        if let Some(view) = self
            .surfaces
            .get(placement.surface)
            .and_then(|surface| surface.view)
        {
            self.subcompositor.damage_view(view, &self.surfaces);
        }
    }

    /// Applies pending positions and deferred commits of the children, in
    /// attach order.
    fn commit_children(&mut self, parent: SurfaceId, sink: &mut dyn ErrorSink) {
        let children = self
            .surfaces
            .get(parent)
            .map(|surface| surface.subsurfaces.clone())
            .unwrap_or_default();
        for child in children {
            self.apply_subsurface_position(child);
            let needs_apply = self
                .surfaces
                .get_mut(child)
                .and_then(|surface| surface.role.as_mut())
                .and_then(|role| role.as_subsurface_mut())
                .map(|subsurface| {
                    if subsurface.synchronized && subsurface.needs_apply {
                        subsurface.needs_apply = false;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if needs_apply {
                self.effective_commit(child, sink);
            }
        }
    }

    /// Splits the stored fractional position into the integer view
    /// placement and the sub-pixel composite offset.
    fn apply_subsurface_position(&mut self, child: SurfaceId) {
        let Some(surface) = self.surfaces.get_mut(child) else {
            return;
        };
        let Some(subsurface) = surface
            .role
            .as_mut()
            .and_then(|role| role.as_subsurface_mut())
        else {
            return;
        };
        if let Some(position) = subsurface.pending_position.take() {
            subsurface.position = position;
        }
        let (x, y) = subsurface.position;
        let (view, under_view) = (surface.view, surface.under_view);
        let integer: euclid::Point2D<i32, geometry::WindowPixel> =
            euclid::point2(x.floor() as i32, y.floor() as i32);
        let fractional = euclid::vec2(x - x.floor(), y - y.floor());
        let scale = self.subcompositor.scale();
        let placed = euclid::point2(integer.x * scale, integer.y * scale);
        for view in [view, under_view].into_iter().flatten() {
            if let Some(state) = self.subcompositor.tree.get_mut(view) {
                if state.position != placed || state.fractional_offset != fractional {
                    state.position = placed;
                    state.fractional_offset = fractional;
                }
            }
        }
    }

    /// The committed z-order of surfaces, back to front. Drives the tests
    /// and the input-region lookup of the dispatch layer.
    pub fn z_order(&self) -> Vec<SurfaceId> {
        self.subcompositor
            .tree
            .z_order()
            .into_iter()
            .filter_map(|view| self.subcompositor.tree.get(view)?.surface)
            .collect()
    }

    /// Collects the frame callbacks of every mapped surface in the tree,
    /// due after the current frame presents.
    pub fn collect_frame_callbacks(&mut self) -> Vec<FrameCallback> {
        let surfaces: Vec<SurfaceId> = self
            .subcompositor
            .tree
            .drawable_surfaces()
            .into_iter()
            .map(|(_, surface)| surface)
            .collect();
        let mut callbacks = Vec::new();
        for id in surfaces {
            if let Some(surface) = self.surfaces.get_mut(id) {
                callbacks.append(&mut surface.take_frame_callbacks());
            }
        }
        callbacks
    }

    /// Whether the surface holds the given role kind.
    pub fn role_kind(&self, surface: SurfaceId) -> Option<RoleKind> {
        Some(self.surfaces.get(surface)?.role.as_ref()?.kind())
    }
}
