/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The subsurface role: a surface positioned relative to a parent, with
//! synchronized or desynchronized commit semantics and restack requests
//! that only take effect at the parent's next commit.

use crate::Scene;
use crate::role::{ErrorSink, Role, RoleKind};
use crate::surface::SurfaceId;

/// A queued place-above/place-below request, recorded against the parent
/// and replayed in reverse insertion order at the parent's commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Placement {
    pub kind: PlacementKind,
    pub surface: SurfaceId,
    /// The sibling to stack against; the parent itself is allowed.
    pub sibling: SurfaceId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlacementKind {
    Above,
    Below,
}

pub struct SubsurfaceRole {
    pub parent: SurfaceId,
    /// Synchronized children defer their commits to the parent's.
    pub synchronized: bool,
    /// Position in parent surface coordinates. Fractional: the integer
    /// part places the view, the remainder rides into the renderer as a
    /// sub-pixel offset.
    pub position: (f64, f64),
    pub pending_position: Option<(f64, f64)>,
    /// A deferred commit is waiting for the parent.
    pub needs_apply: bool,
}

impl SubsurfaceRole {
    pub fn new(parent: SurfaceId) -> Self {
        SubsurfaceRole {
            parent,
            synchronized: true,
            position: (0.0, 0.0),
            pending_position: None,
            needs_apply: false,
        }
    }
}

impl Role for SubsurfaceRole {
    fn kind(&self) -> RoleKind {
        RoleKind::Subsurface
    }

    fn synchronized(&self) -> bool {
        self.synchronized
    }

    fn commit(&mut self, scene: &mut Scene, surface: SurfaceId, _sink: &mut dyn ErrorSink) {
        apply_map_state(scene, surface);
    }

    fn as_subsurface(&self) -> Option<&SubsurfaceRole> {
        Some(self)
    }

    fn as_subsurface_mut(&mut self) -> Option<&mut SubsurfaceRole> {
        Some(self)
    }
}

/// Syncs the view's mapped flag with the committed buffer and damages the
/// view on both transitions.
pub fn apply_map_state(scene: &mut Scene, surface_id: SurfaceId) {
    let Some(surface) = scene.surfaces.get(surface_id) else {
        return;
    };
    let mapped = surface.mapped();
    let Some(view) = surface.view else {
        return;
    };
    let was_mapped = scene
        .subcompositor
        .tree
        .get(view)
        .map(|view| view.mapped)
        .unwrap_or(false);
    if mapped != was_mapped {
        if let Some(state) = scene.subcompositor.tree.get_mut(view) {
            state.mapped = mapped;
        }
        scene.subcompositor.damage_view(view, &scene.surfaces);
    }
}
