/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Surface roles. A role decides how a surface's committed state is applied
//! and where the surface sits in the scene. The capability surface is a
//! trait with no-op defaults; every role implements the subset it cares
//! about, and the closed set of kinds makes downcasts explicit.

use renderer::BufferId;
use thiserror::Error;

use crate::Scene;
use crate::subsurface::SubsurfaceRole;
use crate::surface::SurfaceId;

/// The closed set of roles a surface can take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoleKind {
    Subsurface,
    Toplevel,
    Popup,
    Icon,
    Cursor,
    DragIcon,
}

/// Typed protocol errors the core raises; the dispatch layer maps them to
/// `post_error` on the offending resource.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ProtocolError {
    #[error("acquire fence committed without a buffer")]
    NoBufferForAcquireFence,
    #[error("surface already has a role")]
    RoleAlreadyTaken,
    #[error("the sibling is not part of the same surface tree")]
    BadPlacement,
    #[error("subsurface parent is gone")]
    NoParent,
}

/// Where protocol errors are reported.
pub trait ErrorSink {
    fn post_error(&mut self, error: ProtocolError);
}

/// A sink that only logs, for roles detached from any client.
#[derive(Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn post_error(&mut self, error: ProtocolError) {
        log::warn!("protocol error with no client attached: {error}");
    }
}

/// The role capability surface. During a call the role is temporarily
/// detached from its surface, so implementations get full access to the
/// scene.
pub trait Role {
    fn kind(&self) -> RoleKind;

    /// Whether commits of this surface are deferred until the parent's
    /// next effective commit.
    fn synchronized(&self) -> bool {
        false
    }

    /// Role-specific commit handling, run after the surface's pending
    /// state was applied.
    fn commit(&mut self, _scene: &mut Scene, _surface: SurfaceId, _sink: &mut dyn ErrorSink) {}

    /// Runs before the pending state is applied, for roles that must
    /// inspect the outgoing state.
    fn early_commit(&mut self, _scene: &mut Scene, _surface: SurfaceId) {}

    fn setup(&mut self, _scene: &mut Scene, _surface: SurfaceId) {}

    fn teardown(&mut self, _scene: &mut Scene, _surface: SurfaceId) {}

    /// The role is told when a buffer it committed was released by the
    /// renderer.
    fn release_buffer(&mut self, _scene: &mut Scene, _surface: SurfaceId, _buffer: BufferId) {}

    /// A subframe begins on the role's output. Returning false refuses the
    /// subframe (the clock is frozen).
    fn subframe(&mut self, _scene: &mut Scene, _surface: SurfaceId, _time_us: u64) -> bool {
        true
    }

    fn end_subframe(&mut self, _scene: &mut Scene, _surface: SurfaceId) {}

    /// The host window backing this role's render target, when there is
    /// one.
    fn window(&self) -> Option<u32> {
        None
    }

    fn rescale(&mut self, _scene: &mut Scene, _surface: SurfaceId, _scale: i32) {}

    fn parent_rescale(&mut self, _scene: &mut Scene, _surface: SurfaceId, _scale: i32) {}

    fn note_child_synced(&mut self, _scene: &mut Scene, _child: SurfaceId) {}

    fn note_desync_child(&mut self, _scene: &mut Scene, _child: SurfaceId) {}

    /// Optional capability: activation (e.g. xdg-activation). Roles without
    /// it report failure.
    fn activate(&mut self, _scene: &mut Scene, _surface: SurfaceId, _serial: u32) -> bool {
        false
    }

    fn as_subsurface(&self) -> Option<&SubsurfaceRole> {
        None
    }

    fn as_subsurface_mut(&mut self) -> Option<&mut SubsurfaceRole> {
        None
    }
}
