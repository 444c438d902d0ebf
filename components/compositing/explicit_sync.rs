/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Explicit synchronization state, one object per surface: at most one
//! unread acquire fence and at most one unsent release object at any time.
//! On commit both migrate into the surface's pending state; the acquire
//! fence is imported into a host fence and awaited before the buffer is
//! read, and the release object fires once the renderer's finish fence for
//! the frame is known.

use std::os::fd::OwnedFd;

use log::debug;

use crate::role::{ErrorSink, ProtocolError};
use crate::surface::Surface;

/// The client-visible release object. Emitting it consumes the object:
/// `Some(fd)` is a fenced release, `None` an immediate one.
pub struct ReleasePoint {
    callback: Box<dyn FnOnce(Option<OwnedFd>)>,
}

impl ReleasePoint {
    pub fn new(callback: Box<dyn FnOnce(Option<OwnedFd>)>) -> Self {
        Self { callback }
    }

    pub fn release(self, fence: Option<OwnedFd>) {
        (self.callback)(fence);
    }
}

/// Per-surface synchronization object.
#[derive(Default)]
pub struct SurfaceSync {
    acquire_fence: Option<OwnedFd>,
    release: Option<ReleasePoint>,
}

impl SurfaceSync {
    /// Stages an acquire fence for the next commit. A second fence before
    /// the commit is a protocol error at the dispatch layer; here the old
    /// descriptor is simply dropped.
    pub fn set_acquire_fence(&mut self, fence: OwnedFd) {
        self.acquire_fence = Some(fence);
    }

    pub fn set_release(&mut self, release: ReleasePoint) {
        self.release = Some(release);
    }

    pub fn has_acquire_fence(&self) -> bool {
        self.acquire_fence.is_some()
    }

    /// Moves the staged fence and release object into the surface at commit
    /// time. An acquire fence without a buffer attach in the same commit is
    /// a protocol error; the descriptor is closed and nothing migrates.
    pub fn commit(&mut self, surface: &mut Surface, sink: &mut dyn ErrorSink) {
        if let Some(fence) = self.acquire_fence.take() {
            if surface.pending.buffer.is_none() {
                debug!("acquire fence staged without a buffer attach");
                sink.post_error(ProtocolError::NoBufferForAcquireFence);
                drop(fence);
            } else {
                surface.set_acquire_fence(fence);
            }
        }
        if let Some(release) = self.release.take() {
            surface.set_release(release);
        }
    }
}
