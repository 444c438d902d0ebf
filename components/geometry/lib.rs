/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Coordinate spaces, the disjoint-rectangle region algebra, buffer
//! transforms, and the draw-parameter to picture-matrix mapping used by the
//! renderer.
//!
//! Four pixel spaces appear in the update pipeline:
//! - [`BufferPixel`]: the client buffer, before scale/transform/viewport.
//! - [`SurfacePixel`]: surface-local coordinates, what clients damage in.
//! - [`WindowPixel`]: the subcompositor window, where views are placed.
//! - [`DevicePixel`]: host device pixels.

pub mod region;
pub mod transform;

use euclid::{Box2D, Point2D, Size2D, Vector2D};

pub use crate::region::Region;
pub use crate::transform::BufferTransform;

/// Pixels in a client-supplied buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BufferPixel {}

/// Surface-local coordinates.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SurfacePixel {}

/// Coordinates of the subcompositor's window.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WindowPixel {}

/// Host device pixels.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DevicePixel {}

pub type BufferBox = Box2D<i32, BufferPixel>;
pub type BufferSize = Size2D<i32, BufferPixel>;
pub type SurfaceBox = Box2D<i32, SurfacePixel>;
pub type WindowBox = Box2D<i32, WindowPixel>;
pub type WindowPoint = Point2D<i32, WindowPixel>;
pub type WindowSize = Size2D<i32, WindowPixel>;

/// A viewport-style stretch: a fractional source crop in buffer coordinates
/// scaled to an integral destination size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stretch {
    pub src_x: f64,
    pub src_y: f64,
    pub src_width: f64,
    pub src_height: f64,
    pub dst_width: i32,
    pub dst_height: i32,
}

/// Everything that feeds the cached picture transform of a render buffer.
/// Two equal values must produce the same matrix, so the renderer can skip
/// re-uploading the transform when nothing changed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawParams {
    /// Integer surface-to-buffer scale factor.
    pub scale: i32,
    /// Fractional sub-pixel offset, applied at composite time only.
    pub offset: Vector2D<f64, WindowPixel>,
    /// Viewport crop and stretch, when the surface has one.
    pub stretch: Option<Stretch>,
    /// The orientation the client drew the buffer in.
    pub transform: BufferTransform,
}

impl Default for DrawParams {
    fn default() -> Self {
        Self {
            scale: 1,
            offset: Vector2D::zero(),
            stretch: None,
            transform: BufferTransform::Normal,
        }
    }
}

impl DrawParams {
    /// Builds the 3×3 matrix mapping destination points back into buffer
    /// coordinates, as the host render extension expects: the inverse
    /// buffer transform composed with scale, translation and stretch.
    pub fn to_matrix(&self, buffer_size: BufferSize) -> [[f64; 3]; 3] {
        // Destination → stretched source crop.
        let (mut sx, mut sy) = (1.0, 1.0);
        let (mut tx, mut ty) = (0.0, 0.0);
        if let Some(stretch) = self.stretch {
            sx = stretch.src_width / f64::from(stretch.dst_width.max(1));
            sy = stretch.src_height / f64::from(stretch.dst_height.max(1));
            tx = stretch.src_x;
            ty = stretch.src_y;
        }
        // Surface → buffer scale, then the sub-pixel offset.
        let scale = f64::from(self.scale.max(1));
        sx *= scale;
        sy *= scale;
        tx = (tx - self.offset.x) * scale;
        ty = (ty - self.offset.y) * scale;

        // The affine so far, in untransformed buffer coordinates.
        let untransformed = [[sx, 0.0, tx], [0.0, sy, ty], [0.0, 0.0, 1.0]];

        // Fold in the inverse of the buffer transform, which takes points in
        // the transformed extent back onto raw buffer coordinates.
        let transformed = self.transform.transform_size(buffer_size.to_untyped());
        let inverse = self.transform.invert().to_row_major(transformed);
        multiply(inverse, untransformed)
    }

    /// The matrix in the 16.16 fixed-point encoding of the wire protocol.
    pub fn to_fixed_matrix(&self, buffer_size: BufferSize) -> [[i32; 3]; 3] {
        self.to_matrix(buffer_size).map(|row| row.map(to_fixed))
    }
}

/// 16.16 fixed point, rounded to nearest.
pub fn to_fixed(value: f64) -> i32 {
    (value * 65536.0).round() as i32
}

fn multiply(a: [[f64; 3]; 3], b: [[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}
