/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The eight buffer orientations: identity, the three counterclockwise
//! rotations, and each of those flipped. All box math is done on edge
//! coordinates, so a transform of the full `(0..w, 0..h)` rectangle is
//! exactly the transformed extent.

use euclid::default::{Box2D, Size2D};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum BufferTransform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl BufferTransform {
    pub const ALL: [BufferTransform; 8] = [
        BufferTransform::Normal,
        BufferTransform::Rotate90,
        BufferTransform::Rotate180,
        BufferTransform::Rotate270,
        BufferTransform::Flipped,
        BufferTransform::Flipped90,
        BufferTransform::Flipped180,
        BufferTransform::Flipped270,
    ];

    /// Whether width and height trade places under this transform.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            BufferTransform::Rotate90 |
                BufferTransform::Rotate270 |
                BufferTransform::Flipped90 |
                BufferTransform::Flipped270
        )
    }

    /// The transform that undoes this one. The flipped variants are their
    /// own inverses; the rotations pair up.
    pub fn invert(self) -> BufferTransform {
        match self {
            BufferTransform::Rotate90 => BufferTransform::Rotate270,
            BufferTransform::Rotate270 => BufferTransform::Rotate90,
            other => other,
        }
    }

    pub fn transform_size(self, size: Size2D<i32>) -> Size2D<i32> {
        if self.swaps_dimensions() {
            Size2D::new(size.height, size.width)
        } else {
            size
        }
    }

    fn transform_point(self, x: i32, y: i32, extent: Size2D<i32>) -> (i32, i32) {
        let (w, h) = (extent.width, extent.height);
        match self {
            BufferTransform::Normal => (x, y),
            BufferTransform::Rotate90 => (h - y, x),
            BufferTransform::Rotate180 => (w - x, h - y),
            BufferTransform::Rotate270 => (y, w - x),
            BufferTransform::Flipped => (w - x, y),
            BufferTransform::Flipped90 => (h - y, w - x),
            BufferTransform::Flipped180 => (x, h - y),
            BufferTransform::Flipped270 => (y, x),
        }
    }

    /// Maps a box in the untransformed `extent` space into the transformed
    /// space.
    pub fn transform_box(self, b: Box2D<i32>, extent: Size2D<i32>) -> Box2D<i32> {
        let (x0, y0) = self.transform_point(b.min.x, b.min.y, extent);
        let (x1, y1) = self.transform_point(b.max.x, b.max.y, extent);
        Box2D::new(
            euclid::point2(x0.min(x1), y0.min(y1)),
            euclid::point2(x0.max(x1), y0.max(y1)),
        )
    }

    /// Maps a box in the transformed space of a buffer whose untransformed
    /// extent is `extent` back into buffer coordinates.
    pub fn apply_inverse(self, b: Box2D<i32>, extent: Size2D<i32>) -> Box2D<i32> {
        self.invert().transform_box(b, self.transform_size(extent))
    }

    /// The forward point map as a row-major affine matrix over `extent`.
    pub fn to_row_major(self, extent: Size2D<i32>) -> [[f64; 3]; 3] {
        let w = f64::from(extent.width);
        let h = f64::from(extent.height);
        let rows = match self {
            BufferTransform::Normal => [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            BufferTransform::Rotate90 => [[0.0, -1.0, h], [1.0, 0.0, 0.0]],
            BufferTransform::Rotate180 => [[-1.0, 0.0, w], [0.0, -1.0, h]],
            BufferTransform::Rotate270 => [[0.0, 1.0, 0.0], [-1.0, 0.0, w]],
            BufferTransform::Flipped => [[-1.0, 0.0, w], [0.0, 1.0, 0.0]],
            BufferTransform::Flipped90 => [[0.0, -1.0, h], [-1.0, 0.0, w]],
            BufferTransform::Flipped180 => [[1.0, 0.0, 0.0], [0.0, -1.0, h]],
            BufferTransform::Flipped270 => [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
        };
        [rows[0], rows[1], [0.0, 0.0, 1.0]]
    }
}
