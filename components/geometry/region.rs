/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Pixel regions as sets of disjoint rectangles. Damage and opaque tracking
//! only ever hold a handful of rectangles, so the representation favors
//! simple invariants over banding: every mutation re-establishes
//! disjointness by rectangle splitting.

use euclid::{Box2D, Point2D, Vector2D};

/// A set of pixels, kept as disjoint, non-empty rectangles.
#[derive(Clone, Debug, PartialEq)]
pub struct Region<U> {
    rects: Vec<Box2D<i32, U>>,
}

// Not derived: that would demand `U: Default` of the phantom unit.
impl<U> Default for Region<U> {
    fn default() -> Self {
        Region { rects: Vec::new() }
    }
}

impl<U> Region<U> {
    pub fn new() -> Self {
        Region { rects: Vec::new() }
    }

    pub fn from_rect(rect: Box2D<i32, U>) -> Self {
        let mut region = Region::new();
        region.union_rect(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Box2D<i32, U>] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// The smallest rectangle covering the region.
    pub fn extents(&self) -> Box2D<i32, U> {
        let mut iter = self.rects.iter();
        let Some(first) = iter.next() else {
            return Box2D::zero();
        };
        iter.fold(*first, |acc, rect| acc.union(rect))
    }

    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| i64::from(r.width()) * i64::from(r.height()))
            .sum()
    }

    pub fn contains(&self, point: Point2D<i32, U>) -> bool {
        self.rects.iter().any(|r| r.contains(point))
    }

    /// Whether `rect` is entirely inside the region.
    pub fn contains_rect(&self, rect: Box2D<i32, U>) -> bool {
        if rect.is_empty() {
            return true;
        }
        let mut remainder = vec![rect];
        for r in &self.rects {
            remainder = split_outside(&remainder, *r);
            if remainder.is_empty() {
                return true;
            }
        }
        false
    }

    pub fn union_rect(&mut self, rect: Box2D<i32, U>) {
        if rect.is_empty() {
            return;
        }
        // Insert only the parts not already covered, keeping disjointness.
        let mut pieces = vec![rect];
        for r in &self.rects {
            pieces = split_outside(&pieces, *r);
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    pub fn union(&mut self, other: &Region<U>) {
        for rect in &other.rects {
            self.union_rect(*rect);
        }
    }

    pub fn subtract_rect(&mut self, rect: Box2D<i32, U>) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for r in &self.rects {
            out.extend(split_one_outside(*r, rect));
        }
        self.rects = out;
    }

    pub fn subtract(&mut self, other: &Region<U>) {
        for rect in &other.rects {
            self.subtract_rect(*rect);
        }
    }

    pub fn intersect_rect(&mut self, rect: Box2D<i32, U>) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|r| {
                let i = r.intersection_unchecked(&rect);
                (!i.is_empty()).then_some(i)
            })
            .collect();
    }

    pub fn intersection(&self, other: &Region<U>) -> Region<U> {
        let mut out = Region::new();
        for a in &self.rects {
            for b in &other.rects {
                let i = a.intersection_unchecked(b);
                if !i.is_empty() {
                    out.union_rect(i);
                }
            }
        }
        out
    }

    pub fn translate(&mut self, offset: Vector2D<i32, U>) {
        for rect in &mut self.rects {
            *rect = rect.translate(offset);
        }
    }

    /// Maps every rectangle into another space, re-unioning in case the
    /// mapping is not injective on rectangles.
    pub fn map<V>(&self, mut f: impl FnMut(Box2D<i32, U>) -> Box2D<i32, V>) -> Region<V> {
        let mut out = Region::new();
        for rect in &self.rects {
            out.union_rect(f(*rect));
        }
        out
    }
}

/// The parts of `rect` outside `hole`, as up to four disjoint rectangles.
fn split_one_outside<U>(rect: Box2D<i32, U>, hole: Box2D<i32, U>) -> Vec<Box2D<i32, U>> {
    let overlap = rect.intersection_unchecked(&hole);
    if overlap.is_empty() {
        return vec![rect];
    }
    let mut out = Vec::with_capacity(4);
    // Top band.
    if rect.min.y < overlap.min.y {
        out.push(Box2D::new(rect.min, euclid::point2(rect.max.x, overlap.min.y)));
    }
    // Bottom band.
    if overlap.max.y < rect.max.y {
        out.push(Box2D::new(euclid::point2(rect.min.x, overlap.max.y), rect.max));
    }
    // Left and right slivers of the middle band.
    if rect.min.x < overlap.min.x {
        out.push(Box2D::new(
            euclid::point2(rect.min.x, overlap.min.y),
            euclid::point2(overlap.min.x, overlap.max.y),
        ));
    }
    if overlap.max.x < rect.max.x {
        out.push(Box2D::new(
            euclid::point2(overlap.max.x, overlap.min.y),
            euclid::point2(rect.max.x, overlap.max.y),
        ));
    }
    out
}

fn split_outside<U>(rects: &[Box2D<i32, U>], hole: Box2D<i32, U>) -> Vec<Box2D<i32, U>> {
    rects
        .iter()
        .flat_map(|r| split_one_outside(*r, hole))
        .collect()
}

#[cfg(test)]
mod tests {
    use euclid::default::Box2D;
    use euclid::point2;

    use super::*;

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> Box2D<i32> {
        Box2D::new(point2(x0, y0), point2(x1, y1))
    }

    #[test]
    fn union_of_overlapping_rects_counts_pixels_once() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.union_rect(rect(5, 5, 15, 15));
        assert_eq!(region.area(), 100 + 100 - 25);
        assert_eq!(region.extents(), rect(0, 0, 15, 15));
    }

    #[test]
    fn union_of_covered_rect_is_noop() {
        let mut region = Region::from_rect(rect(0, 0, 20, 20));
        let before = region.clone();
        region.union_rect(rect(5, 5, 10, 10));
        assert_eq!(region, before);
    }

    #[test]
    fn subtract_punches_a_hole() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.subtract_rect(rect(2, 2, 8, 8));
        assert_eq!(region.area(), 100 - 36);
        assert!(!region.contains(point2(5, 5)));
        assert!(region.contains(point2(1, 5)));
        assert!(region.contains(point2(9, 9)));
    }

    #[test]
    fn subtract_disjoint_is_noop() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.subtract_rect(rect(20, 20, 30, 30));
        assert_eq!(region.area(), 100);
    }

    #[test]
    fn intersection_is_commutative_on_area() {
        let mut a = Region::from_rect(rect(0, 0, 10, 10));
        a.union_rect(rect(20, 0, 30, 10));
        let b = Region::from_rect(rect(5, 5, 25, 15));
        let ab = a.intersection(&b);
        let ba = b.intersection(&a);
        assert_eq!(ab.area(), ba.area());
        assert_eq!(ab.area(), 25 + 25);
    }

    #[test]
    fn contains_rect_spanning_two_rects() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.union_rect(rect(10, 0, 20, 10));
        assert!(region.contains_rect(rect(5, 2, 15, 8)));
        assert!(!region.contains_rect(rect(5, 2, 21, 8)));
    }

    #[test]
    fn translate_moves_every_rect() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.union_rect(rect(20, 20, 30, 30));
        region.translate(euclid::vec2(5, -5));
        assert!(region.contains(point2(5, -5)));
        assert!(region.contains(point2(25, 15)));
        assert_eq!(region.area(), 200);
    }

    #[test]
    fn disjointness_is_maintained() {
        let mut region = Region::new();
        for i in 0..8 {
            region.union_rect(rect(i * 3, 0, i * 3 + 6, 10));
        }
        let rects = region.rects().to_vec();
        for (i, a) in rects.iter().enumerate() {
            for b in rects.iter().skip(i + 1) {
                assert!(a.intersection_unchecked(b).is_empty(), "{a:?} overlaps {b:?}");
            }
        }
        assert_eq!(region.area(), ((7 * 3) + 6) * 10);
    }
}
