/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Views: nodes of the subcompositor's z-ordered tree.
//!
//! Every surface contributes two views. The content view carries the
//! surface; the phantom "under" view sits immediately behind it in the
//! parent's child list and hosts the children stacked below the surface.
//! Depth-first traversal with parents before children therefore yields the
//! full back-to-front order, and restacking a subsurface means moving its
//! view pair within one sibling list.

use base::{FxHashMap, SerialGen};
use euclid::{Vector2D, point2};
use geometry::{WindowBox, WindowPixel, WindowPoint};

use crate::surface::SurfaceId;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ViewId(u64);

pub struct View {
    /// The surface shown by this view; `None` for phantom under views.
    pub surface: Option<SurfaceId>,
    pub parent: Option<ViewId>,
    pub first_child: Option<ViewId>,
    pub last_child: Option<ViewId>,
    pub prev_sibling: Option<ViewId>,
    pub next_sibling: Option<ViewId>,
    /// Placement in subcompositor window coordinates.
    pub position: WindowPoint,
    /// Sub-pixel remainder of the placement, applied at composite time.
    pub fractional_offset: Vector2D<f64, WindowPixel>,
    /// Excluded from rendering without being unmapped.
    pub skip: bool,
    pub mapped: bool,
    /// Cached content bounds from the last update, in window coordinates.
    pub bounds: WindowBox,
}

impl View {
    fn new(surface: Option<SurfaceId>) -> Self {
        View {
            surface,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
            position: point2(0, 0),
            fractional_offset: Vector2D::zero(),
            skip: false,
            mapped: false,
            bounds: WindowBox::zero(),
        }
    }
}

#[derive(Default)]
pub struct ViewTree {
    views: FxHashMap<ViewId, View>,
    ids: SerialGen,
    root: Option<ViewId>,
}

impl ViewTree {
    pub fn create(&mut self, surface: Option<SurfaceId>) -> ViewId {
        let id = ViewId(self.ids.next());
        self.views.insert(id, View::new(surface));
        id
    }

    pub fn set_root(&mut self, view: ViewId) {
        self.root = Some(view);
    }

    pub fn root(&self) -> Option<ViewId> {
        self.root
    }

    pub fn get(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }

    pub fn get_mut(&mut self, id: ViewId) -> Option<&mut View> {
        self.views.get_mut(&id)
    }

    /// Appends `child` as the top-most child of `parent`.
    pub fn insert_last(&mut self, parent: ViewId, child: ViewId) {
        debug_assert!(self.views[&child].parent.is_none());
        let previous_last = {
            let parent_view = self.views.get_mut(&parent).expect("parent view");
            std::mem::replace(&mut parent_view.last_child, Some(child))
        };
        match previous_last {
            Some(last) => {
                self.views.get_mut(&last).expect("sibling").next_sibling = Some(child);
            },
            None => {
                self.views.get_mut(&parent).expect("parent view").first_child = Some(child);
            },
        }
        let child_view = self.views.get_mut(&child).expect("child view");
        child_view.parent = Some(parent);
        child_view.prev_sibling = previous_last;
        child_view.next_sibling = None;
    }

    /// Prepends `child` as the bottom-most child of `parent`.
    pub fn insert_first(&mut self, parent: ViewId, child: ViewId) {
        debug_assert!(self.views[&child].parent.is_none());
        let previous_first = {
            let parent_view = self.views.get_mut(&parent).expect("parent view");
            std::mem::replace(&mut parent_view.first_child, Some(child))
        };
        match previous_first {
            Some(first) => {
                self.views.get_mut(&first).expect("sibling").prev_sibling = Some(child);
            },
            None => {
                self.views.get_mut(&parent).expect("parent view").last_child = Some(child);
            },
        }
        let child_view = self.views.get_mut(&child).expect("child view");
        child_view.parent = Some(parent);
        child_view.prev_sibling = None;
        child_view.next_sibling = previous_first;
    }

    /// Inserts `child` directly before `sibling` in the same child list.
    pub fn insert_before(&mut self, sibling: ViewId, child: ViewId) {
        let previous = self.views[&sibling].prev_sibling;
        match previous {
            Some(previous) => self.insert_after(previous, child),
            None => {
                let parent = self.views[&sibling].parent.expect("sibling has a parent");
                self.insert_first(parent, child);
            },
        }
    }

    /// Inserts `child` directly after `sibling` in the same child list.
    pub fn insert_after(&mut self, sibling: ViewId, child: ViewId) {
        debug_assert!(self.views[&child].parent.is_none());
        let (parent, next) = {
            let sibling_view = &self.views[&sibling];
            (sibling_view.parent, sibling_view.next_sibling)
        };
        self.views.get_mut(&sibling).expect("sibling").next_sibling = Some(child);
        match next {
            Some(next) => {
                self.views.get_mut(&next).expect("next sibling").prev_sibling = Some(child);
            },
            None => {
                if let Some(parent) = parent {
                    self.views.get_mut(&parent).expect("parent view").last_child = Some(child);
                }
            },
        }
        let child_view = self.views.get_mut(&child).expect("child view");
        child_view.parent = parent;
        child_view.prev_sibling = Some(sibling);
        child_view.next_sibling = next;
    }

    /// Detaches a view from its parent's child list. Children stay with
    /// the view.
    pub fn unparent(&mut self, id: ViewId) {
        let Some(view) = self.views.get(&id) else {
            return;
        };
        let (parent, prev, next) = (view.parent, view.prev_sibling, view.next_sibling);
        match prev {
            Some(prev) => self.views.get_mut(&prev).expect("sibling").next_sibling = next,
            None => {
                if let Some(parent) = parent {
                    self.views.get_mut(&parent).expect("parent view").first_child = next;
                }
            },
        }
        match next {
            Some(next) => self.views.get_mut(&next).expect("sibling").prev_sibling = prev,
            None => {
                if let Some(parent) = parent {
                    self.views.get_mut(&parent).expect("parent view").last_child = prev;
                }
            },
        }
        let view = self.views.get_mut(&id).expect("view");
        view.parent = None;
        view.prev_sibling = None;
        view.next_sibling = None;
    }

    pub fn remove(&mut self, id: ViewId) {
        self.unparent(id);
        // Orphan any children; the caller tears surfaces down root-first.
        let mut cursor = self.views.get(&id).and_then(|view| view.first_child);
        while let Some(child) = cursor {
            cursor = self.views.get(&child).and_then(|view| view.next_sibling);
            self.unparent(child);
        }
        self.views.remove(&id);
        if self.root == Some(id) {
            self.root = None;
        }
    }

    /// The depth-first flattening of the tree: every view, back to front.
    pub fn z_order(&self) -> Vec<ViewId> {
        let mut order = Vec::with_capacity(self.views.len());
        if let Some(root) = self.root {
            self.flatten(root, &mut order);
        }
        order
    }

    fn flatten(&self, id: ViewId, order: &mut Vec<ViewId>) {
        order.push(id);
        let mut cursor = self.views.get(&id).and_then(|view| view.first_child);
        while let Some(child) = cursor {
            self.flatten(child, order);
            cursor = self.views.get(&child).and_then(|view| view.next_sibling);
        }
    }

    /// The surfaces of drawable views in z-order: mapped, not skipped,
    /// content views only.
    pub fn drawable_surfaces(&self) -> Vec<(ViewId, SurfaceId)> {
        self.z_order()
            .into_iter()
            .filter_map(|id| {
                let view = self.views.get(&id)?;
                if view.skip || !view.mapped {
                    return None;
                }
                view.surface.map(|surface| (id, surface))
            })
            .collect()
    }

    /// The absolute position of a view: the sum of its own placement and
    /// every ancestor's.
    pub fn absolute_position(&self, id: ViewId) -> WindowPoint {
        let mut position = point2(0, 0);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(view) = self.views.get(&current) else {
                break;
            };
            position += view.position.to_vector();
            cursor = view.parent;
        }
        position
    }
}
