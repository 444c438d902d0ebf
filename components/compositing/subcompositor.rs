/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The subcompositor: one view tree bound to one render target, and the
//! damage-driven update that turns the tree into draw calls.
//!
//! Updates walk the tree front to back subtracting opaque coverage, so a
//! back view never paints pixels a front view will overdraw, then emit the
//! surviving regions back to front. Damage accumulates between updates in
//! window coordinates; surface commits feed it through the scale, viewport
//! and transform mapping.

use euclid::{Box2D, point2};
use geometry::region::Region;
use geometry::{
    DrawParams, Stretch, SurfaceBox, SurfacePixel, WindowBox, WindowPixel, WindowSize,
};
use log::trace;
use renderer::{
    BufferOps, CompositeOp, PresentedCallback, RenderError, RenderOps, TargetId,
};

use crate::surface::{SurfaceId, SurfaceState, Surfaces};
use crate::sync_helper::SyncMode;
use crate::view::{ViewId, ViewTree};

/// The events a role learns about its frames through the note-frame
/// callback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrameEvent {
    /// A draw has been issued for this update.
    Started,
    /// The synchronization mode chosen for the frame.
    ModeSet(SyncMode),
    /// The frame finished on our side.
    Completed,
    /// The host showed the frame at the given msc/ust.
    Presented { msc: u64, ust: u64 },
}

pub type BoundsCallback = Box<dyn FnMut(WindowBox)>;
pub type NoteFrameCallback = Box<dyn FnMut(FrameEvent)>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpdateResult {
    pub drew: bool,
    pub bounds: WindowBox,
}

pub struct Subcompositor {
    pub tree: ViewTree,
    /// Damage accumulated since the last update, in window coordinates.
    damage: Region<WindowPixel>,
    /// Surface-to-window scale factor of this subcompositor's output.
    scale: i32,
    target: Option<TargetId>,
    bounds_callback: Option<BoundsCallback>,
    note_frame_callback: Option<NoteFrameCallback>,
    last_bounds: WindowBox,
}

impl Default for Subcompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Subcompositor {
    pub fn new() -> Self {
        Subcompositor {
            tree: ViewTree::default(),
            damage: Region::new(),
            scale: 1,
            target: None,
            bounds_callback: None,
            note_frame_callback: None,
            last_bounds: WindowBox::zero(),
        }
    }

    pub fn set_target(&mut self, target: Option<TargetId>) {
        self.target = target;
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    pub fn set_scale(&mut self, scale: i32) {
        if self.scale != scale.max(1) {
            self.scale = scale.max(1);
            // Every pixel moved; treat the whole last bounds as damaged.
            self.damage.union_rect(self.last_bounds);
        }
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }

    pub fn set_bounds_callback(&mut self, callback: BoundsCallback) {
        self.bounds_callback = Some(callback);
    }

    pub fn set_note_frame_callback(&mut self, callback: NoteFrameCallback) {
        self.note_frame_callback = Some(callback);
    }

    pub fn note_frame(&mut self, event: FrameEvent) {
        if let Some(callback) = self.note_frame_callback.as_mut() {
            callback(event);
        }
    }

    /// Host expose: repaint the given window region on the next update.
    pub fn expose(&mut self, region: &Region<WindowPixel>) {
        self.damage.union(region);
    }

    pub fn pending_damage(&self) -> &Region<WindowPixel> {
        &self.damage
    }

    /// Maps a surface commit's damage through the view placement into
    /// window coordinates and accumulates it.
    pub fn note_surface_damage(
        &mut self,
        view: ViewId,
        damage: &Region<SurfacePixel>,
        surfaces: &Surfaces,
    ) {
        let Some(surface_id) = self.tree.get(view).and_then(|view| view.surface) else {
            return;
        };
        let Some(state) = surfaces.get(surface_id).map(|surface| &surface.current) else {
            return;
        };
        let position = self.tree.absolute_position(view);
        let scale = self.scale;
        let clip = surface_extent(state).map(|size| {
            WindowBox::new(
                position,
                position + euclid::vec2(size.width * scale, size.height * scale),
            )
        });
        let mapped = damage.map(|rect| {
            let window = map_surface_rect(rect, scale, position);
            match clip {
                Some(clip) => window.intersection_unchecked(&clip),
                None => window,
            }
        });
        self.damage.union(&mapped);
    }

    /// Damage the full extent of one view, e.g. after a map or unmap.
    pub fn damage_view(&mut self, view: ViewId, surfaces: &Surfaces) {
        let Some(view_state) = self.tree.get(view) else {
            return;
        };
        if let Some(surface) = view_state.surface {
            if let Some(size) = surfaces
                .get(surface)
                .and_then(|surface| surface_extent(&surface.current))
            {
                let position = self.tree.absolute_position(view);
                let rect = WindowBox::new(
                    position,
                    position +
                        euclid::vec2(size.width * self.scale, size.height * self.scale),
                );
                self.damage.union_rect(rect);
                return;
            }
        }
        // No current content; fall back to the cached bounds.
        let bounds = view_state.bounds;
        self.damage.union_rect(bounds);
    }

    /// How many subsurface descendants currently run desynchronized, for
    /// the refresh-prediction decision.
    pub fn desynchronized_children(&self, surfaces: &Surfaces) -> usize {
        self.tree
            .drawable_surfaces()
            .into_iter()
            .filter(|&(_, surface)| {
                surfaces
                    .get(surface)
                    .and_then(|surface| surface.role.as_ref())
                    .and_then(|role| role.as_subsurface())
                    .is_some_and(|subsurface| !subsurface.synchronized)
            })
            .count()
    }

    /// One full update: walks the views in z-order, clips by damage and
    /// opaque coverage, issues the draw calls and finishes the render.
    pub fn update<R: RenderOps + BufferOps + ?Sized>(
        &mut self,
        surfaces: &Surfaces,
        renderer: &mut R,
        present_callback: Option<PresentedCallback>,
    ) -> Result<UpdateResult, RenderError> {
        let Some(target) = self.target else {
            return Ok(UpdateResult::default());
        };

        struct Drawable {
            view: ViewId,
            surface: SurfaceId,
            rect: WindowBox,
            draw: Region<WindowPixel>,
            opaque: Region<WindowPixel>,
        }

        let mut drawables: Vec<Drawable> = Vec::new();
        for (view, surface_id) in self.tree.drawable_surfaces() {
            let Some(surface) = surfaces.get(surface_id) else {
                continue;
            };
            if surface.current.buffer.is_none() {
                continue;
            }
            let Some(size) = surface_extent(&surface.current) else {
                continue;
            };
            let position = self.tree.absolute_position(view);
            let rect = WindowBox::new(
                position,
                position + euclid::vec2(size.width * self.scale, size.height * self.scale),
            );
            if let Some(state) = self.tree.get_mut(view) {
                state.bounds = rect;
            }
            let opaque = surface
                .current
                .opaque
                .map(|r| map_surface_rect(r, self.scale, position))
                .intersection(&Region::from_rect(rect));
            drawables.push(Drawable {
                view,
                surface: surface_id,
                rect,
                draw: Region::new(),
                opaque,
            });
        }

        let damage = std::mem::take(&mut self.damage);
        let bounds = drawables
            .iter()
            .fold(None::<WindowBox>, |acc, drawable| {
                Some(match acc {
                    Some(bounds) => bounds.union(&drawable.rect),
                    None => drawable.rect,
                })
            })
            .unwrap_or_else(WindowBox::zero);

        let mut drew = false;
        if !damage.is_empty() {
            // Front to back: damage within each view, minus everything an
            // opaque front view already claims.
            let mut opaque_front: Region<WindowPixel> = Region::new();
            for drawable in drawables.iter_mut().rev() {
                let mut draw = damage.intersection(&Region::from_rect(drawable.rect));
                draw.subtract(&opaque_front);
                drawable.draw = draw;
                opaque_front.union(&drawable.opaque);
            }

            // Anything not covered by any view clears to transparency.
            let mut uncovered = damage.clone();
            for drawable in &drawables {
                uncovered.subtract_rect(drawable.rect);
            }
            if !uncovered.is_empty() {
                renderer.fill_boxes_with_transparency(target, uncovered.rects())?;
                drew = true;
            }

            // Back to front: the draw calls.
            for drawable in &drawables {
                if drawable.draw.is_empty() {
                    continue;
                }
                let Some(surface) = surfaces.get(drawable.surface) else {
                    continue;
                };
                let Some(buffer) = surface.current.buffer else {
                    continue;
                };
                let fractional = self
                    .tree
                    .get(drawable.view)
                    .map(|view| view.fractional_offset)
                    .unwrap_or_default();
                let params = draw_params(&surface.current, fractional);
                let op = if renderer.is_buffer_opaque(buffer) {
                    CompositeOp::Source
                } else {
                    CompositeOp::Over
                };
                for rect in drawable.draw.rects() {
                    let src_x = (rect.min.x - drawable.rect.min.x) as i16;
                    let src_y = (rect.min.y - drawable.rect.min.y) as i16;
                    renderer.composite(
                        buffer,
                        target,
                        op,
                        src_x,
                        src_y,
                        rect.min.x as i16,
                        rect.min.y as i16,
                        rect.width().max(0) as u16,
                        rect.height().max(0) as u16,
                        &params,
                    )?;
                }
                drew = true;
            }

            renderer.finish_render(target, &damage, present_callback)?;
            if drew {
                self.note_frame(FrameEvent::Started);
            }
        } else if let Some(callback) = present_callback {
            // Nothing to draw; complete the caller immediately.
            callback(renderer::PresentedInfo::default());
        }

        if bounds != self.last_bounds {
            self.last_bounds = bounds;
            if let Some(callback) = self.bounds_callback.as_mut() {
                callback(bounds);
            }
        }
        trace!("update on {target:?}: drew={drew} bounds={bounds:?}");
        Ok(UpdateResult { drew, bounds })
    }
}

/// The size of a surface's content in surface coordinates: the viewport
/// destination, else the viewport source extent, else the transformed
/// buffer size divided by the buffer scale.
pub fn surface_extent(state: &SurfaceState) -> Option<WindowSize> {
    if let Some((width, height)) = state.viewport_dst {
        return Some(WindowSize::new(width, height));
    }
    if let Some(src) = state.viewport_src {
        return Some(WindowSize::new(
            src.width.ceil() as i32,
            src.height.ceil() as i32,
        ));
    }
    let size = state.buffer_size?;
    let transformed = state.buffer_transform.transform_size(size.to_untyped());
    let scale = state.buffer_scale.max(1);
    Some(WindowSize::new(
        (transformed.width + scale - 1) / scale,
        (transformed.height + scale - 1) / scale,
    ))
}

fn map_surface_rect(
    rect: SurfaceBox,
    scale: i32,
    position: euclid::Point2D<i32, WindowPixel>,
) -> WindowBox {
    Box2D::new(
        point2(rect.min.x * scale, rect.min.y * scale) + position.to_vector(),
        point2(rect.max.x * scale, rect.max.y * scale) + position.to_vector(),
    )
}

/// Draw parameters for one surface: its scale and transform, the viewport
/// stretch when set, and the view's sub-pixel offset.
fn draw_params(
    state: &SurfaceState,
    fractional: euclid::Vector2D<f64, WindowPixel>,
) -> DrawParams {
    let stretch = match (state.viewport_src, state.viewport_dst) {
        (None, None) => None,
        (src, dst) => {
            let (src_x, src_y, src_w, src_h) = match src {
                Some(src) => (src.x, src.y, src.width, src.height),
                None => {
                    let size = state
                        .buffer_size
                        .map(|size| {
                            state
                                .buffer_transform
                                .transform_size(size.to_untyped())
                        })
                        .unwrap_or_default();
                    let scale = f64::from(state.buffer_scale.max(1));
                    (
                        0.0,
                        0.0,
                        f64::from(size.width) / scale,
                        f64::from(size.height) / scale,
                    )
                },
            };
            let (dst_w, dst_h) = match dst {
                Some(dst) => dst,
                None => (src_w.ceil() as i32, src_h.ceil() as i32),
            };
            Some(Stretch {
                src_x,
                src_y,
                src_width: src_w,
                src_height: src_h,
                dst_width: dst_w,
                dst_height: dst_h,
            })
        },
    };
    DrawParams {
        scale: state.buffer_scale.max(1),
        offset: fractional,
        stretch,
        transform: state.buffer_transform,
    }
}

#[cfg(test)]
mod tests {
    use geometry::{BufferSize, BufferTransform};

    use super::*;
    use crate::surface::ViewportSource;

    fn state_with_buffer(width: i32, height: i32) -> SurfaceState {
        let mut state = SurfaceState::default();
        state.buffer_size = Some(BufferSize::new(width, height));
        state.buffer_scale = 1;
        state
    }

    #[test]
    fn extent_divides_by_scale_rounding_up() {
        let mut state = state_with_buffer(65, 64);
        state.buffer_scale = 2;
        assert_eq!(surface_extent(&state), Some(WindowSize::new(33, 32)));
    }

    #[test]
    fn extent_swaps_for_rotated_buffers() {
        let mut state = state_with_buffer(64, 32);
        state.buffer_transform = BufferTransform::Rotate90;
        assert_eq!(surface_extent(&state), Some(WindowSize::new(32, 64)));
    }

    #[test]
    fn viewport_destination_wins() {
        let mut state = state_with_buffer(64, 64);
        state.viewport_src = Some(ViewportSource {
            x: 1.0,
            y: 1.0,
            width: 10.0,
            height: 10.0,
        });
        state.viewport_dst = Some((200, 100));
        assert_eq!(surface_extent(&state), Some(WindowSize::new(200, 100)));
    }

    #[test]
    fn draw_params_carry_viewport_stretch() {
        let mut state = state_with_buffer(64, 64);
        state.viewport_src = Some(ViewportSource {
            x: 8.0,
            y: 8.0,
            width: 16.0,
            height: 16.0,
        });
        state.viewport_dst = Some((32, 48));
        let params = draw_params(&state, euclid::Vector2D::zero());
        let stretch = params.stretch.expect("stretch");
        assert_eq!((stretch.src_x, stretch.src_y), (8.0, 8.0));
        assert_eq!((stretch.dst_width, stretch.dst_height), (32, 48));
    }

    #[test]
    fn destination_only_viewport_scales_the_whole_buffer() {
        let mut state = state_with_buffer(64, 64);
        state.viewport_dst = Some((128, 128));
        let params = draw_params(&state, euclid::Vector2D::zero());
        let stretch = params.stretch.expect("stretch");
        assert_eq!((stretch.src_width, stretch.src_height), (64.0, 64.0));
        assert_eq!((stretch.dst_width, stretch.dst_height), (128, 128));
    }
}
