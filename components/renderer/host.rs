/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Host-connection plumbing shared by both renderer backends: the marker
//! window for round-trip acknowledgement, the private marker atoms, and the
//! picture-format cache built at startup.

use std::fmt::Display;
use std::rc::Rc;

use base::RoundTripId;
use log::debug;
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::present::ConnectionExt as _;
use x11rb::protocol::render::{self, ConnectionExt as _, PictType};
use x11rb::protocol::shm::ConnectionExt as _;
use x11rb::protocol::sync::ConnectionExt as _;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{
    Atom, ClientMessageEvent, ConnectionExt as _, CreateWindowAux, EventMask, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;

use crate::{PictureFormat, RenderError};

/// `PresentOptionAsync`: flip as soon as possible instead of at the next
/// field boundary.
pub(crate) const PRESENT_OPTION_ASYNC: u32 = 1 << 0;

pub(crate) fn host_error(error: impl Display) -> RenderError {
    RenderError::Host(error.to_string())
}

pub(crate) fn connection_error(error: impl Display) -> RenderError {
    RenderError::Connection(error.to_string())
}

/// The two private atoms used as round-trip markers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkerKind {
    /// Buffer activity accounting for one update.
    BufferRelease,
    /// Completion of an asynchronous dma-buf pixmap creation.
    DmaBufCreated,
}

pub struct HostContext {
    pub connection: Rc<RustConnection>,
    pub root: Window,
    pub root_depth: u8,
    /// An unmapped input-only window addressed by marker client messages.
    pub marker_window: Window,
    release_marker_atom: Atom,
    dmabuf_marker_atom: Atom,
    formats: Vec<PictureFormat>,
}

impl HostContext {
    pub fn new(connection: Rc<RustConnection>, screen: usize) -> Result<Self, RenderError> {
        let setup = connection.setup();
        let screen = setup
            .roots
            .get(screen)
            .ok_or_else(|| RenderError::Connection("no such screen".into()))?;
        let root = screen.root;
        let root_depth = screen.root_depth;

        // Negotiate every extension we rely on up front; several refuse
        // requests from clients that skipped the version handshake.
        connection
            .render_query_version(0, 11)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        connection
            .xfixes_query_version(5, 0)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        connection
            .shm_query_version()
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        connection
            .sync_initialize(3, 1)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        connection
            .present_query_version(1, 2)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;
        connection
            .dri3_query_version(1, 2)
            .map_err(connection_error)?
            .reply()
            .map_err(host_error)?;

        let marker_window = connection.generate_id().map_err(host_error)?;
        connection
            .create_window(
                0,
                marker_window,
                root,
                -1,
                -1,
                1,
                1,
                0,
                WindowClass::INPUT_ONLY,
                0,
                &CreateWindowAux::new().override_redirect(1),
            )
            .map_err(connection_error)?;

        let release_marker_atom = intern(&connection, b"_WAYBRIDGE_BUFFER_RELEASE")?;
        let dmabuf_marker_atom = intern(&connection, b"_WAYBRIDGE_DMABUF_CREATED")?;
        let formats = query_formats(&connection)?;
        debug!("cached {} host picture formats", formats.len());

        Ok(Self {
            connection,
            root,
            root_depth,
            marker_window,
            release_marker_atom,
            dmabuf_marker_atom,
            formats,
        })
    }

    pub fn formats(&self) -> &[PictureFormat] {
        &self.formats
    }

    pub fn find_format(&self, pictformat: u32) -> Option<&PictureFormat> {
        self.formats.iter().find(|format| format.id == pictformat)
    }

    /// A direct format whose geometry matches the given depth, suitable for
    /// back buffers and single-pixel fills.
    pub fn format_for_depth(&self, depth: u8) -> Option<&PictureFormat> {
        self.formats.iter().find(|format| format.depth == depth)
    }

    /// Sends the self-addressed marker message. The host promises it is
    /// delivered only after all preceding requests have been fully
    /// processed. Returns the request sequence number.
    pub fn send_marker(&self, kind: MarkerKind, id: RoundTripId) -> Result<u64, RenderError> {
        let atom = self.marker_atom(kind);
        let (high, low) = id.to_halves();
        let event = ClientMessageEvent::new(
            32,
            self.marker_window,
            atom,
            [high, low, 0, 0, 0],
        );
        let cookie = self
            .connection
            .send_event(false, self.marker_window, EventMask::NO_EVENT, event)
            .map_err(connection_error)?;
        Ok(cookie.sequence_number())
    }

    /// Decodes an echoed marker, if the message is one of ours.
    pub fn decode_marker(&self, event: &ClientMessageEvent) -> Option<(MarkerKind, RoundTripId)> {
        if event.format != 32 || event.window != self.marker_window {
            return None;
        }
        let kind = if event.type_ == self.release_marker_atom {
            MarkerKind::BufferRelease
        } else if event.type_ == self.dmabuf_marker_atom {
            MarkerKind::DmaBufCreated
        } else {
            return None;
        };
        let data = event.data.as_data32();
        Some((kind, RoundTripId::from_halves(data[0], data[1])))
    }

    fn marker_atom(&self, kind: MarkerKind) -> Atom {
        match kind {
            MarkerKind::BufferRelease => self.release_marker_atom,
            MarkerKind::DmaBufCreated => self.dmabuf_marker_atom,
        }
    }
}

fn intern(connection: &RustConnection, name: &[u8]) -> Result<Atom, RenderError> {
    Ok(connection
        .intern_atom(false, name)
        .map_err(connection_error)?
        .reply()
        .map_err(host_error)?
        .atom)
}

fn query_formats(connection: &RustConnection) -> Result<Vec<PictureFormat>, RenderError> {
    let reply = connection
        .render_query_pict_formats()
        .map_err(connection_error)?
        .reply()
        .map_err(host_error)?;
    let pixmap_formats = &connection.setup().pixmap_formats;
    let formats = reply
        .formats
        .iter()
        .filter(|info| info.type_ == PictType::DIRECT)
        .filter_map(|info| {
            let pixmap_format = pixmap_formats
                .iter()
                .find(|format| format.depth == info.depth)?;
            Some(PictureFormat {
                id: info.id,
                depth: info.depth,
                bpp: pixmap_format.bits_per_pixel,
                scanline_pad: pixmap_format.scanline_pad,
                red_mask: info.direct.red_mask,
                green_mask: info.direct.green_mask,
                blue_mask: info.direct.blue_mask,
                alpha_mask: info.direct.alpha_mask,
                red_shift: info.direct.red_shift,
                green_shift: info.direct.green_shift,
                blue_shift: info.direct.blue_shift,
                alpha_shift: info.direct.alpha_shift,
            })
        })
        .collect();
    Ok(formats)
}

/// Converts a window-space box into a wire rectangle.
pub(crate) fn to_rectangle(b: geometry::WindowBox) -> x11rb::protocol::xproto::Rectangle {
    x11rb::protocol::xproto::Rectangle {
        x: b.min.x as i16,
        y: b.min.y as i16,
        width: b.width().max(0) as u16,
        height: b.height().max(0) as u16,
    }
}

/// The render-extension color for a 16-bit-scaled rgba value.
pub(crate) fn to_color(red: u16, green: u16, blue: u16, alpha: u16) -> render::Color {
    render::Color {
        red,
        green,
        blue,
        alpha,
    }
}
