/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Decoding of the window manager's frame-synchronization client messages.
//!
//! All three messages carry four 32-bit values with 64-bit quantities
//! split into (low, high) halves. Transports that hand them over as longs
//! sign-extend, so the halves are masked down to 32 bits before they are
//! stitched back together.

use x11rb::protocol::xproto::{Atom, AtomEnum, ClientMessageEvent, ConnectionExt as _, Window};
use x11rb::rust_connection::RustConnection;

/// The atoms the decoder matches against, interned once at startup.
#[derive(Clone, Copy, Debug)]
pub struct WmAtoms {
    pub frame_drawn: Atom,
    pub frame_timings: Atom,
    pub wm_protocols: Atom,
    pub sync_request: Atom,
    pub net_supported: Atom,
    pub supporting_wm_check: Atom,
}

impl WmAtoms {
    pub fn intern(connection: &RustConnection) -> Result<Self, x11rb::errors::ReplyError> {
        let intern = |name: &[u8]| -> Result<Atom, x11rb::errors::ReplyError> {
            Ok(connection
                .intern_atom(false, name)
                .map_err(x11rb::errors::ReplyError::from)?
                .reply()?
                .atom)
        };
        Ok(WmAtoms {
            frame_drawn: intern(b"_NET_WM_FRAME_DRAWN")?,
            frame_timings: intern(b"_NET_WM_FRAME_TIMINGS")?,
            wm_protocols: intern(b"WM_PROTOCOLS")?,
            sync_request: intern(b"_NET_WM_SYNC_REQUEST")?,
            net_supported: intern(b"_NET_SUPPORTED")?,
            supporting_wm_check: intern(b"_NET_SUPPORTING_WM_CHECK")?,
        })
    }
}

/// A decoded frame-synchronization message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WmFrameEvent {
    /// The host finished drawing the frame with the given counter value.
    FrameDrawn {
        window: Window,
        counter: u64,
        /// Frame time in microseconds of the host's wrapping clock.
        time_us: u64,
    },
    /// Timing feedback for a drawn frame.
    FrameTimings {
        window: Window,
        counter: u64,
        /// Offset from the frame time to the presentation, microseconds.
        presentation_offset_us: u32,
        refresh_interval_us: u32,
    },
    /// The window manager asks for a synchronized configure.
    SyncRequest { window: Window, value: u64 },
}

fn stitch(low: u32, high: u32) -> u64 {
    // The halves may arrive sign-extended into longs; keep 32 bits each.
    (u64::from(high) & 0xffff_ffff) << 32 | (u64::from(low) & 0xffff_ffff)
}

/// Decodes one client message, if it is a frame-synchronization message.
pub fn decode(atoms: &WmAtoms, event: &ClientMessageEvent) -> Option<WmFrameEvent> {
    if event.format != 32 {
        return None;
    }
    let data = event.data.as_data32();
    if event.type_ == atoms.frame_drawn {
        return Some(WmFrameEvent::FrameDrawn {
            window: event.window,
            counter: stitch(data[0], data[1]),
            time_us: stitch(data[2], data[3]),
        });
    }
    if event.type_ == atoms.frame_timings {
        return Some(WmFrameEvent::FrameTimings {
            window: event.window,
            counter: stitch(data[0], data[1]),
            presentation_offset_us: data[2],
            refresh_interval_us: data[3],
        });
    }
    if event.type_ == atoms.wm_protocols && data[0] == atoms.sync_request {
        return Some(WmFrameEvent::SyncRequest {
            window: event.window,
            value: stitch(data[2], data[3]),
        });
    }
    None
}

/// Probes whether the window manager speaks the frame-drawn handshake:
/// `_NET_SUPPORTING_WM_CHECK` must point at a live window and
/// `_NET_SUPPORTED` must list `_NET_WM_FRAME_DRAWN`.
pub fn frame_sync_supported(
    connection: &RustConnection,
    root: Window,
    atoms: &WmAtoms,
) -> Result<bool, x11rb::errors::ReplyError> {
    let check = connection
        .get_property(false, root, atoms.supporting_wm_check, AtomEnum::WINDOW, 0, 1)?
        .reply()?;
    let Some(check_window) = check.value32().and_then(|mut values| values.next()) else {
        return Ok(false);
    };
    if check_window == 0 {
        return Ok(false);
    }
    let supported = connection
        .get_property(false, root, atoms.net_supported, AtomEnum::ATOM, 0, 4096)?
        .reply()?;
    Ok(supported
        .value32()
        .is_some_and(|mut atoms_iter| atoms_iter.any(|atom| atom == atoms.frame_drawn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atoms() -> WmAtoms {
        WmAtoms {
            frame_drawn: 100,
            frame_timings: 101,
            wm_protocols: 102,
            sync_request: 103,
            net_supported: 104,
            supporting_wm_check: 105,
        }
    }

    fn message(type_: Atom, data: [u32; 5]) -> ClientMessageEvent {
        ClientMessageEvent::new(32, 0x500, type_, data)
    }

    #[test]
    fn frame_drawn_stitches_counter_and_time() {
        let atoms = atoms();
        let event = message(atoms.frame_drawn, [0x9abc_def0, 0x1234_5678, 7, 1, 0]);
        assert_eq!(
            decode(&atoms, &event),
            Some(WmFrameEvent::FrameDrawn {
                window: 0x500,
                counter: 0x1234_5678_9abc_def0,
                time_us: 0x1_0000_0007,
            })
        );
    }

    #[test]
    fn sync_request_rides_inside_wm_protocols() {
        let atoms = atoms();
        let event = message(atoms.wm_protocols, [atoms.sync_request, 1234, 6, 0, 0]);
        assert_eq!(
            decode(&atoms, &event),
            Some(WmFrameEvent::SyncRequest {
                window: 0x500,
                value: 6,
            })
        );
    }

    #[test]
    fn other_protocols_and_formats_are_ignored() {
        let atoms = atoms();
        let event = message(atoms.wm_protocols, [999, 0, 0, 0, 0]);
        assert_eq!(decode(&atoms, &event), None);
        let mut event = message(atoms.frame_drawn, [0, 0, 0, 0, 0]);
        event.format = 8;
        assert_eq!(decode(&atoms, &event), None);
    }

    #[test]
    fn frame_timings_report_refresh_interval() {
        let atoms = atoms();
        let event = message(atoms.frame_timings, [8, 0, 500, 16_667, 0]);
        assert_eq!(
            decode(&atoms, &event),
            Some(WmFrameEvent::FrameTimings {
                window: 0x500,
                counter: 8,
                presentation_offset_us: 500,
                refresh_interval_us: 16_667,
            })
        );
    }
}
