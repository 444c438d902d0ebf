/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The production counter sink: two host sync counters per window, with
//! the pair advertised through `_NET_WM_SYNC_REQUEST_COUNTER` so the
//! window manager drives the extended frame-synchronization protocol.

use std::rc::Rc;

use log::warn;
use thiserror::Error;
use x11rb::connection::Connection;
use x11rb::protocol::sync::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt as _, PropMode, Window};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::frame_clock::{CounterSink, FrameClock};

#[derive(Debug, Error)]
pub enum ClockHostError {
    #[error("host request failed: {0}")]
    Host(String),
}

fn host_error(error: impl std::fmt::Display) -> ClockHostError {
    ClockHostError::Host(error.to_string())
}

pub struct WindowCounters {
    connection: Rc<RustConnection>,
    window: Window,
    primary: sync::Counter,
    secondary: sync::Counter,
}

impl WindowCounters {
    /// Creates the counter pair, writes the window property, and returns
    /// the sink together with the frame clock bound to it.
    pub fn create(
        connection: Rc<RustConnection>,
        window: Window,
    ) -> Result<(Self, FrameClock), ClockHostError> {
        let primary = connection.generate_id().map_err(host_error)?;
        let secondary = connection.generate_id().map_err(host_error)?;
        let zero = sync::Int64 { hi: 0, lo: 0 };
        connection
            .sync_create_counter(primary, zero)
            .map_err(host_error)?;
        connection
            .sync_create_counter(secondary, zero)
            .map_err(host_error)?;

        let atom = connection
            .intern_atom(false, b"_NET_WM_SYNC_REQUEST_COUNTER")
            .map_err(host_error)?
            .reply()
            .map_err(host_error)?
            .atom;
        connection
            .change_property32(
                PropMode::REPLACE,
                window,
                atom,
                AtomEnum::CARDINAL,
                &[primary, secondary],
            )
            .map_err(host_error)?;

        let clock = FrameClock::new(primary, secondary);
        Ok((
            WindowCounters {
                connection,
                window,
                primary,
                secondary,
            },
            clock,
        ))
    }

    pub fn window(&self) -> Window {
        self.window
    }
}

impl Drop for WindowCounters {
    fn drop(&mut self) {
        let _ = self.connection.sync_destroy_counter(self.primary);
        let _ = self.connection.sync_destroy_counter(self.secondary);
    }
}

impl CounterSink for WindowCounters {
    fn set_sync_counter(&mut self, value: u64) {
        let int64 = sync::Int64 {
            hi: (value >> 32) as i32,
            lo: value as u32,
        };
        if let Err(error) = self.connection.sync_set_counter(self.secondary, int64) {
            warn!("failed to move sync counter: {error}");
        }
    }
}
