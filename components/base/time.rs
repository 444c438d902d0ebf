/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The host server only hands out 32-bit millisecond timestamps, which wrap
//! roughly every 49 days. [`ServerTime`] stitches those into a 64-bit
//! microsecond clock by trusting forward modular movement and falling back
//! to the local monotonic clock when a timestamp appears to run backwards.

use std::time::Instant;

/// Half the 32-bit range; modular deltas below this are treated as forward
/// movement of the server clock.
const FORWARD_WINDOW_MS: u32 = 0x8000_0000;

#[derive(Debug)]
pub struct ServerTime {
    /// Extended server clock, in microseconds, at the last observation.
    server_us: u64,
    /// The low 32 bits of the server clock, in milliseconds, at the last
    /// observation. Kept separately so sub-millisecond advances from the
    /// monotonic fallback do not skew the modular comparison.
    last_server_ms: u32,
    /// Local monotonic reading taken at the last observation.
    observed_at: Option<Instant>,
}

impl Default for ServerTime {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTime {
    pub fn new() -> Self {
        Self {
            server_us: 0,
            last_server_ms: 0,
            observed_at: None,
        }
    }

    /// Folds a fresh 32-bit millisecond timestamp from the host into the
    /// extended clock and returns the extended value in microseconds.
    pub fn observe_ms(&mut self, server_ms: u32) -> u64 {
        self.observe_ms_at(server_ms, Instant::now())
    }

    fn observe_ms_at(&mut self, server_ms: u32, now: Instant) -> u64 {
        match self.observed_at {
            None => {
                self.server_us = u64::from(server_ms) * 1000;
            },
            Some(previous) => {
                let delta_ms = server_ms.wrapping_sub(self.last_server_ms);
                if delta_ms < FORWARD_WINDOW_MS {
                    self.server_us += u64::from(delta_ms) * 1000;
                } else {
                    // The host clock ran backwards in the modular sense;
                    // advance by the locally elapsed time instead.
                    let elapsed = now.saturating_duration_since(previous);
                    self.server_us += elapsed.as_micros() as u64;
                }
            },
        }
        self.last_server_ms = server_ms;
        self.observed_at = Some(now);
        self.server_us
    }

    /// The extended clock at the last observation.
    pub fn last_us(&self) -> u64 {
        self.server_us
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn forward_movement_is_trusted() {
        let start = Instant::now();
        let mut time = ServerTime::new();
        assert_eq!(time.observe_ms_at(1000, start), 1_000_000);
        assert_eq!(
            time.observe_ms_at(1016, start + Duration::from_millis(16)),
            1_016_000
        );
    }

    #[test]
    fn wraparound_is_forward() {
        let start = Instant::now();
        let mut time = ServerTime::new();
        time.observe_ms_at(u32::MAX - 4, start);
        let extended = time.observe_ms_at(5, start + Duration::from_millis(10));
        assert_eq!(extended, (u64::from(u32::MAX - 4) + 10) * 1000);
    }

    #[test]
    fn backwards_timestamp_advances_by_monotonic_delta() {
        let start = Instant::now();
        let mut time = ServerTime::new();
        time.observe_ms_at(5000, start);
        let extended = time.observe_ms_at(4000, start + Duration::from_millis(7));
        assert_eq!(extended, 5_000_000 + 7_000);
        // The next forward movement is measured from the bogus stamp.
        let extended = time.observe_ms_at(4001, start + Duration::from_millis(8));
        assert_eq!(extended, 5_000_000 + 7_000 + 1_000);
    }

    #[test]
    fn never_decreases() {
        let start = Instant::now();
        let mut time = ServerTime::new();
        let mut last = 0;
        for (offset, stamp) in [(0u64, 100u32), (5, 90), (10, 95), (15, 200)]
            .into_iter()
        {
            let value = time.observe_ms_at(stamp, start + Duration::from_millis(offset));
            assert!(value >= last);
            last = value;
        }
    }
}
