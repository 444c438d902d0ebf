/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Shared leaf types for the waybridge components: id newtypes, integer-keyed
//! tables, the arena-backed record chains, and the 64-bit extension of the
//! host server's wrapping millisecond clock.

pub mod arena;
pub mod time;

pub use rustc_hash::{FxHashMap, FxHashSet};

/// Identifies one host round trip issued by the renderer. Ids are handed out
/// from a monotonically increasing counter and echo back to us inside a
/// marker client message, so acknowledgements always retire in issue order.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RoundTripId(pub u64);

impl RoundTripId {
    /// Split into the (high, low) halves carried in a 32-bit client message.
    pub fn to_halves(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }

    pub fn from_halves(high: u32, low: u32) -> Self {
        RoundTripId(((high as u64) << 32) | low as u64)
    }
}

/// The serial attached to one presentation request, matched against
/// present-complete and present-idle notifications from the host.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PresentSerial(pub u32);

/// A monotonically increasing id generator. Never yields zero, so zero can
/// stand in for "no serial" in record fields.
#[derive(Debug, Default)]
pub struct SerialGen {
    next: u64,
}

impl SerialGen {
    pub fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    pub fn next_u32(&mut self) -> u32 {
        self.next += 1;
        self.next as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_id_halves() {
        let id = RoundTripId(0x1234_5678_9abc_def0);
        let (high, low) = id.to_halves();
        assert_eq!(high, 0x1234_5678);
        assert_eq!(low, 0x9abc_def0);
        assert_eq!(RoundTripId::from_halves(high, low), id);
    }

    #[test]
    fn serials_start_at_one() {
        let mut generator = SerialGen::default();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 2);
    }
}
