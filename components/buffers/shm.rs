/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Shared-memory buffer geometry validation. All arithmetic widens to i64
//! first; a malicious client must not be able to wrap any of these checks.

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ShmError {
    #[error("buffer size must be positive")]
    BadSize,
    #[error("offset must not be negative")]
    NegativeOffset,
    #[error("stride must not be negative")]
    NegativeStride,
    #[error("stride {got} does not match the padded row size {expected}")]
    BadStride { expected: i64, got: i32 },
    #[error("buffer does not fit in the pool")]
    PoolOverflow,
}

/// Validates one buffer's geometry against its pool.
///
/// The stride must be exactly the host's padded row size for the format:
/// `round_up(width * bpp, scanline_pad)` bits. The buffer must end inside
/// the pool.
pub fn validate_shm(
    offset: i32,
    stride: i32,
    width: i32,
    height: i32,
    pool_size: u32,
    bpp: u32,
    scanline_pad: u32,
) -> Result<(), ShmError> {
    if width <= 0 || height <= 0 {
        return Err(ShmError::BadSize);
    }
    if offset < 0 {
        return Err(ShmError::NegativeOffset);
    }
    if stride < 0 {
        return Err(ShmError::NegativeStride);
    }

    let row_bits = i64::from(width) * i64::from(bpp);
    let pad_bits = i64::from(scanline_pad.max(1));
    let expected = (row_bits + pad_bits - 1) / pad_bits * pad_bits / 8;
    if i64::from(stride) != expected {
        return Err(ShmError::BadStride {
            expected,
            got: stride,
        });
    }

    let Some(body) = i64::from(stride).checked_mul(i64::from(height)) else {
        return Err(ShmError::PoolOverflow);
    };
    let Some(end) = i64::from(offset).checked_add(body) else {
        return Err(ShmError::PoolOverflow);
    };
    if end > i64::from(pool_size) {
        return Err(ShmError::PoolOverflow);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // X server geometry for 32bpp formats.
    const BPP: u32 = 32;
    const PAD: u32 = 32;

    #[test]
    fn accepts_a_tight_argb_buffer() {
        assert_eq!(validate_shm(0, 256, 64, 64, 64 * 256, BPP, PAD), Ok(()));
    }

    #[test]
    fn accepts_an_offset_buffer_inside_the_pool() {
        assert_eq!(validate_shm(1024, 256, 64, 64, 1024 + 64 * 256, BPP, PAD), Ok(()));
    }

    #[test]
    fn rejects_non_positive_sizes() {
        assert_eq!(validate_shm(0, 256, 0, 64, 1 << 20, BPP, PAD), Err(ShmError::BadSize));
        assert_eq!(validate_shm(0, 256, 64, -1, 1 << 20, BPP, PAD), Err(ShmError::BadSize));
    }

    #[test]
    fn rejects_negative_offset_and_stride() {
        assert_eq!(
            validate_shm(-4, 256, 64, 64, 1 << 20, BPP, PAD),
            Err(ShmError::NegativeOffset)
        );
        assert_eq!(
            validate_shm(0, -256, 64, 64, 1 << 20, BPP, PAD),
            Err(ShmError::NegativeStride)
        );
    }

    #[test]
    fn rejects_unpadded_stride() {
        // 61 pixels at 32bpp pad to 244 bytes; anything else is wrong.
        assert_eq!(validate_shm(0, 244, 61, 4, 1 << 20, BPP, PAD), Ok(()));
        assert_eq!(
            validate_shm(0, 248, 61, 4, 1 << 20, BPP, PAD),
            Err(ShmError::BadStride {
                expected: 244,
                got: 248
            })
        );
    }

    #[test]
    fn respects_scanline_pad_for_narrow_formats() {
        // 16bpp rows padded to 32 bits: 3 pixels = 48 bits -> 64 bits = 8 bytes.
        assert_eq!(validate_shm(0, 8, 3, 2, 64, 16, 32), Ok(()));
        assert_eq!(
            validate_shm(0, 6, 3, 2, 64, 16, 32),
            Err(ShmError::BadStride { expected: 8, got: 6 })
        );
    }

    #[test]
    fn rejects_a_buffer_ending_past_the_pool() {
        assert_eq!(
            validate_shm(4, 256, 64, 64, 64 * 256, BPP, PAD),
            Err(ShmError::PoolOverflow)
        );
    }

    #[test]
    fn large_values_fail_cleanly_instead_of_wrapping() {
        // A stride and height whose product exceeds any pool must be
        // rejected without tripping an overflow.
        let width = 0x0800_0000;
        let expected_stride = width * 4;
        assert_eq!(
            validate_shm(
                i32::MAX,
                expected_stride,
                width,
                i32::MAX,
                u32::MAX,
                BPP,
                PAD
            ),
            Err(ShmError::PoolOverflow)
        );
    }
}
