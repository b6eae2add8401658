//! Floating-point pre-compression: precision truncation and byte-plane
//! rearrangement.
//!
//! Tiles are staged through this codec before zlib. Clearing the low
//! mantissa bits and regrouping the value bytes into per-position planes
//! (all sign/exponent bytes first, least significant mantissa bytes last)
//! turns the payload into long runs that deflate well. Null cells are
//! excluded from the planes and carried in a leading bitmap instead.

use crate::codec::{is_null_f32, is_null_f64, null_f32, null_f64};
use crate::error::{VoxError, VoxResult};

/// Mode byte: the block contains nulls and a bitmap follows.
pub const SOME_NULL: u8 = 0;
/// Mode byte: no nulls, no bitmap.
pub const ZERO_NULL: u8 = 1;
/// Mode byte: every cell is null; the block is this single byte.
pub const ALL_NULL: u8 = 2;

/// Mantissa width of an f32.
pub const F32_MANTISSA_BITS: i32 = 23;
/// Mantissa width of an f64.
pub const F64_MANTISSA_BITS: i32 = 52;

fn null_bitmap(nulls: &[bool]) -> Vec<u8> {
    let mut bitmap = vec![0u8; nulls.len().div_ceil(8)];
    for (k, &is_null) in nulls.iter().enumerate() {
        if is_null {
            bitmap[k / 8] |= 1 << (k % 8);
        }
    }
    bitmap
}

macro_rules! fp_codec {
    ($rearrange:ident, $restore:ident, $ty:ty, $bits:ty, $size:expr,
     $mantissa:expr, $is_null:ident, $null:ident) => {
        /// Rearranges a block of cells into planes, truncating the mantissa
        /// to `precision` bits (`-1` keeps full precision).
        #[must_use]
        pub fn $rearrange(values: &[$ty], precision: i32) -> Vec<u8> {
            let nulls: Vec<bool> = values.iter().map(|&v| $is_null(v)).collect();
            let nof_null = nulls.iter().filter(|&&n| n).count();
            if nof_null == values.len() {
                return vec![ALL_NULL];
            }

            let mask: $bits = if precision >= 0 && precision < $mantissa {
                <$bits>::MAX << ($mantissa - precision)
            } else {
                <$bits>::MAX
            };

            let mut out = Vec::with_capacity(1 + values.len() * $size);
            if nof_null == 0 {
                out.push(ZERO_NULL);
            } else {
                out.push(SOME_NULL);
                out.extend_from_slice(&null_bitmap(&nulls));
            }
            for plane in 0..$size {
                for &v in values.iter().filter(|&&v| !$is_null(v)) {
                    out.push((v.to_bits() & mask).to_be_bytes()[plane]);
                }
            }
            out
        }

        /// Restores `count` cells from a rearranged block.
        pub fn $restore(raw: &[u8], count: usize) -> VoxResult<Vec<$ty>> {
            let corrupt = |what: &str| VoxError::CorruptTile(what.to_string());
            let (&mode, rest) = raw.split_first().ok_or_else(|| corrupt("empty block"))?;
            match mode {
                ALL_NULL => return Ok(vec![$null(); count]),
                ZERO_NULL | SOME_NULL => {}
                _ => return Err(corrupt("unknown null mode")),
            }

            let (bitmap, planes) = if mode == SOME_NULL {
                let len = count.div_ceil(8);
                if rest.len() < len {
                    return Err(corrupt("truncated null bitmap"));
                }
                rest.split_at(len)
            } else {
                (&[][..], rest)
            };
            let nulls: Vec<bool> = (0..count)
                .map(|k| mode == SOME_NULL && bitmap[k / 8] & (1 << (k % 8)) != 0)
                .collect();
            let live = nulls.iter().filter(|&&n| !n).count();
            if planes.len() != live * $size {
                return Err(corrupt("plane length mismatch"));
            }

            let mut out = Vec::with_capacity(count);
            let mut cursor = 0;
            for &is_null in &nulls {
                if is_null {
                    out.push($null());
                } else {
                    let mut be = [0u8; $size];
                    for (plane, byte) in be.iter_mut().enumerate() {
                        *byte = planes[plane * live + cursor];
                    }
                    out.push(<$ty>::from_bits(<$bits>::from_be_bytes(be)));
                    cursor += 1;
                }
            }
            Ok(out)
        }
    };
}

fp_codec!(rearrange_f32, restore_f32, f32, u32, 4, F32_MANTISSA_BITS, is_null_f32, null_f32);
fp_codec!(rearrange_f64, restore_f64, f64, u64, 8, F64_MANTISSA_BITS, is_null_f64, null_f64);

/// The value a cell assumes after a round-trip at the given precision.
#[must_use]
pub fn truncate_f32(v: f32, precision: i32) -> f32 {
    if is_null_f32(v) || precision < 0 || precision >= F32_MANTISSA_BITS {
        return v;
    }
    f32::from_bits(v.to_bits() & (u32::MAX << (F32_MANTISSA_BITS - precision)))
}

/// See [`truncate_f32`].
#[must_use]
pub fn truncate_f64(v: f64, precision: i32) -> f64 {
    if is_null_f64(v) || precision < 0 || precision >= F64_MANTISSA_BITS {
        return v;
    }
    f64::from_bits(v.to_bits() & (u64::MAX << (F64_MANTISSA_BITS - precision)))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn all_null_block_is_one_byte() {
        let block = rearrange_f32(&[null_f32(); 9], -1);
        assert_eq!(block, vec![ALL_NULL]);
        let back = restore_f32(&block, 9).unwrap();
        assert!(back.iter().all(|&v| is_null_f32(v)));
    }

    #[test]
    fn full_precision_roundtrip_is_exact() {
        let values = [1.5f64, -0.25, 6.25e-3, f64::MIN_POSITIVE, 1e300];
        let block = rearrange_f64(&values, -1);
        assert_eq!(block[0], ZERO_NULL);
        assert_eq!(restore_f64(&block, values.len()).unwrap(), values);
    }

    #[rstest]
    #[case(-1)]
    #[case(0)]
    #[case(8)]
    #[case(16)]
    #[case(F32_MANTISSA_BITS)]
    fn truncated_roundtrip_matches_truncate(#[case] precision: i32) {
        let values: Vec<f32> = (0..64)
            .map(|i| if i % 7 == 0 { null_f32() } else { (i as f32).sqrt() * 3.7 - 11.0 })
            .collect();
        let block = rearrange_f32(&values, precision);
        let back = restore_f32(&block, values.len()).unwrap();
        for (&v, &b) in values.iter().zip(&back) {
            if is_null_f32(v) {
                assert!(is_null_f32(b));
            } else {
                assert_eq!(b, truncate_f32(v, precision));
                // Truncation error is bounded by 2^-precision of the value's scale.
                if precision > 0 {
                    assert!((b - v).abs() <= v.abs() * 2.0f32.powi(-precision));
                }
            }
        }
    }

    #[test]
    fn some_null_carries_bitmap() {
        let values = [1.0f32, null_f32(), 3.0];
        let block = rearrange_f32(&values, -1);
        assert_eq!(block[0], SOME_NULL);
        assert_eq!(block[1], 0b010);
        assert_eq!(block.len(), 1 + 1 + 2 * 4);
        let back = restore_f32(&block, 3).unwrap();
        assert_eq!(back[0], 1.0);
        assert!(is_null_f32(back[1]));
        assert_eq!(back[2], 3.0);
    }

    #[test]
    fn truncation_zeroes_low_mantissa_bits() {
        let v = f32::from_bits(0x3F80_07FF);
        let t = truncate_f32(v, 8);
        assert_eq!(t.to_bits(), 0x3F80_0000);
    }

    #[test]
    fn corrupt_blocks_are_rejected() {
        assert!(restore_f32(&[], 1).is_err());
        assert!(restore_f32(&[9], 1).is_err());
        assert!(restore_f32(&[ZERO_NULL, 1, 2], 1).is_err());
    }
}
