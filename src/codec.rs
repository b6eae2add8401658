//! Portable big-endian value codec shared by the tile engine.
//!
//! All multi-byte quantities in a volume file are big-endian so archives
//! can be moved between hosts. Bulk reads and writes are staged through a
//! fixed scratch buffer to amortise syscalls.

use std::io::{Read, Write};

use crate::error::{VoxError, VoxResult};

/// Number of values staged per syscall in the bulk codecs.
const CHUNK: usize = 1024;

/// The f32 null sentinel: every bit set. Round-trip stable because the
/// pattern is a quiet NaN payload that no arithmetic in this crate produces.
#[must_use]
pub fn null_f32() -> f32 {
    f32::from_bits(u32::MAX)
}

/// The f64 null sentinel: every bit set.
#[must_use]
pub fn null_f64() -> f64 {
    f64::from_bits(u64::MAX)
}

/// Bit-pattern test for the f32 null sentinel.
#[must_use]
pub fn is_null_f32(v: f32) -> bool {
    v.to_bits() == u32::MAX
}

/// Bit-pattern test for the f64 null sentinel.
#[must_use]
pub fn is_null_f64(v: f64) -> bool {
    v.to_bits() == u64::MAX
}

macro_rules! be_codec {
    ($write:ident, $read:ident, $ty:ty, $size:expr) => {
        /// Writes the values big-endian, staging up to 1024 per syscall.
        /// A short write fails the whole call.
        pub fn $write<W: Write + ?Sized>(w: &mut W, values: &[$ty]) -> VoxResult<()> {
            let mut scratch = [0u8; CHUNK * $size];
            for chunk in values.chunks(CHUNK) {
                for (v, out) in chunk.iter().zip(scratch.chunks_exact_mut($size)) {
                    out.copy_from_slice(&v.to_be_bytes());
                }
                w.write_all(&scratch[..chunk.len() * $size])?;
            }
            Ok(())
        }

        /// Reads big-endian values into `out`. A short read fails the whole
        /// call.
        pub fn $read<R: Read + ?Sized>(r: &mut R, out: &mut [$ty]) -> VoxResult<()> {
            let mut scratch = [0u8; CHUNK * $size];
            for chunk in out.chunks_mut(CHUNK) {
                let bytes = &mut scratch[..chunk.len() * $size];
                r.read_exact(bytes)?;
                for (v, raw) in chunk.iter_mut().zip(bytes.chunks_exact($size)) {
                    let mut buf = [0u8; $size];
                    buf.copy_from_slice(raw);
                    *v = <$ty>::from_be_bytes(buf);
                }
            }
            Ok(())
        }
    };
}

be_codec!(write_i32s, read_i32s, i32, 4);
be_codec!(write_f32s, read_f32s, f32, 4);
be_codec!(write_f64s, read_f64s, f64, 8);

/// Minimum number of trailing bytes that can represent every offset in
/// `values`. Entries are non-negative offsets or the `-1` sentinel of an
/// absent tile; a negative value takes the full width so the sign
/// survives.
#[must_use]
pub fn long_nbytes(values: &[i64]) -> usize {
    let mut nbytes = 1;
    for &v in values {
        if v < 0 {
            return 8;
        }
        let significant = (8 - (v.leading_zeros() / 8) as usize).max(1);
        nbytes = nbytes.max(significant);
    }
    nbytes
}

/// Packs each value into its `nbytes` trailing bytes, big-endian.
///
/// The caller is expected to have obtained `nbytes` from [`long_nbytes`]
/// over the same values; a value that does not fit is an error rather than
/// a silent truncation.
pub fn long_encode(values: &[i64], nbytes: usize) -> VoxResult<Vec<u8>> {
    debug_assert!((1..=8).contains(&nbytes));
    let mut out = Vec::with_capacity(values.len() * nbytes);
    for &v in values {
        let be = v.to_be_bytes();
        if nbytes < 8 && (v < 0 || be[..8 - nbytes].iter().any(|&b| b != 0)) {
            return Err(VoxError::PackedLongOverflow(nbytes));
        }
        out.extend_from_slice(&be[8 - nbytes..]);
    }
    Ok(out)
}

/// Unpacks `nbytes`-wide big-endian entries.
///
/// A packed entry is either a non-negative offset or the `-1` sentinel
/// for a tile that does not exist. At full width any other negative value
/// means the source bytes were not produced by [`long_encode`].
pub fn long_decode(raw: &[u8], nbytes: usize) -> VoxResult<Vec<i64>> {
    if nbytes == 0 || nbytes > 8 || !raw.len().is_multiple_of(nbytes) {
        return Err(VoxError::PackedLongOverflow(nbytes));
    }
    let mut out = Vec::with_capacity(raw.len() / nbytes);
    for entry in raw.chunks_exact(nbytes) {
        let mut be = [0u8; 8];
        be[8 - nbytes..].copy_from_slice(entry);
        let v = i64::from_be_bytes(be);
        if nbytes >= 8 && v < -1 {
            return Err(VoxError::PackedLongOverflow(nbytes));
        }
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sentinels_are_bit_stable() {
        assert!(is_null_f32(null_f32()));
        assert!(is_null_f64(null_f64()));
        // A plain NaN is not the sentinel.
        assert!(!is_null_f32(f32::NAN));
        assert!(!is_null_f64(f64::NAN));
        assert!(!is_null_f32(0.0));
    }

    #[test]
    fn f64_roundtrip_across_chunk_boundary() {
        let values: Vec<f64> = (0..CHUNK + 37).map(|i| i as f64 * 0.5 - 3.0).collect();
        let mut buf = Vec::new();
        write_f64s(&mut buf, &values).unwrap();
        assert_eq!(buf.len(), values.len() * 8);

        let mut back = vec![0.0; values.len()];
        read_f64s(&mut buf.as_slice(), &mut back).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn i32_is_big_endian_on_disk() {
        let mut buf = Vec::new();
        write_i32s(&mut buf, &[0x0102_0304]).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn short_read_fails_whole_call() {
        let mut out = [0i32; 2];
        let err = read_i32s(&mut [0u8; 5].as_slice(), &mut out);
        assert!(err.is_err());
    }

    #[test]
    fn long_nbytes_grows_with_magnitude() {
        assert_eq!(long_nbytes(&[0, 1, 255]), 1);
        assert_eq!(long_nbytes(&[0, 256]), 2);
        assert_eq!(long_nbytes(&[1 << 24]), 4);
        assert_eq!(long_nbytes(&[-1]), 8);
    }

    #[test]
    fn long_roundtrip_at_minimum_width() {
        let values = vec![0, 1, 4096, 70_000, (1 << 40) + 17];
        let nbytes = long_nbytes(&values);
        assert_eq!(nbytes, 6);
        let packed = long_encode(&values, nbytes).unwrap();
        assert_eq!(packed.len(), values.len() * nbytes);
        assert_eq!(long_decode(&packed, nbytes).unwrap(), values);
    }

    #[test]
    fn long_encode_rejects_overflow() {
        assert!(long_encode(&[256], 1).is_err());
        assert!(long_encode(&[-2], 4).is_err());
    }

    #[test]
    fn absent_sentinel_roundtrips_at_full_width() {
        // A -1 entry (all bytes set) marks a tile that does not exist and
        // forces the index to full width.
        let values = vec![16, -1, 4096];
        let nbytes = long_nbytes(&values);
        assert_eq!(nbytes, 8);
        let packed = long_encode(&values, nbytes).unwrap();
        assert_eq!(&packed[8..16], [0xFF; 8]);
        assert_eq!(long_decode(&packed, nbytes).unwrap(), values);
    }

    #[test]
    fn long_decode_rejects_below_sentinel_full_width() {
        let packed = (-2i64).to_be_bytes();
        assert!(long_decode(&packed, 8).is_err());
    }
}
