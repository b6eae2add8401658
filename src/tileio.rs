//! Tile payload codec: staging, compression and the legacy decode path.
//!
//! A tile payload on disk is one indicator byte followed by the cell data.
//! Indicator `0` is the only value ever written; `1` marks the retired
//! run-length pre-pass that old volumes may still carry and readers must
//! keep accepting. Payloads hold only the live (clipped) cells; the
//! reader re-pads edge tiles with nulls.

use std::io::Write;

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};

use crate::codec::{is_null_f32, is_null_f64};
use crate::error::{VoxError, VoxResult};
use crate::fpcompress::{rearrange_f32, rearrange_f64, restore_f32, restore_f64};
use crate::header::CellType;
use crate::range::FpRange;
use crate::tilemath::{Clip, TileLayout};

/// Indicator byte of every freshly written tile.
pub const INDICATOR_FRESH: u8 = 0;
/// Indicator byte of the legacy run-length encoded form. Decodable, never
/// produced.
pub const INDICATOR_LEGACY_RLE: u8 = 1;

/// Per-map encoding parameters, fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct TileCodec {
    /// Cell width of the payloads.
    pub cell_type: CellType,
    /// Whether payloads go through the float codec plus zlib.
    pub compressed: bool,
    /// Mantissa bits kept when compressing; `-1` keeps all.
    pub precision: i32,
    /// Uncompressed payloads are big-endian when set, little-endian
    /// otherwise. Compressed payloads are byte-order free.
    pub xdr: bool,
}

fn corrupt(what: &str) -> VoxError {
    VoxError::CorruptTile(what.to_string())
}

fn bytes_to_f32(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn bytes_to_f64(raw: &[u8]) -> Vec<f64> {
    raw.chunks_exact(8)
        .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

impl TileCodec {
    /// Encodes the live cells of one tile (native byte order in `live`)
    /// into an on-disk payload, indicator byte included.
    pub fn encode(&self, live: &[u8]) -> VoxResult<Vec<u8>> {
        let mut out = vec![INDICATOR_FRESH];
        if self.compressed {
            let staged = match self.cell_type {
                CellType::Float => rearrange_f32(&bytes_to_f32(live), self.precision),
                CellType::Double => rearrange_f64(&bytes_to_f64(live), self.precision),
            };
            let mut encoder = ZlibEncoder::new(out, Compression::default());
            encoder.write_all(&staged)?;
            out = encoder.finish()?;
        } else if self.xdr {
            match self.cell_type {
                CellType::Float => {
                    for v in bytes_to_f32(live) {
                        out.extend_from_slice(&v.to_be_bytes());
                    }
                }
                CellType::Double => {
                    for v in bytes_to_f64(live) {
                        out.extend_from_slice(&v.to_be_bytes());
                    }
                }
            }
        } else {
            match self.cell_type {
                CellType::Float => {
                    for v in bytes_to_f32(live) {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                CellType::Double => {
                    for v in bytes_to_f64(live) {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Decodes a payload back into `count` live cells, native byte order.
    pub fn decode(&self, payload: &[u8], count: usize) -> VoxResult<Vec<u8>> {
        let (&indicator, body) = payload.split_first().ok_or_else(|| corrupt("empty payload"))?;
        let decoded;
        let body = match indicator {
            INDICATOR_FRESH => body,
            INDICATOR_LEGACY_RLE => {
                decoded = rle_decode(body)?;
                &decoded[..]
            }
            other => return Err(corrupt(&format!("unknown indicator byte {other}"))),
        };

        let cell_size = self.cell_type.bytes();
        let mut out = Vec::with_capacity(count * cell_size);
        if self.compressed {
            let mut staged = Vec::new();
            {
                let mut decoder = ZlibDecoder::new(&mut staged);
                decoder.write_all(body)?;
                decoder.finish()?;
            }
            match self.cell_type {
                CellType::Float => {
                    for v in restore_f32(&staged, count)? {
                        out.extend_from_slice(&v.to_ne_bytes());
                    }
                }
                CellType::Double => {
                    for v in restore_f64(&staged, count)? {
                        out.extend_from_slice(&v.to_ne_bytes());
                    }
                }
            }
        } else {
            if body.len() != count * cell_size {
                return Err(corrupt("uncompressed payload length mismatch"));
            }
            for chunk in body.chunks_exact(cell_size) {
                match self.cell_type {
                    CellType::Float => {
                        let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
                        let v = if self.xdr {
                            f32::from_be_bytes(raw)
                        } else {
                            f32::from_le_bytes(raw)
                        };
                        out.extend_from_slice(&v.to_ne_bytes());
                    }
                    CellType::Double => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        let v = if self.xdr {
                            f64::from_be_bytes(raw)
                        } else {
                            f64::from_le_bytes(raw)
                        };
                        out.extend_from_slice(&v.to_ne_bytes());
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Expands the retired run-length form: a sequence of `(run, byte)` pairs.
pub fn rle_decode(src: &[u8]) -> VoxResult<Vec<u8>> {
    if !src.len().is_multiple_of(2) {
        return Err(corrupt("odd RLE payload length"));
    }
    let mut out = Vec::with_capacity(src.len());
    for pair in src.chunks_exact(2) {
        let run = pair[0] as usize;
        if run == 0 {
            return Err(corrupt("zero-length RLE run"));
        }
        out.extend(std::iter::repeat_n(pair[1], run));
    }
    Ok(out)
}

/// Copies the live cells of a (possibly padded) tile buffer into a
/// contiguous block, row-major x-fastest z-slowest.
#[must_use]
pub fn extract_clipped(tile: &[u8], layout: &TileLayout, clip: &Clip, cell_size: usize) -> Vec<u8> {
    let row = layout.tile_x as usize * cell_size;
    let slice = layout.tile_x as usize * layout.tile_y as usize * cell_size;
    let live_row = clip.cols as usize * cell_size;
    let mut out = Vec::with_capacity(clip.cells() as usize * cell_size);
    for z in 0..clip.depths as usize {
        for y in 0..clip.rows as usize {
            let start = z * slice + y * row;
            out.extend_from_slice(&tile[start..start + live_row]);
        }
    }
    out
}

/// Inverse of [`extract_clipped`]: scatters the live cells back into a
/// full tile buffer and fills the padding with nulls.
pub fn expand_clipped(
    live: &[u8],
    layout: &TileLayout,
    clip: &Clip,
    cell_type: CellType,
    tile: &mut [u8],
) -> VoxResult<()> {
    let cell_size = cell_type.bytes();
    if live.len() != clip.cells() as usize * cell_size {
        return Err(corrupt("live cell block length mismatch"));
    }
    fill_null(tile, cell_type);
    let row = layout.tile_x as usize * cell_size;
    let slice = layout.tile_x as usize * layout.tile_y as usize * cell_size;
    let live_row = clip.cols as usize * cell_size;
    for z in 0..clip.depths as usize {
        for y in 0..clip.rows as usize {
            let start = z * slice + y * row;
            let src = (z * clip.rows as usize + y) * live_row;
            tile[start..start + live_row].copy_from_slice(&live[src..src + live_row]);
        }
    }
    Ok(())
}

/// Sets every cell of a native tile buffer to the null sentinel.
pub fn fill_null(tile: &mut [u8], cell_type: CellType) {
    // The sentinel is the all-ones pattern for both widths.
    let _ = cell_type;
    tile.fill(0xFF);
}

/// Folds the live cells of a tile into the running range, skipping nulls.
pub fn update_range(range: &mut FpRange, live: &[u8], cell_type: CellType) {
    match cell_type {
        CellType::Float => {
            for v in bytes_to_f32(live) {
                if !is_null_f32(v) {
                    range.update(f64::from(v));
                }
            }
        }
        CellType::Double => {
            for v in bytes_to_f64(live) {
                if !is_null_f64(v) {
                    range.update(v);
                }
            }
        }
    }
}

/// Typed helper: a native tile byte buffer as f32 cells.
#[must_use]
pub fn f32_cells(raw: &[u8]) -> Vec<f32> {
    bytes_to_f32(raw)
}

/// Typed helper: a native tile byte buffer as f64 cells.
#[must_use]
pub fn f64_cells(raw: &[u8]) -> Vec<f64> {
    bytes_to_f64(raw)
}

/// Typed helper: f32 cells to a native tile byte buffer.
#[must_use]
pub fn f32_bytes(cells: &[f32]) -> Vec<u8> {
    cells.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Typed helper: f64 cells to a native tile byte buffer.
#[must_use]
pub fn f64_bytes(cells: &[f64]) -> Vec<u8> {
    cells.iter().flat_map(|v| v.to_ne_bytes()).collect()
}
