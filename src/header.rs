//! On-disk volume layout: the data-file header triplet and the JSON
//! metadata sidecar.
//!
//! A volume is a directory. The `cell` file inside it starts with three
//! fixed header fields, followed by the tile payloads, followed by the
//! packed index table the header points at:
//!
//! ```text
//! offset  size  field
//! 0       4     index_long_nbytes  (i32 BE, width of index_offset)
//! 4       4     index_nbytes_used  (i32 BE, bytes per packed index entry)
//! 8       8     index_offset       (i64 BE)
//! 16      ..    tile 0, tile 1, ...  (1 indicator byte + payload each)
//! index_offset  n_tiles * index_nbytes_used bytes of packed BE offsets;
//!               a tile that does not exist is stored as offset -1
//! ```
//!
//! Everything a reader needs beyond that (region, cell type, compression,
//! tile shape) lives in the `header` sidecar.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::{read_i32s, write_i32s};
use crate::error::{VoxError, VoxResult};
use crate::region::Region;

/// Directory element holding the tile data.
pub const CELL_ELEMENT: &str = "cell";
/// Directory element holding the JSON metadata sidecar.
pub const HEADER_ELEMENT: &str = "header";
/// Directory element holding the binary range sidecar.
pub const RANGE_ELEMENT: &str = "range";
/// Directory element holding the history sidecar.
pub const HISTORY_ELEMENT: &str = "hist";
/// Well-known name of the mask volume within a mapset directory.
pub const MASK_ELEMENT: &str = "mask";

/// Reserved sidecar names for colour tables and category files. Written by
/// external tooling; this crate only keeps the slots from colliding.
pub const COLOR_ELEMENT: &str = "color";
/// See [`COLOR_ELEMENT`].
pub const CATS_ELEMENT: &str = "cats";

/// Byte length of the fixed header at the start of the cell file.
pub const DATA_HEADER_LEN: u64 = 16;

/// Width of a cell on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    /// 4-byte cells.
    Float,
    /// 8-byte cells.
    Double,
}

impl CellType {
    /// Bytes per cell.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            CellType::Float => 4,
            CellType::Double => 8,
        }
    }
}

/// The JSON sidecar beside every volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// On-disk geometry.
    pub region: Region,
    /// Cell width of the payloads.
    pub cell_type: CellType,
    /// Whether tile payloads went through the float codec plus zlib.
    pub compressed: bool,
    /// Mantissa bits kept when compressing; `-1` keeps all.
    pub precision: i32,
    /// Uncompressed payloads are big-endian when set, host little-endian
    /// otherwise.
    pub xdr: bool,
    /// Tile cells west-east.
    pub tile_x: i32,
    /// Tile cells north-south.
    pub tile_y: i32,
    /// Tile cells bottom-top.
    pub tile_z: i32,
    /// Legacy volumes without an index table store tiles back to back.
    pub has_index: bool,
}

impl VolumeMeta {
    /// Writes the sidecar into a volume directory.
    pub fn write_to(&self, dir: &Path) -> VoxResult<()> {
        let file = File::create(dir.join(HEADER_ELEMENT))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Reads the sidecar from a volume directory.
    pub fn read_from(dir: &Path) -> VoxResult<Self> {
        let file = File::open(dir.join(HEADER_ELEMENT))?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// The fixed fields at the start of the cell file. `index_offset` and
/// `index_nbytes_used` are placeholders until close rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Byte width of the `index_offset` slot.
    pub index_long_nbytes: i32,
    /// Bytes per packed index entry.
    pub index_nbytes_used: i32,
    /// File offset of the packed index table.
    pub index_offset: i64,
}

impl DataHeader {
    /// A fresh write-mode header: full-width offset slot, no index yet.
    #[must_use]
    pub fn placeholder() -> Self {
        Self { index_long_nbytes: 8, index_nbytes_used: 0, index_offset: 0 }
    }

    /// Serializes the three header fields.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> VoxResult<()> {
        write_i32s(w, &[self.index_long_nbytes, self.index_nbytes_used])?;
        w.write_all(&self.index_offset.to_be_bytes())?;
        Ok(())
    }

    /// Reads and validates the three header fields.
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> VoxResult<Self> {
        let mut ints = [0i32; 2];
        read_i32s(r, &mut ints)?;
        let mut off = [0u8; 8];
        r.read_exact(&mut off)?;
        let header = Self {
            index_long_nbytes: ints[0],
            index_nbytes_used: ints[1],
            index_offset: i64::from_be_bytes(off),
        };
        if header.index_long_nbytes != 8 || header.index_offset < 0 {
            return Err(VoxError::InvalidHeader);
        }
        Ok(header)
    }

    /// Seeks back to the header slots and rewrites them in place.
    pub fn rewrite(&self, file: &mut File) -> VoxResult<()> {
        file.seek(SeekFrom::Start(0))?;
        self.write_to(file)?;
        Ok(())
    }
}

/// Appends a one-line provenance record to the history sidecar.
pub fn append_history(dir: &Path, command: &str) -> VoxResult<()> {
    let mut file = File::options().create(true).append(true).open(dir.join(HISTORY_ELEMENT))?;
    let record = serde_json::json!({ "command": command });
    writeln!(file, "{record}")?;
    Ok(())
}

/// Path of the cell file inside a volume directory.
#[must_use]
pub fn cell_path(dir: &Path) -> PathBuf {
    dir.join(CELL_ELEMENT)
}
