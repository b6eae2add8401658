//! Tile geometry: pure integer maps between cell coordinates, tile
//! coordinates, tile indices and in-tile offsets.

use crate::error::{VoxError, VoxResult};
use crate::header::CellType;
use crate::region::Region;

/// Fixed tiling of a region. Everything here is integer arithmetic; edge
/// tiles are clipped, never shifted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    /// Tile cells west-east.
    pub tile_x: i32,
    /// Tile cells north-south.
    pub tile_y: i32,
    /// Tile cells bottom-top.
    pub tile_z: i32,
    /// Region rows.
    pub rows: i32,
    /// Region columns.
    pub cols: i32,
    /// Region depths.
    pub depths: i32,
    /// Tile count west-east: `ceil(cols / tile_x)`.
    pub nx: i32,
    /// Tile count north-south.
    pub ny: i32,
    /// Tile count bottom-top.
    pub nz: i32,
}

/// Clipped extents of an edge tile: the live cells plus the padding that
/// only exists in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clip {
    /// Live rows.
    pub rows: i32,
    /// Live columns.
    pub cols: i32,
    /// Live depths.
    pub depths: i32,
    /// Padding columns beyond the region.
    pub x_pad: i32,
    /// Padding rows beyond the region.
    pub y_pad: i32,
    /// Padding depths beyond the region.
    pub z_pad: i32,
}

impl Clip {
    /// Number of live cells in the clipped tile.
    #[must_use]
    pub fn cells(&self) -> i32 {
        self.rows * self.cols * self.depths
    }
}

impl TileLayout {
    /// Tiles a region; tile dimensions must be positive.
    pub fn new(region: &Region, tile_x: i32, tile_y: i32, tile_z: i32) -> VoxResult<Self> {
        if tile_x <= 0 || tile_y <= 0 || tile_z <= 0 {
            return Err(VoxError::InvalidTileDimensions(tile_x, tile_y, tile_z));
        }
        Ok(Self {
            tile_x,
            tile_y,
            tile_z,
            rows: region.rows,
            cols: region.cols,
            depths: region.depths,
            nx: (region.cols + tile_x - 1) / tile_x,
            ny: (region.rows + tile_y - 1) / tile_y,
            nz: (region.depths + tile_z - 1) / tile_z,
        })
    }

    /// Cells per (unclipped) tile.
    #[must_use]
    pub fn tile_size(&self) -> usize {
        (self.tile_x * self.tile_y * self.tile_z) as usize
    }

    /// Total number of tiles.
    #[must_use]
    pub fn n_tiles(&self) -> usize {
        (self.nx * self.ny * self.nz) as usize
    }

    /// Whether a cell coordinate lies inside the region.
    #[must_use]
    pub fn coord_in_range(&self, x: i32, y: i32, z: i32) -> bool {
        x >= 0 && x < self.cols && y >= 0 && y < self.rows && z >= 0 && z < self.depths
    }

    /// Whether a tile coordinate lies inside the tile cube.
    #[must_use]
    pub fn tile_in_range(&self, tx: i32, ty: i32, tz: i32) -> bool {
        tx >= 0 && tx < self.nx && ty >= 0 && ty < self.ny && tz >= 0 && tz < self.nz
    }

    /// Whether a tile index is valid for this layout.
    #[must_use]
    pub fn tile_index_in_range(&self, tile_index: usize) -> bool {
        tile_index < self.n_tiles()
    }

    /// Splits a cell coordinate into tile coordinates and the in-tile
    /// offsets, `0 <= ox < tile_x` (and likewise per axis).
    #[must_use]
    pub fn coord_to_tile(&self, x: i32, y: i32, z: i32) -> (i32, i32, i32, i32, i32, i32) {
        (
            x / self.tile_x,
            y / self.tile_y,
            z / self.tile_z,
            x % self.tile_x,
            y % self.tile_y,
            z % self.tile_z,
        )
    }

    /// `tz·nx·ny + ty·nx + tx`.
    #[must_use]
    pub fn tile_to_index(&self, tx: i32, ty: i32, tz: i32) -> usize {
        (tz * self.nx * self.ny + ty * self.nx + tx) as usize
    }

    /// Inverse of [`Self::tile_to_index`].
    #[must_use]
    pub fn index_to_tile(&self, tile_index: usize) -> (i32, i32, i32) {
        let nxy = (self.nx * self.ny) as usize;
        let tz = tile_index / nxy;
        let rem = tile_index % nxy;
        (
            (rem % self.nx as usize) as i32,
            (rem / self.nx as usize) as i32,
            tz as i32,
        )
    }

    /// Cell coordinates of a tile's origin corner.
    #[must_use]
    pub fn tile_origin(&self, tile_index: usize) -> (i32, i32, i32) {
        let (tx, ty, tz) = self.index_to_tile(tile_index);
        (tx * self.tile_x, ty * self.tile_y, tz * self.tile_z)
    }

    /// Tile index plus the row-major in-tile offset (x fastest, z slowest).
    #[must_use]
    pub fn coord_to_tile_index(&self, x: i32, y: i32, z: i32) -> (usize, usize) {
        let (tx, ty, tz, ox, oy, oz) = self.coord_to_tile(x, y, z);
        let offset = oz * self.tile_x * self.tile_y + oy * self.tile_x + ox;
        (self.tile_to_index(tx, ty, tz), offset as usize)
    }

    /// Live extents of a tile once clipped to the region. Only the last
    /// tile along each axis carries padding.
    #[must_use]
    pub fn clipped_dimensions(&self, tile_index: usize) -> Clip {
        let (tx, ty, tz) = self.index_to_tile(tile_index);
        let cols = if tx == self.nx - 1 { (self.cols - 1) % self.tile_x + 1 } else { self.tile_x };
        let rows = if ty == self.ny - 1 { (self.rows - 1) % self.tile_y + 1 } else { self.tile_y };
        let depths =
            if tz == self.nz - 1 { (self.depths - 1) % self.tile_z + 1 } else { self.tile_z };
        Clip {
            rows,
            cols,
            depths,
            x_pad: self.tile_x - cols,
            y_pad: self.tile_y - rows,
            z_pad: self.tile_z - depths,
        }
    }
}

/// Picks tile dimensions whose tensor fits `max_bytes`.
///
/// Axes are reduced by growing per-axis divisors, but an axis is only
/// reduced while it is no more than 2x smaller than every other axis, so
/// the final shape stays balanced and edge-tile waste stays low. Iteration
/// is bounded, so pathological regions terminate with the best shape found.
#[must_use]
pub fn optimal_tile_dimensions(
    region: &Region,
    cell_type: CellType,
    max_bytes: usize,
) -> (i32, i32, i32) {
    let size = cell_type.bytes() as u64;
    let (mut x, mut y, mut z) =
        (region.cols as u64, region.rows as u64, region.depths as u64);
    let (mut divx, mut divy, mut divz) = (2u64, 2u64, 2u64);

    for _ in 0..10_000 {
        if size * x * y * z <= max_bytes as u64 {
            break;
        }
        if y / x <= 2 && z / x <= 2 {
            x = (region.cols as u64).div_ceil(divx);
            divx += 1;
        }
        if x / y <= 2 && z / y <= 2 {
            y = (region.rows as u64).div_ceil(divy);
            divy += 1;
        }
        if x / z <= 2 && y / z <= 2 {
            z = (region.depths as u64).div_ceil(divz);
            divz += 1;
        }
    }
    (x as i32, y as i32, z as i32)
}
