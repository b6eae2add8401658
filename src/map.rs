//! The map façade: one open volume, its cache, its spill file and its
//! sidecars.
//!
//! A write map appends tiles to a temp file next to the final location.
//! Tiles evicted from the cache before their final write land in a spill
//! file; `close` drains the spill, appends the packed index, patches the
//! header slots and renames the temp file into place.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{error, warn};
use tempfile::NamedTempFile;

use crate::cache::{LockOutcome, TileCache, TileStore};
use crate::codec::{
    is_null_f64, long_decode, long_encode, long_nbytes, null_f32, null_f64,
};
use crate::config::Config;
use crate::error::{VoxError, VoxResult};
use crate::header::{
    CellType, DATA_HEADER_LEN, DataHeader, MASK_ELEMENT, VolumeMeta, append_history, cell_path,
};
use crate::range::FpRange;
use crate::region::{Region, Window};
use crate::resample::{NearestNeighbor, Resampler, ResamplerHandle};
use crate::tileio::{
    TileCodec, expand_clipped, extract_clipped, fill_null, update_range,
};
use crate::tilemath::TileLayout;

/// Where a tile currently lives. The packed index table stores only the
/// first two states (an offset, or `-1` for a tile that was never
/// written); a spill position is a transient cache artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLocation {
    /// Final byte offset in the data file.
    OnDisk(u64),
    /// Never written; reads as all-null. On disk this is offset `-1`.
    Absent,
    /// Record position in the spill file.
    InSpill(u64),
}

/// Outcome of a tile write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The tile payload was appended.
    Written,
    /// The tile already had a final location; a tile is written at most
    /// once and later writes are ignored.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictTarget {
    Spill,
    DataFile,
}

/// Spill file for dirty tiles evicted before their final write. Records
/// are `tile_bytes` of cells plus a 4-byte big-endian tile index.
struct SpillFile {
    file: File,
    /// Position of the last live record, `-1` when empty.
    last_pos: i64,
    tile_bytes: usize,
    // Keeps the backing file alive (and deleted on drop).
    _handle: NamedTempFile,
}

impl SpillFile {
    fn create_in(dir: &Path, tile_bytes: usize) -> VoxResult<Self> {
        let handle = NamedTempFile::new_in(dir)?;
        let file = handle.as_file().try_clone()?;
        Ok(Self { file, last_pos: -1, tile_bytes, _handle: handle })
    }

    fn record_bytes(&self) -> u64 {
        (self.tile_bytes + 4) as u64
    }

    fn append(&mut self, tile_index: usize, buf: &[u8]) -> VoxResult<u64> {
        let pos = (self.last_pos + 1) as u64;
        self.file.seek(SeekFrom::Start(pos * self.record_bytes()))?;
        self.file.write_all(buf)?;
        self.file.write_all(&(tile_index as u32).to_be_bytes())?;
        self.last_pos = pos as i64;
        Ok(pos)
    }

    fn read_index_at(&mut self, pos: u64) -> VoxResult<usize> {
        self.file.seek(SeekFrom::Start(pos * self.record_bytes() + self.tile_bytes as u64))?;
        let mut raw = [0u8; 4];
        self.file.read_exact(&mut raw)?;
        Ok(u32::from_be_bytes(raw) as usize)
    }

    /// Reads the record at `pos` into `buf` and removes it by moving the
    /// trailing record into the hole. Returns the tile index of the moved
    /// record, if any, so the caller can patch its location.
    fn take(&mut self, pos: u64, buf: &mut [u8]) -> VoxResult<Option<usize>> {
        self.file.seek(SeekFrom::Start(pos * self.record_bytes()))?;
        self.file.read_exact(buf)?;

        let last = self.last_pos as u64;
        self.last_pos -= 1;
        if last == pos {
            return Ok(None);
        }
        let mut record = vec![0u8; self.record_bytes() as usize];
        self.file.seek(SeekFrom::Start(last * self.record_bytes()))?;
        self.file.read_exact(&mut record)?;
        self.file.seek(SeekFrom::Start(pos * self.record_bytes()))?;
        self.file.write_all(&record)?;
        let moved = u32::from_be_bytes(
            record[self.tile_bytes..].try_into().map_err(|_| VoxError::InvalidHeader)?,
        );
        Ok(Some(moved as usize))
    }
}

/// Everything the cache's backing store needs, split from [`Map`] so the
/// cache and the store can be borrowed together.
struct MapInner {
    data: File,
    layout: TileLayout,
    codec: TileCodec,
    locations: Vec<TileLocation>,
    tile_lengths: Vec<u64>,
    range: FpRange,
    spill: Option<SpillFile>,
    evict_target: EvictTarget,
    mode: Mode,
}

impl MapInner {
    fn check_tile_index(&self, tile_index: usize) -> VoxResult<()> {
        if !self.layout.tile_index_in_range(tile_index) {
            return Err(VoxError::TileIndexOutOfRange(
                tile_index as i64,
                self.layout.n_tiles() as i64,
            ));
        }
        Ok(())
    }

    /// Appends one tile to the data file; at most once per index.
    fn write_tile(&mut self, tile_index: usize, buf: &[u8]) -> VoxResult<WriteOutcome> {
        self.check_tile_index(tile_index)?;
        if matches!(self.locations[tile_index], TileLocation::OnDisk(_)) {
            return Ok(WriteOutcome::Skipped);
        }
        let clip = self.layout.clipped_dimensions(tile_index);
        let live = extract_clipped(buf, &self.layout, &clip, self.codec.cell_type.bytes());
        update_range(&mut self.range, &live, self.codec.cell_type);
        let payload = self.codec.encode(&live)?;
        let offset = self.data.seek(SeekFrom::End(0))?;
        self.data.write_all(&payload)?;
        self.locations[tile_index] = TileLocation::OnDisk(offset);
        self.tile_lengths[tile_index] = payload.len() as u64;
        Ok(WriteOutcome::Written)
    }

    /// Reads a tile from the data file (or fills nulls for an absent one).
    fn read_tile(&mut self, tile_index: usize, buf: &mut [u8]) -> VoxResult<()> {
        self.check_tile_index(tile_index)?;
        let TileLocation::OnDisk(offset) = self.locations[tile_index] else {
            fill_null(buf, self.codec.cell_type);
            return Ok(());
        };
        let length = self.tile_lengths[tile_index] as usize;
        let mut payload = vec![0u8; length];
        self.data.seek(SeekFrom::Start(offset))?;
        self.data.read_exact(&mut payload)?;
        let clip = self.layout.clipped_dimensions(tile_index);
        let live = self.codec.decode(&payload, clip.cells() as usize)?;
        expand_clipped(&live, &self.layout, &clip, self.codec.cell_type, buf)
    }
}

impl TileStore for MapInner {
    fn load(&mut self, tile_index: usize, buf: &mut [u8]) -> VoxResult<()> {
        match self.locations[tile_index] {
            TileLocation::InSpill(pos) => {
                let spill = self.spill.as_mut().ok_or(VoxError::Poisoned)?;
                let moved = spill.take(pos, buf)?;
                self.locations[tile_index] = TileLocation::Absent;
                if let Some(moved_index) = moved {
                    self.locations[moved_index] = TileLocation::InSpill(pos);
                }
                Ok(())
            }
            _ => self.read_tile(tile_index, buf),
        }
    }

    fn evict(&mut self, tile_index: usize, buf: &[u8]) -> VoxResult<()> {
        if self.mode == Mode::Read {
            return Ok(());
        }
        match self.evict_target {
            EvictTarget::DataFile => self.write_tile(tile_index, buf).map(|_| ()),
            EvictTarget::Spill => {
                if self.locations[tile_index] != TileLocation::Absent {
                    return Ok(());
                }
                let spill = self.spill.as_mut().ok_or(VoxError::Poisoned)?;
                let pos = spill.append(tile_index, buf)?;
                self.locations[tile_index] = TileLocation::InSpill(pos);
                Ok(())
            }
        }
    }
}

/// One open volume.
pub struct Map {
    dir: PathBuf,
    meta: VolumeMeta,
    inner: MapInner,
    cache: TileCache,
    window: Window,
    resampler: ResamplerHandle,
    mask: Option<Box<Map>>,
    mask_on: bool,
    temp: Option<NamedTempFile>,
    poisoned: bool,
}

impl Map {
    /// Creates a volume for writing. The data lands in a temp file inside
    /// `dir` until [`Map::close`] renames it into place.
    pub fn open_new(dir: &Path, mut region: Region, config: &Config) -> VoxResult<Self> {
        region.adjust()?;
        std::fs::create_dir_all(dir)?;

        let meta = VolumeMeta {
            region: region.clone(),
            cell_type: config.cell_type,
            compressed: config.compress,
            precision: config.precision,
            xdr: true,
            tile_x: config.tile_x,
            tile_y: config.tile_y,
            tile_z: config.tile_z,
            has_index: true,
        };
        let layout = TileLayout::new(&region, meta.tile_x, meta.tile_y, meta.tile_z)?;
        let codec = TileCodec {
            cell_type: meta.cell_type,
            compressed: meta.compressed,
            precision: meta.precision,
            xdr: meta.xdr,
        };

        let temp = NamedTempFile::new_in(dir)?;
        let mut data = temp.as_file().try_clone()?;
        DataHeader::placeholder().write_to(&mut data)?;

        let n_tiles = layout.n_tiles();
        let tile_bytes = layout.tile_size() * codec.cell_type.bytes();
        let spill = SpillFile::create_in(dir, tile_bytes)?;
        let cache = TileCache::new(config.cache_slots(tile_bytes), tile_bytes, n_tiles);

        Ok(Self {
            dir: dir.to_path_buf(),
            window: region,
            meta,
            inner: MapInner {
                data,
                layout,
                codec,
                locations: vec![TileLocation::Absent; n_tiles],
                tile_lengths: vec![0; n_tiles],
                range: FpRange::default(),
                spill: Some(spill),
                evict_target: EvictTarget::Spill,
                mode: Mode::Write,
            },
            cache,
            resampler: std::rc::Rc::new(NearestNeighbor),
            mask: None,
            mask_on: false,
            temp: Some(temp),
            poisoned: false,
        })
    }

    /// Opens a volume for reading against a query window (the region
    /// itself when `None`).
    pub fn open_old(dir: &Path, window: Option<Window>, config: &Config) -> VoxResult<Self> {
        let meta = VolumeMeta::read_from(dir)?;
        meta.region.validate()?;
        if meta.region.version > crate::region::REGION_VERSION {
            return Err(VoxError::UnsupportedVersion(meta.region.version));
        }
        let window = match window {
            Some(w) => {
                if !meta.region.compatible_with(&w) {
                    return Err(VoxError::ProjectionMismatch { path: dir.to_path_buf() });
                }
                w
            }
            None => meta.region.clone(),
        };

        let layout = TileLayout::new(&meta.region, meta.tile_x, meta.tile_y, meta.tile_z)?;
        let codec = TileCodec {
            cell_type: meta.cell_type,
            compressed: meta.compressed,
            precision: meta.precision,
            xdr: meta.xdr,
        };
        let mut data = File::open(cell_path(dir))?;
        let (locations, tile_lengths) = if meta.has_index {
            read_index(&mut data, &layout)?
        } else {
            sequential_index(&layout, &codec)
        };

        let tile_bytes = layout.tile_size() * codec.cell_type.bytes();
        let cache = TileCache::new(config.cache_slots(tile_bytes), tile_bytes, layout.n_tiles());

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            inner: MapInner {
                data,
                layout,
                codec,
                locations,
                tile_lengths,
                range: FpRange::default(),
                spill: None,
                evict_target: EvictTarget::DataFile,
                mode: Mode::Read,
            },
            cache,
            window,
            resampler: std::rc::Rc::new(NearestNeighbor),
            mask: None,
            mask_on: false,
            temp: None,
            poisoned: false,
        })
    }

    /// The on-disk geometry.
    #[must_use]
    pub fn region(&self) -> &Region {
        &self.meta.region
    }

    /// The current query geometry.
    #[must_use]
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// The tiling of the region.
    #[must_use]
    pub fn layout(&self) -> &TileLayout {
        &self.inner.layout
    }

    /// On-disk cell width.
    #[must_use]
    pub fn cell_type(&self) -> CellType {
        self.meta.cell_type
    }

    /// Min/max of the non-null cells written so far.
    #[must_use]
    pub fn range(&self) -> Option<(f64, f64)> {
        self.inner.range.get()
    }

    /// Replaces the window→region resampler.
    pub fn set_resampler(&mut self, resampler: std::rc::Rc<dyn Resampler>) {
        self.resampler = resampler;
    }

    fn check_writable(&self) -> VoxResult<()> {
        if self.poisoned {
            return Err(VoxError::Poisoned);
        }
        if self.inner.mode != Mode::Write {
            return Err(VoxError::ReadOnly);
        }
        Ok(())
    }

    fn poison_on_err<T>(&mut self, result: VoxResult<T>) -> VoxResult<T> {
        if let Err(VoxError::Io(_)) = &result {
            error!("map <{}> failed; entering read-only state", self.dir.display());
            self.poisoned = true;
        }
        result
    }

    /// Direct tile write, bypassing the cache. At most once per tile.
    pub fn write_tile(&mut self, tile_index: usize, buf: &[u8]) -> VoxResult<WriteOutcome> {
        self.check_writable()?;
        let result = self.inner.write_tile(tile_index, buf);
        self.poison_on_err(result)
    }

    /// Direct tile read into `buf`, bypassing the cache.
    pub fn read_tile(&mut self, tile_index: usize, buf: &mut [u8]) -> VoxResult<()> {
        self.inner.read_tile(tile_index, buf)
    }

    /// Ensures a tile is cached and returns its buffer.
    pub fn tile_ptr(&mut self, tile_index: usize) -> VoxResult<&mut [u8]> {
        self.inner.check_tile_index(tile_index)?;
        if self.poisoned {
            return Err(VoxError::Poisoned);
        }
        self.cache.elt_ptr(tile_index, &mut self.inner)
    }

    /// Pins a tile in the cache.
    pub fn lock_tile(&mut self, tile_index: usize) -> VoxResult<LockOutcome> {
        self.cache.lock(tile_index)
    }

    /// Releases a pinned tile.
    pub fn unlock_tile(&mut self, tile_index: usize) -> VoxResult<()> {
        self.cache.unlock(tile_index)
    }

    fn cell_at(&mut self, x: i32, y: i32, z: i32) -> VoxResult<f64> {
        if !self.inner.layout.coord_in_range(x, y, z) {
            return Err(VoxError::CoordOutOfRange(x, y, z));
        }
        let (tile_index, offset) = self.inner.layout.coord_to_tile_index(x, y, z);
        let cell_type = self.inner.codec.cell_type;
        let buf = self.tile_ptr(tile_index)?;
        Ok(match cell_type {
            CellType::Float => {
                let raw: [u8; 4] = buf[offset * 4..offset * 4 + 4]
                    .try_into()
                    .map_err(|_| VoxError::InvalidHeader)?;
                let v = f32::from_ne_bytes(raw);
                if crate::codec::is_null_f32(v) { null_f64() } else { f64::from(v) }
            }
            CellType::Double => {
                let raw: [u8; 8] = buf[offset * 8..offset * 8 + 8]
                    .try_into()
                    .map_err(|_| VoxError::InvalidHeader)?;
                let v = f64::from_ne_bytes(raw);
                if crate::codec::is_null_f64(v) { null_f64() } else { v }
            }
        })
    }

    /// Region-relative read. Nulls come back as the f64 sentinel.
    pub fn get_f64(&mut self, x: i32, y: i32, z: i32) -> VoxResult<f64> {
        self.cell_at(x, y, z)
    }

    /// Region-relative read, narrowed to f32 with null preservation.
    pub fn get_f32(&mut self, x: i32, y: i32, z: i32) -> VoxResult<f32> {
        let v = self.cell_at(x, y, z)?;
        Ok(if is_null_f64(v) { null_f32() } else { v as f32 })
    }

    /// Region-relative write through the cache.
    pub fn put_f64(&mut self, x: i32, y: i32, z: i32, value: f64) -> VoxResult<()> {
        self.check_writable()?;
        if !self.inner.layout.coord_in_range(x, y, z) {
            return Err(VoxError::CoordOutOfRange(x, y, z));
        }
        let (tile_index, offset) = self.inner.layout.coord_to_tile_index(x, y, z);
        let cell_type = self.inner.codec.cell_type;
        let result = self.tile_ptr(tile_index).map(|buf| match cell_type {
            CellType::Float => {
                let v = if is_null_f64(value) { null_f32() } else { value as f32 };
                buf[offset * 4..offset * 4 + 4].copy_from_slice(&v.to_ne_bytes());
            }
            CellType::Double => {
                buf[offset * 8..offset * 8 + 8].copy_from_slice(&value.to_ne_bytes());
            }
        });
        self.poison_on_err(result)
    }

    /// See [`Map::put_f64`].
    pub fn put_f32(&mut self, x: i32, y: i32, z: i32, value: f32) -> VoxResult<()> {
        let wide = if crate::codec::is_null_f32(value) { null_f64() } else { f64::from(value) };
        self.put_f64(x, y, z, wide)
    }

    /// Window-relative read through the resampler, mask applied when on.
    pub fn get_window_f64(&mut self, x: i32, y: i32, z: i32) -> VoxResult<f64> {
        let resampler = self.resampler.clone();
        let window = self.window.clone();
        let value = resampler.sample(self, &window, x, y, z)?;
        if !self.mask_on || is_null_f64(value) {
            return Ok(value);
        }
        // The mask resamples via its own region but our window geometry.
        let Some(mask) = self.mask.as_mut() else { return Ok(value) };
        let mask_resampler = mask.resampler.clone();
        let masked = mask_resampler.sample(mask, &window, x, y, z)?;
        Ok(if is_null_f64(masked) { null_f64() } else { value })
    }

    /// Enables the mapset's mask volume for this map. A missing mask
    /// volume is not an error; the mask simply stays off.
    pub fn mask_on(&mut self, config: &Config) -> VoxResult<bool> {
        if self.mask.is_none() {
            let Some(parent) = self.dir.parent() else {
                return Ok(false);
            };
            let mask_dir = parent.join(MASK_ELEMENT);
            if !mask_dir.join(crate::header::HEADER_ELEMENT).exists() {
                warn!("no mask volume in <{}>", parent.display());
                return Ok(false);
            }
            self.mask = Some(Box::new(Map::open_old(&mask_dir, None, config)?));
        }
        self.mask_on = true;
        Ok(true)
    }

    /// Disables the mask without discarding it.
    pub fn mask_off(&mut self) {
        self.mask_on = false;
    }

    /// Whether the mask is currently applied.
    #[must_use]
    pub fn is_mask_on(&self) -> bool {
        self.mask_on
    }

    /// Writes out every cached tile whose tile coordinates fall inside the
    /// given cube (inclusive), freeing their slots.
    pub fn flush_tile_cube(
        &mut self,
        t0: (i32, i32, i32),
        t1: (i32, i32, i32),
    ) -> VoxResult<()> {
        self.check_writable()?;
        for tz in t0.2..=t1.2 {
            for ty in t0.1..=t1.1 {
                for tx in t0.0..=t1.0 {
                    if !self.inner.layout.tile_in_range(tx, ty, tz) {
                        continue;
                    }
                    let idx = self.inner.layout.tile_to_index(tx, ty, tz);
                    // Pull the tile in (null-filled if never touched),
                    // write it to its final place, free the slot.
                    let staged = self.cache.elt_ptr(idx, &mut self.inner).map(|buf| buf.to_vec());
                    let result = staged
                        .and_then(|buf| self.inner.write_tile(idx, &buf))
                        .and_then(|_| self.cache.remove(idx));
                    self.poison_on_err(result)?;
                }
            }
        }
        Ok(())
    }

    /// Writes out the tiles whose cells are entirely inside the
    /// cell-coordinate cube `(c0, c1)` (inclusive).
    pub fn flush_cells_in_cube(
        &mut self,
        c0: (i32, i32, i32),
        c1: (i32, i32, i32),
    ) -> VoxResult<()> {
        let l = &self.inner.layout;
        let clamp = |v: i32, hi: i32| v.clamp(0, hi - 1);
        let lo = (clamp(c0.0, l.cols), clamp(c0.1, l.rows), clamp(c0.2, l.depths));
        let hi = (clamp(c1.0, l.cols), clamp(c1.1, l.rows), clamp(c1.2, l.depths));
        let (tx0, ty0, tz0, ox, oy, oz) = l.coord_to_tile(lo.0, lo.1, lo.2);
        let t0 = (
            tx0 + i32::from(ox != 0),
            ty0 + i32::from(oy != 0),
            tz0 + i32::from(oz != 0),
        );
        let (tx1, ty1, tz1, _, _, _) = l.coord_to_tile(hi.0 + 1, hi.1 + 1, hi.2 + 1);
        self.flush_tile_cube(t0, (tx1 - 1, ty1 - 1, tz1 - 1))
    }

    fn close_write(mut self) -> VoxResult<()> {
        // From here on evictions go to their final place.
        self.inner.evict_target = EvictTarget::DataFile;

        // Drain the spill file: load pulls the record out of the spill,
        // flush writes it to the data file.
        while self.inner.spill.as_ref().is_some_and(|s| s.last_pos >= 0) {
            let spill = self.inner.spill.as_mut().ok_or(VoxError::Poisoned)?;
            let last = spill.last_pos as u64;
            let tile_index = spill.read_index_at(last)?;
            self.cache.load(tile_index, &mut self.inner)?;
            self.cache.flush(tile_index, &mut self.inner)?;
        }
        self.cache.flush_all(&mut self.inner)?;

        // Append the packed index. Absent tiles are offset -1 on disk;
        // any tile still in the spill at this point is a drain bug.
        let offsets: Vec<i64> = self
            .inner
            .locations
            .iter()
            .map(|loc| match loc {
                TileLocation::OnDisk(off) => Ok(*off as i64),
                TileLocation::Absent => Ok(-1),
                TileLocation::InSpill(_) => Err(VoxError::Poisoned),
            })
            .collect::<VoxResult<_>>()?;
        let nbytes = long_nbytes(&offsets);
        let packed = long_encode(&offsets, nbytes)?;
        let index_offset = self.inner.data.seek(SeekFrom::End(0))?;
        self.inner.data.write_all(&packed)?;

        let header = DataHeader {
            index_long_nbytes: 8,
            index_nbytes_used: nbytes as i32,
            index_offset: index_offset as i64,
        };
        header.rewrite(&mut self.inner.data)?;
        self.inner.data.sync_all()?;

        // Atomic rename of the temp file into its final place, with a
        // hardlink+remove fallback.
        let temp = self.temp.take().ok_or(VoxError::Poisoned)?;
        let target = cell_path(&self.dir);
        if let Err(persist_err) = temp.persist(&target) {
            let temp = persist_err.file;
            let temp_path = temp.path().to_path_buf();
            std::fs::hard_link(&temp_path, &target)?;
            drop(temp);
        }

        self.meta.write_to(&self.dir)?;
        self.inner.range.write_to(&self.dir)?;
        let command: Vec<String> = std::env::args().collect();
        append_history(&self.dir, &command.join(" "))?;
        Ok(())
    }

    /// Closes the map. For a write map this performs the final flush,
    /// index append, header rewrite and rename; on error the temp file is
    /// left in place for the caller.
    pub fn close(mut self) -> VoxResult<()> {
        match self.inner.mode {
            Mode::Read => Ok(()),
            Mode::Write => {
                if self.poisoned {
                    if let Some(temp) = self.temp.take() {
                        let kept = temp.keep();
                        if let Ok((_, path)) = kept {
                            warn!("leaving temp file <{}> behind", path.display());
                        }
                    }
                    return Err(VoxError::Poisoned);
                }
                let dir = self.dir.clone();
                self.close_write().inspect_err(|e| {
                    error!("closing <{}> failed: {e}", dir.display());
                })
            }
        }
    }
}

/// Loads and decodes the packed index table of a read map, deriving tile
/// lengths from the offsets sorted in file order.
fn read_index(data: &mut File, layout: &TileLayout) -> VoxResult<(Vec<TileLocation>, Vec<u64>)> {
    data.seek(SeekFrom::Start(0))?;
    let header = DataHeader::read_from(data)?;
    let n_tiles = layout.n_tiles();
    let nbytes = header.index_nbytes_used as usize;
    if header.index_offset < DATA_HEADER_LEN as i64 || nbytes == 0 || nbytes > 8 {
        return Err(VoxError::InvalidHeader);
    }

    let mut packed = vec![0u8; n_tiles * nbytes];
    data.seek(SeekFrom::Start(header.index_offset as u64))?;
    data.read_exact(&mut packed)?;
    let offsets = long_decode(&packed, nbytes)?;

    let locations: Vec<TileLocation> = offsets
        .iter()
        .map(|&off| match off {
            -1 => Ok(TileLocation::Absent),
            off if off >= 0 => Ok(TileLocation::OnDisk(off as u64)),
            _ => Err(VoxError::InvalidHeader),
        })
        .collect::<VoxResult<_>>()?;

    // Sort the present tiles by offset; each one ends where the next
    // begins, the last one ends at the index table.
    let mut present: Vec<(u64, usize)> = locations
        .iter()
        .enumerate()
        .filter_map(|(i, loc)| match loc {
            TileLocation::OnDisk(off) => Some((*off, i)),
            _ => None,
        })
        .collect();
    present.sort_unstable();

    let mut lengths = vec![0u64; n_tiles];
    for k in 0..present.len() {
        let (off, idx) = present[k];
        let end =
            if k + 1 < present.len() { present[k + 1].0 } else { header.index_offset as u64 };
        if end < off {
            return Err(VoxError::InvalidHeader);
        }
        lengths[idx] = end - off;
    }
    Ok((locations, lengths))
}

/// Legacy volumes without an index table: uncompressed tiles stored back
/// to back in tile-index order.
fn sequential_index(layout: &TileLayout, codec: &TileCodec) -> (Vec<TileLocation>, Vec<u64>) {
    let cell_size = codec.cell_type.bytes();
    let mut offset = DATA_HEADER_LEN;
    let mut locations = Vec::with_capacity(layout.n_tiles());
    let mut lengths = Vec::with_capacity(layout.n_tiles());
    for i in 0..layout.n_tiles() {
        let payload = 1 + layout.clipped_dimensions(i).cells() as u64 * cell_size as u64;
        locations.push(TileLocation::OnDisk(offset));
        lengths.push(payload);
        offset += payload;
    }
    (locations, lengths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::is_null_f32;
    use crate::region::unit_region;

    fn test_config() -> Config {
        Config { cache_size: 4, ..Config::default() }
    }

    fn small_config(cell_type: CellType) -> Config {
        Config {
            cache_size: 2,
            cell_type,
            tile_x: 4,
            tile_y: 4,
            tile_z: 2,
            ..Config::default()
        }
    }

    #[test]
    fn single_cell_volume_roundtrips_with_range() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = Config { tile_x: 1, tile_y: 1, tile_z: 1, ..test_config() };

        let mut map = Map::open_new(&dir, unit_region(1, 1, 1), &config).unwrap();
        map.put_f64(0, 0, 0, 3.5).unwrap();
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        assert_eq!(map.get_f64(0, 0, 0).unwrap(), 3.5);
        let range = FpRange::read_from(&dir).unwrap();
        assert_eq!(range.get(), Some((3.5, 3.5)));
    }

    #[test]
    fn full_volume_roundtrip_compressed_f32() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);
        let region = unit_region(6, 7, 3);

        let value = |x: i32, y: i32, z: i32| {
            if (x + y + z) % 10 == 0 {
                f64::from_bits(u64::MAX)
            } else {
                f64::from(x * 100 + y * 10 + z)
            }
        };

        let mut map = Map::open_new(&dir, region.clone(), &config).unwrap();
        for z in 0..3 {
            for y in 0..6 {
                for x in 0..7 {
                    map.put_f64(x, y, z, value(x, y, z)).unwrap();
                }
            }
        }
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        for z in 0..3 {
            for y in 0..6 {
                for x in 0..7 {
                    let expect = value(x, y, z);
                    let got = map.get_f64(x, y, z).unwrap();
                    if is_null_f64(expect) {
                        assert!(is_null_f64(got), "({x},{y},{z}) lost its null");
                    } else {
                        assert_eq!(got, expect, "({x},{y},{z})");
                    }
                }
            }
        }
    }

    #[test]
    fn compressed_cube_roundtrips_at_precision_8() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = Config {
            cell_type: CellType::Float,
            compress: true,
            precision: 8,
            cache_size: 8,
            ..Config::default()
        };
        let region = unit_region(16, 16, 16);

        // Deterministic uniforms with ~10% nulls.
        let mut state = 0x1234_5678u32;
        let mut value = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            if state % 10 == 0 {
                f64::from_bits(u64::MAX)
            } else {
                f64::from(state >> 8) / f64::from(1u32 << 24)
            }
        };

        let mut expect = Vec::new();
        let mut map = Map::open_new(&dir, region, &config).unwrap();
        for z in 0..16 {
            for y in 0..16 {
                for x in 0..16 {
                    let v = value();
                    expect.push(v);
                    map.put_f64(x, y, z, v).unwrap();
                }
            }
        }
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        let mut cursor = 0;
        for z in 0..16 {
            for y in 0..16 {
                for x in 0..16 {
                    let want = expect[cursor];
                    cursor += 1;
                    let got = map.get_f64(x, y, z).unwrap();
                    if is_null_f64(want) {
                        assert!(is_null_f64(got));
                    } else {
                        let truncated =
                            crate::fpcompress::truncate_f32(want as f32, 8);
                        assert_eq!(got as f32, truncated, "cell ({x},{y},{z})");
                    }
                }
            }
        }

        // Strictly smaller than the uncompressed payload.
        let file_len = std::fs::metadata(cell_path(&dir)).unwrap().len();
        assert!(file_len < 16 * 16 * 16 * 4, "compressed file is {file_len} bytes");
    }

    #[test]
    fn spill_file_handles_more_tiles_than_slots() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        // 2 cache slots, 12 tiles: most writes must ride the spill file.
        let config = small_config(CellType::Double);
        let region = unit_region(8, 8, 4);

        let mut map = Map::open_new(&dir, region, &config).unwrap();
        for z in 0..4 {
            for y in 0..8 {
                for x in 0..8 {
                    map.put_f64(x, y, z, f64::from(x + y * 8 + z * 64)).unwrap();
                }
            }
        }
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        for z in 0..4 {
            for y in 0..8 {
                for x in 0..8 {
                    assert_eq!(map.get_f64(x, y, z).unwrap(), f64::from(x + y * 8 + z * 64));
                }
            }
        }
    }

    #[test]
    fn revisiting_a_spilled_tile_reads_it_back() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Double);
        let region = unit_region(8, 8, 4);

        let mut map = Map::open_new(&dir, region, &config).unwrap();
        // Touch many tiles, then come back to the first one.
        for z in 0..4 {
            map.put_f64(0, 0, z * 2, 1.0).unwrap();
        }
        map.put_f64(1, 1, 0, 2.0).unwrap();
        assert_eq!(map.get_f64(0, 0, 0).unwrap(), 1.0);
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        assert_eq!(map.get_f64(1, 1, 0).unwrap(), 2.0);
    }

    #[test]
    fn unwritten_tiles_read_as_null() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);

        let mut map = Map::open_new(&dir, unit_region(8, 8, 2), &config).unwrap();
        map.put_f64(0, 0, 0, 5.0).unwrap();
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        assert_eq!(map.get_f64(0, 0, 0).unwrap(), 5.0);
        assert!(is_null_f64(map.get_f64(7, 7, 1).unwrap()));
        assert!(is_null_f32(map.get_f32(7, 7, 1).unwrap()));
    }

    #[test]
    fn second_tile_write_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);
        let mut map = Map::open_new(&dir, unit_region(4, 4, 2), &config).unwrap();

        let tile_bytes = map.layout().tile_size() * 4;
        let buf = vec![0u8; tile_bytes];
        assert_eq!(map.write_tile(0, &buf).unwrap(), WriteOutcome::Written);
        assert_eq!(map.write_tile(0, &buf).unwrap(), WriteOutcome::Skipped);
    }

    #[test]
    fn write_map_rejects_reads_of_bad_coords() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);
        let mut map = Map::open_new(&dir, unit_region(4, 4, 2), &config).unwrap();
        assert!(matches!(
            map.get_f64(99, 0, 0),
            Err(VoxError::CoordOutOfRange(99, 0, 0))
        ));
        assert!(matches!(map.put_f64(0, -1, 0, 1.0), Err(VoxError::CoordOutOfRange(0, -1, 0))));
    }

    #[test]
    fn read_map_refuses_writes() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);
        let mut map = Map::open_new(&dir, unit_region(2, 2, 1), &config).unwrap();
        map.put_f64(0, 0, 0, 1.0).unwrap();
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        assert!(matches!(map.put_f64(0, 0, 0, 2.0), Err(VoxError::ReadOnly)));
    }

    #[test]
    fn projection_mismatch_is_fatal_configuration() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);
        let map = Map::open_new(&dir, unit_region(2, 2, 1), &config).unwrap();
        map.close().unwrap();

        let mut window = unit_region(2, 2, 1);
        window.proj = 99;
        assert!(matches!(
            Map::open_old(&dir, Some(window), &config),
            Err(VoxError::ProjectionMismatch { .. })
        ));
    }

    #[test]
    fn window_query_resamples_nearest() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Double);
        let region = unit_region(4, 4, 1);

        let mut map = Map::open_new(&dir, region.clone(), &config).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                map.put_f64(x, y, 0, f64::from(y * 4 + x)).unwrap();
            }
        }
        map.close().unwrap();

        // A half-resolution window: each window cell covers 2x2 region cells.
        let mut window = region.clone();
        window.rows = 2;
        window.cols = 2;
        window.adjust().unwrap();
        let mut map = Map::open_old(&dir, Some(window), &config).unwrap();
        // Window cell (0,0) centre lands in region cell (1,1) -> 5.
        assert_eq!(map.get_window_f64(0, 0, 0).unwrap(), 5.0);
        assert_eq!(map.get_window_f64(1, 1, 0).unwrap(), 15.0);
    }

    #[test]
    fn mask_coerces_values_to_null() {
        let root = tempfile::tempdir().unwrap();
        let mapset = root.path().join("mapset");
        let config = small_config(CellType::Double);
        let region = unit_region(2, 2, 1);

        // The mask volume: null at (1,0), real elsewhere.
        let mut mask = Map::open_new(&mapset.join(MASK_ELEMENT), region.clone(), &config).unwrap();
        mask.put_f64(0, 0, 0, 1.0).unwrap();
        mask.put_f64(1, 1, 0, 1.0).unwrap();
        mask.put_f64(0, 1, 0, 1.0).unwrap();
        mask.close().unwrap();

        let dir = mapset.join("v");
        let mut map = Map::open_new(&dir, region, &config).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                map.put_f64(x, y, 0, 7.0).unwrap();
            }
        }
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        assert!(map.mask_on(&config).unwrap());
        assert_eq!(map.get_window_f64(0, 0, 0).unwrap(), 7.0);
        assert!(is_null_f64(map.get_window_f64(1, 0, 0).unwrap()));

        map.mask_off();
        assert_eq!(map.get_window_f64(1, 0, 0).unwrap(), 7.0);
    }

    #[test]
    fn flush_cells_in_cube_persists_interior_tiles() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("v");
        let config = small_config(CellType::Float);
        let mut map = Map::open_new(&dir, unit_region(8, 8, 4), &config).unwrap();
        map.put_f64(0, 0, 0, 1.5).unwrap();
        // Flush the first tile (cells 0..4 x 0..4 x 0..2) to the data file.
        map.flush_cells_in_cube((0, 0, 0), (3, 3, 1)).unwrap();
        map.close().unwrap();

        let mut map = Map::open_old(&dir, None, &config).unwrap();
        assert_eq!(map.get_f64(0, 0, 0).unwrap(), 1.5);
    }
}
