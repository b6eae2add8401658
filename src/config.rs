//! Process-wide defaults.
//!
//! The engine keeps no global mutable state: a [`Config`] is built once at
//! startup (usually via [`Config::from_env`]), optionally tweaked through
//! the consuming setters, and then passed by reference into every map
//! constructor and pipeline entry point. Opened maps never expose setters.

use std::env;
use std::path::PathBuf;

use log::warn;

use crate::error::{VoxError, VoxResult};
use crate::header::CellType;

/// Environment variable naming the directory for all external-memory spill
/// files. Mandatory for the flow pipeline and the stream toolkit.
pub const STREAM_TMPDIR: &str = "STREAM_TMPDIR";

const COMPRESSION_YES: &str = "RASTER3D_USE_COMPRESSION";
const COMPRESSION_NO: &str = "RASTER3D_NO_COMPRESSION";
const PRECISION: &str = "RASTER3D_PRECISION";
const PRECISION_MAX: &str = "RASTER3D_MAX_PRECISION";
const CACHE_SIZE: &str = "RASTER3D_DEFAULT_CACHE_SIZE";
const CACHE_SIZE_MAX: &str = "RASTER3D_MAX_CACHE_SIZE";
const WRITE_FLOAT: &str = "RASTER3D_WRITE_FLOAT";
const WRITE_DOUBLE: &str = "RASTER3D_WRITE_DOUBLE";
const TILE_DIM_X: &str = "RASTER3D_TILE_DIMENSION_X";
const TILE_DIM_Y: &str = "RASTER3D_TILE_DIMENSION_Y";
const TILE_DIM_Z: &str = "RASTER3D_TILE_DIMENSION_Z";
const DEFAULT_WINDOW3D: &str = "RASTER3D_DEFAULT_WINDOW3D";

/// What happens when a single allocation would exceed the soft memory cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    /// Log a warning and allocate anyway.
    #[default]
    WarnMemoryLimit,
    /// Refuse the allocation.
    Fail,
    /// Allocate silently.
    Ignore,
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Compress tile payloads by default.
    pub compress: bool,
    /// Mantissa bits kept under compression, `-1` = all.
    pub precision: i32,
    /// Default on-disk cell width.
    pub cell_type: CellType,
    /// Default tile cells west-east.
    pub tile_x: i32,
    /// Default tile cells north-south.
    pub tile_y: i32,
    /// Default tile cells bottom-top.
    pub tile_z: i32,
    /// Cache capacity in tiles.
    pub cache_size: usize,
    /// Upper bound on cache memory in bytes; wins over `cache_size`.
    pub cache_max_bytes: usize,
    /// Soft cap consulted by the external-memory structures.
    pub memory_limit: usize,
    /// What happens when an allocation would exceed the cap.
    pub memory_mode: MemoryMode,
    /// Spill directory; `None` means the pipeline cannot run.
    pub tmp_dir: Option<PathBuf>,
    /// Window file name used when a caller supplies none.
    pub default_window: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compress: true,
            precision: -1,
            cell_type: CellType::Double,
            tile_x: 16,
            tile_y: 16,
            tile_z: 8,
            cache_size: 1000,
            cache_max_bytes: 16 << 20,
            memory_limit: 300 << 20,
            memory_mode: MemoryMode::default(),
            tmp_dir: None,
            default_window: None,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var_os(name).is_some()
}

fn env_int(name: &str) -> Option<i64> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {name}={raw}");
            None
        }
    }
}

impl Config {
    /// Builds the configuration from the `RASTER3D_*` and `STREAM_TMPDIR`
    /// environment variables, falling back to the defaults for anything
    /// unset.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if env_flag(COMPRESSION_YES) {
            cfg.compress = true;
        }
        if env_flag(COMPRESSION_NO) {
            cfg.compress = false;
        }
        if env_flag(PRECISION_MAX) {
            cfg.precision = -1;
        } else if let Some(p) = env_int(PRECISION) {
            cfg.precision = p as i32;
        }
        if let Some(n) = env_int(CACHE_SIZE) {
            cfg.cache_size = n.max(1) as usize;
        }
        if let Some(n) = env_int(CACHE_SIZE_MAX) {
            cfg.cache_max_bytes = n.max(1) as usize;
        }
        if env_flag(WRITE_FLOAT) {
            cfg.cell_type = CellType::Float;
        }
        if env_flag(WRITE_DOUBLE) {
            cfg.cell_type = CellType::Double;
        }
        for (var, dim) in [(TILE_DIM_X, 0), (TILE_DIM_Y, 1), (TILE_DIM_Z, 2)] {
            if let Some(n) = env_int(var) {
                if n > 0 {
                    match dim {
                        0 => cfg.tile_x = n as i32,
                        1 => cfg.tile_y = n as i32,
                        _ => cfg.tile_z = n as i32,
                    }
                } else {
                    warn!("ignoring non-positive {var}={n}");
                }
            }
        }
        cfg.tmp_dir = env::var_os(STREAM_TMPDIR).map(PathBuf::from);
        cfg.default_window = env::var(DEFAULT_WINDOW3D).ok();
        cfg
    }

    /// Consuming setter for the compression default.
    #[must_use]
    pub fn compress(mut self, on: bool) -> Self {
        self.compress = on;
        self
    }

    /// Consuming setter for the precision default.
    #[must_use]
    pub fn precision(mut self, bits: i32) -> Self {
        self.precision = bits;
        self
    }

    /// Consuming setter for the on-disk cell width.
    #[must_use]
    pub fn cell_type(mut self, cell_type: CellType) -> Self {
        self.cell_type = cell_type;
        self
    }

    /// Consuming setter for the default tile shape.
    #[must_use]
    pub fn tile_dimensions(mut self, x: i32, y: i32, z: i32) -> Self {
        self.tile_x = x;
        self.tile_y = y;
        self.tile_z = z;
        self
    }

    /// Consuming setter for the memory cap and its enforcement mode.
    #[must_use]
    pub fn memory(mut self, limit: usize, mode: MemoryMode) -> Self {
        self.memory_limit = limit;
        self.memory_mode = mode;
        self
    }

    /// Consuming setter for the spill directory.
    #[must_use]
    pub fn tmp_dir(mut self, dir: PathBuf) -> Self {
        self.tmp_dir = Some(dir);
        self
    }

    /// The spill directory, or the error a pipeline caller should see.
    pub fn stream_tmpdir(&self) -> VoxResult<&PathBuf> {
        self.tmp_dir.as_ref().ok_or(VoxError::MissingEnv(STREAM_TMPDIR))
    }

    /// Applies the memory policy to one prospective allocation.
    pub fn charge(&self, requested: usize) -> VoxResult<()> {
        if requested <= self.memory_limit {
            return Ok(());
        }
        match self.memory_mode {
            MemoryMode::Ignore => Ok(()),
            MemoryMode::WarnMemoryLimit => {
                warn!(
                    "allocation of {requested} bytes exceeds the memory limit of {} bytes",
                    self.memory_limit
                );
                Ok(())
            }
            MemoryMode::Fail => {
                Err(VoxError::MemoryLimit { limit: self.memory_limit, requested })
            }
        }
    }

    /// Cache slot count for a tile of `tile_bytes`, honoring both the tile
    /// count default and the byte cap.
    #[must_use]
    pub fn cache_slots(&self, tile_bytes: usize) -> usize {
        let by_bytes = (self.cache_max_bytes / tile_bytes.max(1)).max(1);
        self.cache_size.clamp(1, by_bytes)
    }
}
