//! Tiled 3D raster volumes with an out-of-core cache, plus an
//! external-memory terrain flow pipeline.
//!
//! The crate has two tightly coupled halves sharing one numeric and I/O
//! substrate:
//!
//! * the **tile engine** ([`Map`]): tiled, optionally compressed volume
//!   files with an LRU+lock cache and a spill file for not-yet-final
//!   tiles;
//! * the **flow pipeline** ([`flow`]): nodata classification, plateau
//!   labeling, watershed extraction, depression filling and flow
//!   accumulation over grids far larger than memory, built on the
//!   [`stream`] toolkit.

pub mod cache;
pub mod codec;
pub mod config;
mod error;
pub mod flow;
pub mod fpcompress;
pub mod header;
pub mod map;
pub mod range;
pub mod region;
pub mod resample;
pub mod stream;
pub mod tileio;
pub mod tilemath;

pub use config::{Config, MemoryMode, STREAM_TMPDIR};
pub use error::{VoxError, VoxResult};
pub use header::{CellType, VolumeMeta};
pub use map::{Map, TileLocation, WriteOutcome};
pub use region::{Region, Window};
pub use resample::{NearestNeighbor, Resampler};
pub use tilemath::TileLayout;
