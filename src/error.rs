use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the volume engine and the flow pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VoxError {
    /// An underlying file operation failed; short reads and writes land
    /// here too.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The data-file header fields are not what this crate writes.
    #[error("invalid volume header")]
    InvalidHeader,
    /// The volume was written by a newer format revision.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(i32),
    /// A region or window violates its shape invariants.
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    /// Tile dimensions must all be positive.
    #[error("invalid tile dimensions {0}x{1}x{2}")]
    InvalidTileDimensions(i32, i32, i32),
    /// A tile index outside `0..n_tiles`.
    #[error("tile index {0} out of range (0..{1})")]
    TileIndexOutOfRange(i64, i64),
    /// A cell coordinate outside the region.
    #[error("cell coordinate ({0}, {1}, {2}) out of range")]
    CoordOutOfRange(i32, i32, i32),
    /// A packed index entry that does not fit its byte width.
    #[error("packed offset does not fit in {0} bytes")]
    PackedLongOverflow(usize),
    /// A tile payload that cannot be decoded.
    #[error("tile payload is corrupt: {0}")]
    CorruptTile(String),
    /// The JSON metadata sidecar cannot be parsed.
    #[error("header sidecar is corrupt: {0}")]
    CorruptSidecar(#[from] serde_json::Error),
    /// A write was attempted on a map opened for reading.
    #[error("map is read-only")]
    ReadOnly,
    /// The map refused further work after an earlier I/O failure.
    #[error("map entered a failed state after an earlier I/O error")]
    Poisoned,
    /// The volume's projection identity does not match the caller's
    /// window.
    #[error("projection/zone of <{path}> does not match the current window")]
    ProjectionMismatch {
        /// Directory of the rejected volume.
        path: PathBuf,
    },
    /// Every cache slot is locked; nothing can be evicted.
    #[error("cache has no unlocked slot left")]
    CacheExhausted,
    /// A lock or unlock named a tile that is not cached.
    #[error("tile {0} is not resident in the cache")]
    NotInCache(usize),
    /// An allocation above the soft cap under the fail policy.
    #[error("memory limit of {limit} bytes exceeded by an allocation of {requested} bytes")]
    MemoryLimit {
        /// The configured soft cap.
        limit: usize,
        /// The size of the refused allocation.
        requested: usize,
    },
    /// A required environment variable is unset.
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    /// A stream was read or appended in the wrong phase.
    #[error("stream was not rewound before reading")]
    StreamNotRewound,
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// A reserved interface with no implementation yet.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

/// Convenience result alias for all fallible operations in this crate.
pub type VoxResult<T> = Result<T, VoxError>;
