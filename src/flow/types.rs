//! Scalar types and reserved values of the terrain pipeline.

/// Grid row/column index.
pub type Dim = i32;
/// Cell elevation.
pub type Elev = f32;
/// Watershed / connected-component label.
pub type Label = i32;
/// Direction bitfield; bit k set means neighbour k is downslope.
pub type Dir = i16;
/// BFS distance from a plateau's spill cells.
pub type Depth = i32;
/// Topological rank of a cell among equal elevations (negated depth).
pub type TopoRank = i32;
/// Accumulated flow.
pub type Accum = f32;

/// No label assigned yet.
pub const LABEL_UNDEF: Label = -1;
/// The outside watershed: cells draining off the grid edge.
pub const LABEL_BOUNDARY: Label = 0;
/// Interior nodata regions.
pub const LABEL_NODATA: Label = 1;

/// Direction not yet computed.
pub const DIRECTION_UNDEF: Dir = -1;

/// BFS depth of spill cells.
pub const DEPTH_INITIAL: Depth = 1;

/// Interior voids: cells with no data anywhere near the grid edge.
pub const ELEVATION_NODATA: Elev = -9999.0;
/// Nodata connected to the grid edge.
pub const ELEVATION_BOUNDARY: Elev = -9998.0;

// Direction bit values, clockwise from East:
//
//   32 64 128
//   16  *   1
//    8  4   2

/// East.
pub const DIR_E: Dir = 1;
/// South-east.
pub const DIR_SE: Dir = 2;
/// South.
pub const DIR_S: Dir = 4;
/// South-west.
pub const DIR_SW: Dir = 8;
/// West.
pub const DIR_W: Dir = 16;
/// North-west.
pub const DIR_NW: Dir = 32;
/// North.
pub const DIR_N: Dir = 64;
/// North-east.
pub const DIR_NE: Dir = 128;

/// Either nodata flavour.
#[must_use]
pub fn is_nodata(el: Elev) -> bool {
    el == ELEVATION_NODATA || el == ELEVATION_BOUNDARY
}

/// Interior nodata only.
#[must_use]
pub fn is_void(el: Elev) -> bool {
    el == ELEVATION_NODATA
}

/// Whether `(i, j)` lies on the outermost ring of the grid.
#[must_use]
pub fn is_grid_edge(i: Dim, j: Dim, nrows: Dim, ncols: Dim) -> bool {
    i == 0 || i == nrows - 1 || j == 0 || j == ncols - 1
}

/// Mints fresh labels. The pipeline relabels between phases, so this is a
/// value passed through the drivers rather than process state.
#[derive(Debug)]
pub struct LabelFactory {
    last: Label,
}

impl LabelFactory {
    /// Starts so that the first minted label is 2, after the reserved
    /// boundary and nodata labels.
    #[must_use]
    pub fn new() -> Self {
        Self { last: LABEL_NODATA }
    }

    /// Mints the next unused label.
    pub fn next(&mut self) -> Label {
        self.last += 1;
        self.last
    }

    /// Exclusive upper bound of all labels handed out so far.
    #[must_use]
    pub fn count(&self) -> Label {
        self.last + 1
    }

    /// Starts labeling over; the passes relabel between phases.
    pub fn reset(&mut self) {
        self.last = LABEL_NODATA;
    }
}

impl Default for LabelFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Neighbour offsets in window order: `(di, dj)` for linear index `k`,
/// row-major over the 3x3 window, centre included at k=4.
#[must_use]
pub fn neighbour_offset(k: usize) -> (Dim, Dim) {
    ((k as Dim) / 3 - 1, (k as Dim) % 3 - 1)
}

/// The direction bit pointing from a cell toward neighbour `(di, dj)`.
#[must_use]
pub fn direction_to(di: Dim, dj: Dim) -> Dir {
    match (di, dj) {
        (0, 1) => DIR_E,
        (1, 1) => DIR_SE,
        (1, 0) => DIR_S,
        (1, -1) => DIR_SW,
        (0, -1) => DIR_W,
        (-1, -1) => DIR_NW,
        (-1, 0) => DIR_N,
        (-1, 1) => DIR_NE,
        _ => 0,
    }
}

/// Whether `dir` has the bit toward neighbour `(di, dj)`.
#[must_use]
pub fn points_to(dir: Dir, di: Dim, dj: Dim) -> bool {
    dir > 0 && dir & direction_to(di, dj) != 0
}
