//! Watershed labeling: time-forward propagation of labels from local
//! minima up the drainage tree, and boundary-edge extraction from the
//! labeled grid.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};
use log::warn;

use super::types::{
    DEPTH_INITIAL, Depth, Dim, Dir, Elev, LABEL_BOUNDARY, LABEL_UNDEF, Label, LabelFactory,
    is_grid_edge, is_nodata, neighbour_offset, points_to,
};
use crate::config::Config;
use crate::error::VoxResult;
use crate::stream::{PQueue, Prioritized, Record, Stream, scan3, sort_stream};

/// Plateau cell after direction assignment, before the grid merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterItem {
    /// Grid row.
    pub i: Dim,
    /// Grid column.
    pub j: Dim,
    /// Assigned direction.
    pub dir: Dir,
    /// Depression label, or undefined for spilled plateaus.
    pub label: Label,
    /// BFS distance from the spill frontier.
    pub depth: Depth,
}

impl Record for WaterItem {
    const SIZE: usize = 18;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_i16(self.dir);
        buf.put_i32(self.label);
        buf.put_i32(self.depth);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            i: buf.get_i32(),
            j: buf.get_i32(),
            dir: buf.get_i16(),
            label: buf.get_i32(),
            depth: buf.get_i32(),
        }
    }
}

/// One cell of the merged elevation/direction/plateau grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterGridCell {
    /// Classified elevation.
    pub el: Elev,
    /// Flow direction.
    pub dir: Dir,
    /// Watershed label, if already known.
    pub label: Label,
    /// BFS distance from the plateau boundary.
    pub depth: Depth,
}

impl WaterGridCell {
    /// The scan padding token.
    #[must_use]
    pub fn nodata() -> Self {
        Self {
            el: super::types::ELEVATION_NODATA,
            dir: 0,
            label: LABEL_UNDEF,
            depth: DEPTH_INITIAL,
        }
    }
}

impl Record for WaterGridCell {
    const SIZE: usize = 14;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f32(self.el);
        buf.put_i16(self.dir);
        buf.put_i32(self.label);
        buf.put_i32(self.depth);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            el: buf.get_f32(),
            dir: buf.get_i16(),
            label: buf.get_i32(),
            depth: buf.get_i32(),
        }
    }
}

/// A labeled cell of the watershed grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelElev {
    /// Grid row.
    pub i: Dim,
    /// Grid column.
    pub j: Dim,
    /// Elevation.
    pub el: Elev,
    /// Watershed label.
    pub label: Label,
}

impl Record for LabelElev {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_f32(self.el);
        buf.put_i32(self.label);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self { i: buf.get_i32(), j: buf.get_i32(), el: buf.get_f32(), label: buf.get_i32() }
    }
}

/// An adjacency between two watersheds: the lowest common boundary
/// elevation decides when the depression filler merges them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    /// Grid row of the emitting cell.
    pub i: Dim,
    /// Grid column of the emitting cell.
    pub j: Dim,
    /// Spill elevation of this adjacency.
    pub el: Elev,
    /// The smaller label.
    pub label1: Label,
    /// The larger label.
    pub label2: Label,
}

impl Boundary {
    /// Normalizes so `label1 < label2`.
    #[must_use]
    pub fn new(i: Dim, j: Dim, el: Elev, a: Label, b: Label) -> Self {
        let (label1, label2) = if a < b { (a, b) } else { (b, a) };
        Self { i, j, el, label1, label2 }
    }
}

impl Record for Boundary {
    const SIZE: usize = 20;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_f32(self.el);
        buf.put_i32(self.label1);
        buf.put_i32(self.label2);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            i: buf.get_i32(),
            j: buf.get_i32(),
            el: buf.get_f32(),
            label1: buf.get_i32(),
            label2: buf.get_i32(),
        }
    }
}

/// Processing key of the watershed sweep: lower cells first, then cells
/// nearest their plateau boundary, then scan order.
#[derive(Debug, Clone, Copy)]
pub struct FillPriority {
    /// Elevation, ascending.
    pub el: Elev,
    /// BFS depth; plateau-boundary cells first.
    pub depth: Depth,
    /// Grid row tie-break.
    pub i: Dim,
    /// Grid column tie-break.
    pub j: Dim,
}

impl PartialEq for FillPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FillPriority {}

impl PartialOrd for FillPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FillPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.el
            .total_cmp(&other.el)
            .then(self.depth.cmp(&other.depth))
            .then(self.i.cmp(&other.i))
            .then(self.j.cmp(&other.j))
    }
}

/// A label proposal travelling up the drainage tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillProposal {
    /// Target cell elevation.
    pub el: Elev,
    /// Target cell BFS depth.
    pub depth: Depth,
    /// Target grid row.
    pub i: Dim,
    /// Target grid column.
    pub j: Dim,
    /// The label being proposed.
    pub label: Label,
}

impl Record for FillProposal {
    const SIZE: usize = 20;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f32(self.el);
        buf.put_i32(self.depth);
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_i32(self.label);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            el: buf.get_f32(),
            depth: buf.get_i32(),
            i: buf.get_i32(),
            j: buf.get_i32(),
            label: buf.get_i32(),
        }
    }
}

impl Prioritized for FillProposal {
    type Priority = FillPriority;

    fn priority(&self) -> FillPriority {
        FillPriority { el: self.el, depth: self.depth, i: self.i, j: self.j }
    }
}

/// One cell with its full 3x3 context, ready for the watershed sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterWindow {
    /// Grid row.
    pub i: Dim,
    /// Grid column.
    pub j: Dim,
    /// The centre cell's label, if already known.
    pub label: Label,
    /// The centre cell's direction.
    pub dir: Dir,
    /// The centre cell's BFS depth.
    pub depth: Depth,
    /// Elevations of the 3x3 neighbourhood.
    pub el: [Elev; 9],
    /// BFS depths of the 3x3 neighbourhood.
    pub depths: [Depth; 9],
    /// Bit `k` set when neighbour `k`'s direction points at this cell.
    pub drains_in: u16,
}

impl WaterWindow {
    /// Builds a window from the 3x3 neighbourhood of merged grid cells.
    #[must_use]
    pub fn from_cells(i: Dim, j: Dim, cells: &[[WaterGridCell; 3]; 3]) -> Self {
        let mut el = [0.0; 9];
        let mut depths = [DEPTH_INITIAL; 9];
        let mut drains_in = 0u16;
        for k in 0..9 {
            let (di, dj) = neighbour_offset(k);
            let cell = &cells[(di + 1) as usize][(dj + 1) as usize];
            el[k] = cell.el;
            depths[k] = cell.depth;
            if k != 4 && points_to(cell.dir, -di, -dj) {
                drains_in |= 1 << k;
            }
        }
        let center = &cells[1][1];
        Self { i, j, label: center.label, dir: center.dir, depth: center.depth, el, depths, drains_in }
    }

    /// The centre cell's elevation.
    #[must_use]
    pub fn elevation(&self) -> Elev {
        self.el[4]
    }

    /// Whether the neighbour at window index `k` drains into this cell.
    #[must_use]
    pub fn drains_from(&self, k: usize) -> bool {
        self.drains_in & (1 << k) != 0
    }

    /// The centre cell's processing key.
    #[must_use]
    pub fn priority(&self) -> FillPriority {
        FillPriority { el: self.el[4], depth: self.depth, i: self.i, j: self.j }
    }
}

impl Record for WaterWindow {
    const SIZE: usize = 18 + 36 + 36 + 2;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_i32(self.label);
        buf.put_i16(self.dir);
        buf.put_i32(self.depth);
        for v in self.el {
            buf.put_f32(v);
        }
        for v in self.depths {
            buf.put_i32(v);
        }
        buf.put_u16(self.drains_in);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let i = buf.get_i32();
        let j = buf.get_i32();
        let label = buf.get_i32();
        let dir = buf.get_i16();
        let depth = buf.get_i32();
        let mut el = [0.0; 9];
        for v in &mut el {
            *v = buf.get_f32();
        }
        let mut depths = [0; 9];
        for v in &mut depths {
            *v = buf.get_i32();
        }
        let drains_in = buf.get_u16();
        Self { i, j, label, dir, depth, el, depths, drains_in }
    }
}

/// Expands the merged water grid into per-cell windows.
pub fn create_water_windows(
    merged: &mut Stream<WaterGridCell>,
    nrows: Dim,
    ncols: Dim,
    config: &Config,
) -> VoxResult<Stream<WaterWindow>> {
    let dir = config.stream_tmpdir()?.clone();
    let mut out = Stream::new(&dir)?;
    scan3(merged, nrows, ncols, WaterGridCell::nodata(), |i, j, cells| {
        out.push(&WaterWindow::from_cells(i, j, cells))
    })?;
    Ok(out)
}

/// Output of the watershed sweep.
pub struct WatershedOutput {
    /// One labeled cell per grid cell, in sweep order.
    pub labeled: Stream<LabelElev>,
}

/// Pushes labels from local minima to their upslope neighbours.
///
/// Cells arrive sorted by [`FillPriority`]; every neighbour that drains
/// into the current cell is promised the current label at its own, always
/// strictly greater, priority. A proposal that would travel backward in
/// time is a bug in the direction grid and is dropped with a warning.
pub fn generate_watersheds(
    windows: Stream<WaterWindow>,
    nrows: Dim,
    ncols: Dim,
    labels: &mut LabelFactory,
    config: &Config,
) -> VoxResult<WatershedOutput> {
    let dir = config.stream_tmpdir()?.clone();
    let mut sorted = sort_stream(windows, &dir, config.memory_limit, |a, b| {
        a.priority().cmp(&b.priority())
    })?;
    let mut pq: PQueue<FillProposal> = PQueue::new(config)?;
    let mut labeled = Stream::new(&dir)?;

    sorted.rewind()?;
    while let Some(win) = sorted.next()? {
        let prio = win.priority();

        // Stale proposals mean a neighbour pushed to a cell that was
        // processed before it; the direction grid should make that
        // impossible.
        while let Some(p) = pq.min() {
            if p.priority() < prio {
                warn!(
                    "discarding stale watershed proposal at ({}, {})",
                    p.i, p.j
                );
                pq.extract_min()?;
            } else {
                break;
            }
        }

        let mut label = win.label;
        if pq.min().is_some_and(|p| p.priority() == prio) {
            for p in pq.extract_all_min()? {
                if label == LABEL_UNDEF {
                    label = p.label;
                }
            }
        }
        if label == LABEL_UNDEF && !is_nodata(win.elevation()) {
            label = if is_grid_edge(win.i, win.j, nrows, ncols) {
                LABEL_BOUNDARY
            } else {
                labels.next()
            };
        }

        if label != LABEL_UNDEF {
            for k in [0usize, 1, 2, 3, 5, 6, 7, 8] {
                if !win.drains_from(k) || is_nodata(win.el[k]) {
                    continue;
                }
                let (di, dj) = neighbour_offset(k);
                let proposal = FillProposal {
                    el: win.el[k],
                    depth: win.depths[k],
                    i: win.i + di,
                    j: win.j + dj,
                    label,
                };
                if proposal.priority() > prio {
                    pq.insert(proposal)?;
                } else {
                    warn!(
                        "watershed label for ({}, {}) would travel backward; dropped",
                        proposal.i, proposal.j
                    );
                }
            }
        }

        labeled.push(&LabelElev { i: win.i, j: win.j, el: win.elevation(), label })?;
    }

    Ok(WatershedOutput { labeled })
}

/// Emits one boundary edge per adjacent pair of differently-labeled
/// cells, and a `(label, BOUNDARY)` edge for every labeled grid-edge
/// cell. The input must be sorted by `(i, j)`.
pub fn find_boundaries(
    labeled: &mut Stream<LabelElev>,
    nrows: Dim,
    ncols: Dim,
    config: &Config,
) -> VoxResult<Stream<Boundary>> {
    let dir = config.stream_tmpdir()?.clone();
    let mut out = Stream::new(&dir)?;
    let nodata = LabelElev {
        i: -1,
        j: -1,
        el: super::types::ELEVATION_NODATA,
        label: LABEL_UNDEF,
    };
    scan3(labeled, nrows, ncols, nodata, |i, j, cells| {
        let point = &cells[1][1];
        if point.label == LABEL_UNDEF {
            return Ok(());
        }
        for row in cells {
            for n in row {
                if n.label != LABEL_UNDEF && n.label != point.label {
                    out.push(&Boundary::new(
                        i,
                        j,
                        point.el.max(n.el),
                        point.label,
                        n.label,
                    ))?;
                }
            }
        }
        if is_grid_edge(i, j, nrows, ncols) && point.label != LABEL_BOUNDARY {
            out.push(&Boundary::new(i, j, point.el, point.label, LABEL_BOUNDARY))?;
        }
        Ok(())
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::types::{DIR_E, DIR_N, ELEVATION_NODATA};
    use super::*;

    #[test]
    fn fill_priority_orders_el_then_depth_then_scan() {
        let p = |el, depth, i, j| FillPriority { el, depth, i, j };
        assert!(p(1.0, 5, 9, 9) < p(2.0, 1, 0, 0));
        assert!(p(1.0, 1, 9, 9) < p(1.0, 2, 0, 0));
        assert!(p(1.0, 1, 0, 9) < p(1.0, 1, 1, 0));
        assert!(p(1.0, 1, 0, 3) < p(1.0, 1, 0, 4));
        assert_eq!(p(1.0, 1, 0, 3), p(1.0, 1, 0, 3));
    }

    #[test]
    fn boundary_normalizes_label_order() {
        let b = Boundary::new(0, 0, 5.0, 7, 3);
        assert_eq!((b.label1, b.label2), (3, 7));
    }

    #[test]
    fn water_window_reads_inbound_drains() {
        let mut cells = [[WaterGridCell::nodata(); 3]; 3];
        for row in &mut cells {
            for c in row {
                c.el = 5.0;
                c.dir = 0;
            }
        }
        // West neighbour points east (at us), north neighbour points
        // north (away).
        cells[1][0].dir = DIR_E;
        cells[0][1].dir = DIR_N;
        let win = WaterWindow::from_cells(4, 4, &cells);
        assert!(win.drains_from(3));
        assert!(!win.drains_from(1));
        assert!(!win.drains_from(0));
    }

    #[test]
    fn watershed_window_roundtrips_through_record() {
        let mut cells = [[WaterGridCell::nodata(); 3]; 3];
        cells[1][1] = WaterGridCell { el: 3.5, dir: DIR_E, label: 7, depth: 2 };
        cells[2][2] = WaterGridCell { el: 9.0, dir: DIR_N, label: LABEL_UNDEF, depth: 1 };
        let win = WaterWindow::from_cells(1, 2, &cells);
        let mut buf = Vec::new();
        win.encode(&mut buf);
        assert_eq!(buf.len(), WaterWindow::SIZE);
        assert_eq!(WaterWindow::decode(&mut buf.as_slice()), win);
    }

    #[test]
    fn nodata_window_token_is_inert() {
        let cell = WaterGridCell::nodata();
        assert!(is_nodata(cell.el));
        assert_eq!(cell.label, LABEL_UNDEF);
    }

    #[test]
    fn nodata_label_elev_token() {
        let n = LabelElev { i: -1, j: -1, el: ELEVATION_NODATA, label: LABEL_UNDEF };
        assert_eq!(n.label, LABEL_UNDEF);
    }
}
