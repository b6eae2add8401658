//! In-memory BFS over one plateau's bounding box.
//!
//! A plateau that spills somewhere gets directions assigned layer by
//! layer from its spill cells inward, so every cell ends up pointing
//! (transitively) at a spill. A flat region that touches the grid edge
//! but spills nowhere drains off the grid instead: its edge cells are
//! seeded with the off-grid direction.

use std::collections::VecDeque;

use super::direction::{edge_direction, find_dominant};
use super::plateau::{Plateau, PlateauStats};
use super::types::{DEPTH_INITIAL, Depth, Dim, Dir, Label, is_grid_edge};
use super::water::WaterItem;
use crate::error::VoxResult;
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, Default)]
struct GridCell {
    dir: Dir,
    depth: Depth,
    valid: bool,
}

/// One plateau materialised as a dense grid, bbox padded by one cell.
pub struct PlateauGrid {
    cells: Vec<GridCell>,
    i_min: Dim,
    j_min: Dim,
    width: Dim,
    height: Dim,
    label: Label,
    size: i64,
}

impl PlateauGrid {
    /// An empty grid covering the plateau's bounding box plus a one-cell
    /// border.
    #[must_use]
    pub fn new(stats: &PlateauStats) -> Self {
        let i_min = stats.i_min - 1;
        let j_min = stats.j_min - 1;
        let width = stats.j_max - j_min + 2;
        let height = stats.i_max - i_min + 2;
        Self {
            cells: vec![GridCell::default(); (width * height) as usize],
            i_min,
            j_min,
            width,
            height,
            label: stats.label,
            size: stats.size,
        }
    }

    /// Bytes this grid occupies; checked against the soft memory cap
    /// before loading.
    #[must_use]
    pub fn bytes(stats: &PlateauStats) -> usize {
        let width = (stats.j_max - stats.j_min + 3) as usize;
        let height = (stats.i_max - stats.i_min + 3) as usize;
        width * height * size_of::<GridCell>()
    }

    fn at(&self, i: Dim, j: Dim) -> usize {
        debug_assert!(i > self.i_min - 1 && i - self.i_min < self.height);
        ((i - self.i_min) * self.width + (j - self.j_min)) as usize
    }

    /// Reads this plateau's records (they are next in the label-sorted
    /// stream) into the grid.
    pub fn load(&mut self, plateaus: &mut Stream<Plateau>) -> VoxResult<()> {
        for _ in 0..self.size {
            let Some(p) = plateaus.next()? else { break };
            debug_assert_eq!(p.label, self.label);
            let k = self.at(p.i, p.j);
            self.cells[k] = GridCell { dir: p.dir.max(0), depth: DEPTH_INITIAL, valid: true };
        }
        Ok(())
    }

    /// Marks grid-edge cells as draining off the grid. Returns how many
    /// cells were seeded.
    pub fn seed_grid_edges(&mut self, nrows: Dim, ncols: Dim, sfd: bool) -> usize {
        let mut seeded = 0;
        for di in 0..self.height {
            for dj in 0..self.width {
                let (i, j) = (self.i_min + di, self.j_min + dj);
                let cell = &mut self.cells[(di * self.width + dj) as usize];
                if cell.valid && cell.dir == 0 && is_grid_edge(i, j, nrows, ncols) {
                    let dir = edge_direction(i, j, nrows, ncols);
                    cell.dir = if sfd { find_dominant(dir) } else { dir };
                    seeded += 1;
                }
            }
        }
        seeded
    }

    /// Whether any cell already drains (BFS has a frontier to start
    /// from).
    #[must_use]
    pub fn has_spill(&self) -> bool {
        self.cells.iter().any(|c| c.valid && c.dir > 0)
    }

    /// Offsets of the eight neighbours in grid order E, SE, S, SW, W,
    /// NW, N, NE.
    fn neighbour(&self, k: usize, idx: usize) -> usize {
        let w = self.width as isize;
        let delta = match k {
            0 => 1,
            1 => w + 1,
            2 => w,
            3 => w - 1,
            4 => -1,
            5 => -(w + 1),
            6 => -w,
            _ => -(w - 1),
        };
        (idx as isize + delta) as usize
    }

    /// The direction bit a neighbour reached via `k` needs to point back
    /// at the cell it was reached from.
    fn converse_direction(k: usize) -> Dir {
        1 << ((k + 4) % 8)
    }

    /// Breadth-first direction assignment from the spill frontier. Each
    /// layer points at the previous one; in SFD mode interior cells are
    /// reduced to their dominant bit as they leave the frontier.
    pub fn assign_directions(&mut self, sfd: bool) {
        let mut frontier: VecDeque<usize> = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.valid && c.dir > 0)
            .map(|(k, _)| k)
            .collect();
        let mut next: VecDeque<usize> = VecDeque::new();

        while !frontier.is_empty() {
            while let Some(idx) = frontier.pop_front() {
                if sfd && self.cells[idx].depth > DEPTH_INITIAL {
                    self.cells[idx].dir = find_dominant(self.cells[idx].dir);
                }
                let depth = self.cells[idx].depth;
                for k in 0..8 {
                    let n = self.neighbour(k, idx);
                    if !self.cells[n].valid {
                        continue;
                    }
                    if self.cells[n].dir == 0 {
                        self.cells[n].depth = depth + 1;
                        next.push_back(n);
                    }
                    if self.cells[n].depth == depth + 1 {
                        self.cells[n].dir |= Self::converse_direction(k);
                    }
                }
            }
            std::mem::swap(&mut frontier, &mut next);
        }
    }

    /// Writes every cell out as a water item. Spilled plateaus pass
    /// `LABEL_UNDEF` (the watershed sweep labels them); depressions keep
    /// their contiguous label.
    pub fn save(&self, label: Label, out: &mut Stream<WaterItem>) -> VoxResult<()> {
        for di in 1..self.height - 1 {
            for dj in 1..self.width - 1 {
                let cell = &self.cells[(di * self.width + dj) as usize];
                if cell.valid {
                    out.push(&WaterItem {
                        i: self.i_min + di,
                        j: self.j_min + dj,
                        dir: cell.dir,
                        label,
                        depth: cell.depth,
                    })?;
                }
            }
        }
        Ok(())
    }
}
