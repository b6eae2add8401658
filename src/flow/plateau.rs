//! Plateau detection and labeling.
//!
//! One scan over the classified elevation grid computes every cell's
//! preliminary direction and collects the flat regions: cells with no
//! downslope neighbour, plus the adjacent equal-elevation cells that
//! already drain (the plateau's spill cells). Provisional labels spread
//! through the scan window; collisions meet in the collision forest and a
//! relabel pass collapses every record to its component root.

use bytes::{Buf, BufMut};
use log::debug;

use super::ccforest::CollisionForest;
use super::direction::{encode_direction_mfd, encode_direction_sfd};
use super::types::{Dim, Dir, Elev, LABEL_UNDEF, Label, LabelFactory, is_nodata};
use super::window::{ElevationWindow, Window3};
use crate::config::Config;
use crate::error::VoxResult;
use crate::stream::{Record, Stream, scan3, sort_stream};

/// One plateau cell (or spill cell) seen during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plateau {
    /// Grid row.
    pub i: Dim,
    /// Grid column.
    pub j: Dim,
    /// Preliminary direction; positive for spill cells.
    pub dir: Dir,
    /// Component label, provisional until the relabel pass.
    pub label: Label,
}

impl Record for Plateau {
    const SIZE: usize = 14;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_i16(self.dir);
        buf.put_i32(self.label);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self { i: buf.get_i32(), j: buf.get_i32(), dir: buf.get_i16(), label: buf.get_i32() }
    }
}

/// Aggregate of one labeled plateau.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlateauStats {
    /// The plateau's label.
    pub label: Label,
    /// Bounding box rows, inclusive.
    pub i_min: Dim,
    /// See [`Self::i_min`].
    pub i_max: Dim,
    /// Bounding box columns, inclusive.
    pub j_min: Dim,
    /// See [`Self::j_min`].
    pub j_max: Dim,
    /// Number of cells carrying the label.
    pub size: i64,
    /// Whether any cell already drains out.
    pub has_spill: bool,
}

impl PlateauStats {
    fn new(label: Label) -> Self {
        Self {
            label,
            i_min: Dim::MAX,
            i_max: 0,
            j_min: Dim::MAX,
            j_max: 0,
            size: 0,
            has_spill: false,
        }
    }

    fn add(&mut self, p: &Plateau) {
        self.i_min = self.i_min.min(p.i);
        self.i_max = self.i_max.max(p.i);
        self.j_min = self.j_min.min(p.j);
        self.j_max = self.j_max.max(p.j);
        if p.dir > 0 {
            self.has_spill = true;
        }
        self.size += 1;
    }
}

impl Record for PlateauStats {
    const SIZE: usize = 29;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.label);
        buf.put_i32(self.i_min);
        buf.put_i32(self.i_max);
        buf.put_i32(self.j_min);
        buf.put_i32(self.j_max);
        buf.put_i64(self.size);
        buf.put_u8(u8::from(self.has_spill));
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            label: buf.get_i32(),
            i_min: buf.get_i32(),
            i_max: buf.get_i32(),
            j_min: buf.get_i32(),
            j_max: buf.get_i32(),
            size: buf.get_i64(),
            has_spill: buf.get_u8() != 0,
        }
    }
}

/// Results of the plateau pass.
pub struct PlateauOutput {
    /// Plateau records, sorted by label.
    pub plateaus: Stream<Plateau>,
    /// One aggregate per label, ascending.
    pub stats: Stream<PlateauStats>,
    /// Preliminary per-cell directions, row-major.
    pub directions: Stream<Dir>,
}

struct Detector {
    ncols: Dim,
    sfd: bool,
    forest: CollisionForest,
    plat_stream: Stream<Plateau>,
    dir_stream: Stream<Dir>,
    /// Directions of the previous row.
    prev_dirs: Vec<Dir>,
    cur_dirs: Vec<Dir>,
    /// Plateau records of the previous row (drain cells carry
    /// `LABEL_UNDEF` until a plateau claims them).
    prev_row: Vec<Option<Plateau>>,
    cur_row: Vec<Option<Plateau>>,
    prev_cell: Option<Plateau>,
}

impl Detector {
    fn row_neighbour(&self, col: Dim, dj: Dim) -> Option<&Plateau> {
        let k = col + dj;
        if k < 0 || k >= self.ncols { None } else { self.prev_row[k as usize].as_ref() }
    }

    fn row_dir(&self, col: Dim, dj: Dim) -> Dir {
        let k = col + dj;
        if k < 0 || k >= self.ncols { 0 } else { self.prev_dirs[k as usize] }
    }

    fn end_row(&mut self) {
        std::mem::swap(&mut self.prev_row, &mut self.cur_row);
        self.cur_row.fill(None);
        std::mem::swap(&mut self.prev_dirs, &mut self.cur_dirs);
        self.prev_cell = None;
    }

    fn process(
        &mut self,
        row: Dim,
        col: Dim,
        win: &ElevationWindow,
        labels: &mut LabelFactory,
    ) -> VoxResult<()> {
        if col == 0 {
            self.prev_cell = None;
        }

        let dir =
            if self.sfd { encode_direction_sfd(win) } else { encode_direction_mfd(win) };
        self.cur_dirs[col as usize] = dir;
        self.dir_stream.push(&dir)?;

        let center = win.center();
        if is_nodata(center) {
            self.cur_row[col as usize] = None;
            self.prev_cell = None;
            if col == self.ncols - 1 {
                self.end_row();
            }
            return Ok(());
        }

        // Window linear indices of the four already-seen neighbours:
        // NW, N, NE, then W.
        let seen = [(0usize, -1), (1, 0), (2, 1), (3, 0)];

        // Inherit a label from any equal-elevation neighbour; collisions
        // meet in the forest, smaller label wins.
        let mut label = LABEL_UNDEF;
        for &(k, dj) in &seen {
            if win.get(k) != center {
                continue;
            }
            let neighbour_label = if k == 3 {
                self.prev_cell.map_or(LABEL_UNDEF, |p| p.label)
            } else {
                self.row_neighbour(col, dj).map_or(LABEL_UNDEF, |p| p.label)
            };
            if neighbour_label == LABEL_UNDEF {
                continue;
            }
            if label == LABEL_UNDEF {
                label = neighbour_label;
            } else if label != neighbour_label {
                if label < neighbour_label {
                    self.forest.insert(label, neighbour_label);
                } else {
                    self.forest.insert(neighbour_label, label);
                    label = neighbour_label;
                }
            }
        }

        if label == LABEL_UNDEF {
            if dir > 0 {
                // Draining cell with no plateau neighbour yet: remember it
                // so a plateau discovered later can claim it as a spill.
                self.prev_cell =
                    Some(Plateau { i: row, j: col, dir, label: LABEL_UNDEF });
                self.cur_row[col as usize] = self.prev_cell;
                if col == self.ncols - 1 {
                    self.end_row();
                }
                return Ok(());
            }
            label = labels.next();
        }

        // Claim equal-elevation neighbours that already drain: they are
        // this plateau's spill cells.
        for &(k, dj) in &seen {
            if win.get(k) != center {
                continue;
            }
            let (ni, nj, ndir) = if k == 3 {
                (row, col - 1, self.prev_cell.map_or(0, |p| p.dir))
            } else {
                (row - 1, col + dj, self.row_dir(col, dj))
            };
            if ndir > 0 && ni >= 0 && nj >= 0 {
                self.plat_stream.push(&Plateau { i: ni, j: nj, dir: ndir, label })?;
            }
        }

        let record = Plateau { i: row, j: col, dir, label };
        self.prev_cell = Some(record);
        self.cur_row[col as usize] = Some(record);
        self.plat_stream.push(&record)?;

        if col == self.ncols - 1 {
            self.end_row();
        }
        Ok(())
    }
}

/// Runs the plateau pass over a classified elevation stream (1-cell pits
/// already filled by the nodata pass).
pub fn find_plateaus(
    elev: &mut Stream<Elev>,
    nrows: Dim,
    ncols: Dim,
    sfd: bool,
    labels: &mut LabelFactory,
    config: &Config,
) -> VoxResult<PlateauOutput> {
    let dir = config.stream_tmpdir()?.clone();
    labels.reset();

    let mut detector = Detector {
        ncols,
        sfd,
        forest: CollisionForest::new(),
        plat_stream: Stream::new(&dir)?,
        dir_stream: Stream::new(&dir)?,
        prev_dirs: vec![0; ncols as usize],
        cur_dirs: vec![0; ncols as usize],
        prev_row: vec![None; ncols as usize],
        cur_row: vec![None; ncols as usize],
        prev_cell: None,
    };

    scan3(elev, nrows, ncols, super::types::ELEVATION_NODATA, |i, j, rows| {
        detector.process(i, j, &Window3::from_rows(rows), labels)
    })?;

    let Detector { mut forest, plat_stream, dir_stream, .. } = detector;
    debug!("plateau scan: {} records, {} labels", plat_stream.len(), labels.count());

    // Drop duplicate claims of the same cell, merging their labels.
    let by_ij = sort_stream(plat_stream, &dir, config.memory_limit, |a, b| {
        (a.i, a.j).cmp(&(b.i, b.j))
    })?;
    let deduped = remove_duplicates(by_ij, &dir, &mut forest)?;

    // Collapse every record to its component root.
    let mut by_label =
        sort_stream(deduped, &dir, config.memory_limit, |a, b| a.label.cmp(&b.label))?;
    let mut relabeled = Stream::new(&dir)?;
    by_label.rewind()?;
    while let Some(mut p) = by_label.next()? {
        let root = forest.find_root(p.label);
        debug_assert!(root <= p.label);
        p.label = root;
        relabeled.push(&p)?;
    }

    // Aggregate per-label statistics.
    let mut plateaus =
        sort_stream(relabeled, &dir, config.memory_limit, |a, b| a.label.cmp(&b.label))?;
    let mut stats = Stream::new(&dir)?;
    let mut current: Option<PlateauStats> = None;
    plateaus.rewind()?;
    while let Some(p) = plateaus.next()? {
        match &mut current {
            Some(s) if s.label == p.label => s.add(&p),
            _ => {
                if let Some(done) = current.take() {
                    stats.push(&done)?;
                }
                let mut s = PlateauStats::new(p.label);
                s.add(&p);
                current = Some(s);
            }
        }
    }
    if let Some(done) = current.take() {
        stats.push(&done)?;
    }

    Ok(PlateauOutput { plateaus, stats, directions: dir_stream })
}

/// Keeps one record per cell; colliding labels are merged in the forest.
fn remove_duplicates(
    mut src: Stream<Plateau>,
    dir: &std::path::Path,
    forest: &mut CollisionForest,
) -> VoxResult<Stream<Plateau>> {
    let mut out = Stream::new(dir)?;
    src.rewind()?;
    let mut kept: Option<Plateau> = None;
    while let Some(p) = src.next()? {
        match &mut kept {
            Some(k) if (k.i, k.j) == (p.i, p.j) => {
                if k.label != p.label && k.label != LABEL_UNDEF && p.label != LABEL_UNDEF {
                    forest.insert(k.label.min(p.label), k.label.max(p.label));
                }
                if k.label == LABEL_UNDEF {
                    k.label = p.label;
                }
                k.dir |= p.dir.max(0);
            }
            _ => {
                if let Some(done) = kept.take() {
                    out.push(&done)?;
                }
                kept = Some(p);
            }
        }
    }
    if let Some(done) = kept.take() {
        out.push(&done)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::types::{ELEVATION_NODATA, LABEL_BOUNDARY};
    use super::*;
    use crate::config::Config;

    fn run(
        grid: &[&[Elev]],
        sfd: bool,
    ) -> (Vec<Plateau>, Vec<PlateauStats>, Vec<Dir>, LabelFactory) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = Config::default().tmp_dir(tmp.path().to_path_buf());
        let nrows = grid.len() as Dim;
        let ncols = grid[0].len() as Dim;
        let mut elev: Stream<Elev> =
            Stream::new(tmp.path()).expect("stream");
        for row in grid {
            for &v in *row {
                elev.push(&v).expect("push");
            }
        }
        let mut labels = LabelFactory::new();
        let mut out =
            find_plateaus(&mut elev, nrows, ncols, sfd, &mut labels, &config).expect("plateaus");

        let mut plats = Vec::new();
        out.plateaus.rewind().expect("rewind");
        while let Some(p) = out.plateaus.next().expect("next") {
            plats.push(p);
        }
        let mut stats = Vec::new();
        out.stats.rewind().expect("rewind");
        while let Some(s) = out.stats.next().expect("next") {
            stats.push(s);
        }
        let mut dirs = Vec::new();
        out.directions.rewind().expect("rewind");
        while let Some(d) = out.directions.next().expect("next") {
            dirs.push(d);
        }
        (plats, stats, dirs, labels)
    }

    #[test]
    fn flat_plateau_with_one_drain_is_one_label() {
        // All 10.0 except the east-centre cell at 9.0.
        let grid: &[&[Elev]] = &[
            &[10.0, 10.0, 10.0],
            &[10.0, 10.0, 9.0],
            &[10.0, 10.0, 10.0],
        ];
        let (plats, stats, dirs, _) = run(grid, false);
        assert_eq!(dirs.len(), 9);

        // The eight 10.0 cells form one plateau; the five of them beside
        // the 9.0 drop drain into it and mark the spill. The 9.0 cell is
        // its own flat region.
        let big = stats.iter().find(|s| s.size == 8).expect("10.0 plateau");
        assert!(big.has_spill);
        assert_eq!((big.i_min, big.i_max, big.j_min, big.j_max), (0, 2, 0, 2));
        assert_eq!(plats.iter().filter(|p| p.label == big.label).count(), 8);
        assert_eq!(plats.iter().filter(|p| p.label == big.label && p.dir > 0).count(), 5);

        let low = stats.iter().find(|s| s.size == 1).expect("9.0 cell");
        assert!(!low.has_spill);
        assert_ne!(low.label, big.label);
    }

    #[test]
    fn flat_grid_is_one_spill_less_plateau() {
        let grid: &[&[Elev]] = &[
            &[9.0, 9.0, 9.0],
            &[9.0, 9.0, 9.0],
            &[9.0, 9.0, 9.0],
        ];
        let (_, stats, _, _) = run(grid, false);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].size, 9);
        assert!(!stats[0].has_spill);
    }

    #[test]
    fn interior_depression_without_spill() {
        // A 2x2 flat floor at 1.0 inside a 4x4 rim; every rim cell has a
        // strictly lower neighbour, so none of them is a plateau member.
        let grid: &[&[Elev]] = &[
            &[9.0, 9.0, 9.0, 9.0],
            &[9.0, 1.0, 1.0, 9.0],
            &[9.0, 1.0, 1.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0],
        ];
        let (plats, stats, _, _) = run(grid, false);
        assert_eq!(stats.len(), 1);
        let floor = &stats[0];
        assert_eq!(floor.size, 4);
        assert!(!floor.has_spill, "no equal-elevation cell drains");
        assert!(floor.label > LABEL_BOUNDARY);
        assert_eq!(plats.iter().filter(|p| p.label == floor.label).count(), 4);
        assert_eq!((floor.i_min, floor.i_max, floor.j_min, floor.j_max), (1, 2, 1, 2));
    }

    #[test]
    fn u_shaped_plateau_merges_to_one_label() {
        // Two flat arms at 5.0 split by a 9.0 ridge meet on the bottom
        // row: the scan mints two labels and the collision merges them.
        let grid: &[&[Elev]] = &[
            &[5.0, 9.0, 5.0],
            &[5.0, 9.0, 5.0],
            &[5.0, 5.0, 5.0],
        ];
        let (plats, stats, _, _) = run(grid, false);
        let fives: Vec<&Plateau> = plats.iter().filter(|p| (p.i, p.j) != (0, 1)).collect();
        assert_eq!(fives.len(), 7);
        let first = fives[0].label;
        assert!(fives.iter().all(|p| p.label == first), "arms should share a label");
        let merged = stats.iter().find(|s| s.label == first).expect("merged plateau");
        assert_eq!(merged.size, 7);
    }

    #[test]
    fn nodata_cells_produce_no_records() {
        let grid: &[&[Elev]] = &[
            &[ELEVATION_NODATA, ELEVATION_NODATA],
            &[ELEVATION_NODATA, ELEVATION_NODATA],
        ];
        let (plats, stats, dirs, _) = run(grid, false);
        assert!(plats.is_empty());
        assert!(stats.is_empty());
        assert_eq!(dirs.len(), 4);
    }
}
