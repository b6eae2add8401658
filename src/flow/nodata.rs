//! Nodata classification: boundary nodata (connected to the grid edge)
//! versus interior voids.
//!
//! Flow may exit into the data boundary but must never route through an
//! interior hole, so the two get distinct sentinels before any direction
//! work happens. The same pass fills 1-cell pits.

use bytes::{Buf, BufMut};
use log::debug;

use super::ccforest::CollisionForest;
use super::types::{
    Dim, ELEVATION_BOUNDARY, ELEVATION_NODATA, Elev, LABEL_BOUNDARY, LABEL_UNDEF, Label,
    LabelFactory, is_grid_edge, is_nodata,
};
use super::window::{Window3, fill_pit};
use crate::config::Config;
use crate::error::VoxResult;
use crate::stream::{Record, Stream, scan3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodataRec {
    i: Dim,
    j: Dim,
    label: Label,
}

impl Record for NodataRec {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.i);
        buf.put_i32(self.j);
        buf.put_i32(self.label);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self { i: buf.get_i32(), j: buf.get_i32(), label: buf.get_i32() }
    }
}

/// Rewrites the raw elevation stream with classified nodata: nulls
/// 8-connected to a grid-edge null become [`ELEVATION_BOUNDARY`], the
/// rest stay [`ELEVATION_NODATA`]. Data cells pass through with 1-cell
/// pits raised.
pub fn classify_nodata(
    elev: &mut Stream<Elev>,
    nrows: Dim,
    ncols: Dim,
    config: &Config,
) -> VoxResult<Stream<Elev>> {
    let dir = config.stream_tmpdir()?.clone();
    let mut forest = CollisionForest::new();
    let mut labels = LabelFactory::new();
    let mut filled: Stream<Elev> = Stream::new(&dir)?;
    let mut nulls: Stream<NodataRec> = Stream::new(&dir)?;

    // Previous-row labels of null cells, plus the cell to the west.
    let mut prev_row: Vec<Label> = vec![LABEL_UNDEF; ncols as usize];
    let mut cur_row: Vec<Label> = vec![LABEL_UNDEF; ncols as usize];
    let mut west = LABEL_UNDEF;

    scan3(elev, nrows, ncols, ELEVATION_NODATA, |i, j, rows| {
        if j == 0 {
            west = LABEL_UNDEF;
        }
        let mut win = Window3::from_rows(rows);
        fill_pit(&mut win);
        filled.push(&win.center())?;

        if !is_nodata(win.center()) {
            cur_row[j as usize] = LABEL_UNDEF;
            west = LABEL_UNDEF;
            if j == ncols - 1 {
                std::mem::swap(&mut prev_row, &mut cur_row);
            }
            return Ok(());
        }

        let mut label =
            if is_grid_edge(i, j, nrows, ncols) { LABEL_BOUNDARY } else { LABEL_UNDEF };
        let neighbours = [
            if j > 0 { prev_row[j as usize - 1] } else { LABEL_UNDEF },
            prev_row[j as usize],
            if j + 1 < ncols { prev_row[j as usize + 1] } else { LABEL_UNDEF },
            west,
        ];
        for n in neighbours {
            if n == LABEL_UNDEF {
                continue;
            }
            if label == LABEL_UNDEF {
                label = n;
            } else if label != n {
                forest.insert(label.min(n), label.max(n));
                label = label.min(n);
            }
        }
        if label == LABEL_UNDEF {
            label = labels.next();
        }

        cur_row[j as usize] = label;
        west = label;
        nulls.push(&NodataRec { i, j, label })?;
        if j == ncols - 1 {
            std::mem::swap(&mut prev_row, &mut cur_row);
        }
        Ok(())
    })?;
    debug!("nodata classifier: {} null cells", nulls.len());

    // Second pass: replace each null with its component's sentinel. The
    // null records were written in scan order, so both streams walk in
    // lockstep.
    let mut out: Stream<Elev> = Stream::new(&dir)?;
    filled.rewind()?;
    nulls.rewind()?;
    let mut next_null = nulls.next()?;
    for i in 0..nrows {
        for j in 0..ncols {
            let v = filled.next()?.ok_or(crate::error::VoxError::StreamNotRewound)?;
            let classified = match next_null {
                Some(rec) if (rec.i, rec.j) == (i, j) => {
                    next_null = nulls.next()?;
                    if forest.find_root(rec.label) == LABEL_BOUNDARY {
                        ELEVATION_BOUNDARY
                    } else {
                        ELEVATION_NODATA
                    }
                }
                _ => v,
            };
            out.push(&classified)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(grid: &[&[Elev]]) -> Vec<Elev> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = Config::default().tmp_dir(tmp.path().to_path_buf());
        let nrows = grid.len() as Dim;
        let ncols = grid[0].len() as Dim;
        let mut elev: Stream<Elev> = Stream::new(tmp.path()).expect("stream");
        for row in grid {
            for &v in *row {
                elev.push(&v).expect("push");
            }
        }
        let mut out = classify_nodata(&mut elev, nrows, ncols, &config).expect("classify");
        out.rewind().expect("rewind");
        let mut cells = Vec::new();
        while let Some(v) = out.next().expect("next") {
            cells.push(v);
        }
        cells
    }

    const N: Elev = ELEVATION_NODATA;

    #[test]
    fn edge_connected_nulls_become_boundary() {
        let grid: &[&[Elev]] = &[
            &[N, N, 5.0],
            &[5.0, N, 5.0],
            &[5.0, 5.0, 5.0],
        ];
        let out = classify(grid);
        // (0,0) and (0,1) touch the edge; (1,1) connects to them.
        assert_eq!(out[0], ELEVATION_BOUNDARY);
        assert_eq!(out[1], ELEVATION_BOUNDARY);
        assert_eq!(out[4], ELEVATION_BOUNDARY);
    }

    #[test]
    fn interior_hole_stays_void() {
        let grid: &[&[Elev]] = &[
            &[5.0, 5.0, 5.0, 5.0],
            &[5.0, N, N, 5.0],
            &[5.0, N, N, 5.0],
            &[5.0, 5.0, 5.0, 5.0],
        ];
        let out = classify(grid);
        for (k, &v) in out.iter().enumerate() {
            let (i, j) = (k / 4, k % 4);
            if (1..=2).contains(&i) && (1..=2).contains(&j) {
                assert_eq!(v, ELEVATION_NODATA, "cell ({i}, {j})");
            } else {
                assert!(!is_nodata(v));
            }
        }
    }

    #[test]
    fn diagonal_connection_reaches_the_edge() {
        // The interior null touches an edge null only diagonally; 8-way
        // connectivity still makes it boundary nodata.
        let grid: &[&[Elev]] = &[
            &[N, 5.0, 5.0],
            &[5.0, N, 5.0],
            &[5.0, 5.0, 5.0],
        ];
        let out = classify(grid);
        assert_eq!(out[0], ELEVATION_BOUNDARY);
        assert_eq!(out[4], ELEVATION_BOUNDARY);
    }

    #[test]
    fn one_cell_pit_is_filled_to_lowest_neighbour() {
        let grid: &[&[Elev]] = &[
            &[5.0, 3.0, 5.0],
            &[3.0, 1.0, 3.0],
            &[5.0, 3.0, 5.0],
        ];
        let out = classify(grid);
        assert_eq!(out[4], 3.0);
        assert_eq!(out[0], 5.0);
    }

    #[test]
    fn all_data_grid_is_unchanged_except_pits() {
        let grid: &[&[Elev]] = &[&[1.0, 2.0], &[3.0, 4.0]];
        assert_eq!(classify(grid), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
