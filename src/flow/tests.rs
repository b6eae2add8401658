//! End-to-end pipeline scenarios.

use std::collections::BTreeMap;

use super::stats::StatsRecorder;
use super::sweep::ACCU_NODATA;
use super::types::{Dim, ELEVATION_NODATA, Elev, LABEL_BOUNDARY, is_nodata};
use super::{CancelToken, FlowOptions, compute_flow_accumulation, compute_flow_directions};
use crate::config::Config;
use crate::stream::Stream;

struct PipelineRun {
    filled: Vec<Elev>,
    labels: BTreeMap<(Dim, Dim), i32>,
    accu: BTreeMap<(Dim, Dim), f32>,
    _tmp: tempfile::TempDir,
}

fn run_pipeline(grid: &[&[Elev]], options: &FlowOptions) -> PipelineRun {
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

    let cancel = CancelToken::new();
    let mut recorder = StatsRecorder::new(None).expect("recorder");
    let mut result = compute_flow_directions(
        &mut elev, nrows, ncols, options, &config, &cancel, &mut recorder,
    )
    .expect("directions");

    let mut filled = Vec::new();
    result.filled.rewind().expect("rewind");
    while let Some(v) = result.filled.next().expect("next") {
        filled.push(v);
    }
    assert_eq!(filled.len(), (nrows * ncols) as usize);

    let mut labels = BTreeMap::new();
    result.watersheds.rewind().expect("rewind");
    while let Some(cell) = result.watersheds.next().expect("next") {
        labels.insert((cell.i, cell.j), cell.label);
    }

    let mut accu_stream = compute_flow_accumulation(
        &mut result.flow_grid,
        nrows,
        ncols,
        options,
        &config,
        &cancel,
        &mut recorder,
    )
    .expect("accumulation");
    let mut accu = BTreeMap::new();
    accu_stream.rewind().expect("rewind");
    while let Some(o) = accu_stream.next().expect("next") {
        accu.insert((o.i, o.j), o.accu);
    }

    PipelineRun { filled, labels, accu, _tmp: tmp }
}

/// A flat 10.0 plateau draining through a single lower edge cell: the
/// whole grid funnels through it.
#[test]
fn plateau_drained_at_one_edge() {
    let grid: &[&[Elev]] = &[
        &[10.0, 10.0, 10.0],
        &[10.0, 10.0, 9.0],
        &[10.0, 10.0, 10.0],
    ];
    let run = run_pipeline(grid, &FlowOptions::default());

    // Nothing to fill: the terrain already drains.
    let expect: Vec<Elev> = grid.iter().flat_map(|r| r.iter().copied()).collect();
    assert_eq!(run.filled, expect);

    // Every cell's unit rainfall passes through the 9.0 outlet.
    assert!((run.accu[&(1, 2)] - 9.0).abs() < 1e-4, "outlet saw {}", run.accu[&(1, 2)]);
    // Everything drains off grid, so everything is the outside watershed.
    assert!(run.labels.values().all(|&l| l == LABEL_BOUNDARY));
}

/// A 1-cell pit inside a ring: the classifier raises it, the flat cross
/// drains off the edges, totals are conserved.
#[test]
fn pit_in_the_middle() {
    let grid: &[&[Elev]] = &[
        &[5.0, 3.0, 5.0],
        &[3.0, 1.0, 3.0],
        &[5.0, 3.0, 5.0],
    ];
    let run = run_pipeline(grid, &FlowOptions::default());

    // The pit was raised to its lowest neighbour by the classifier and
    // needed no further filling.
    assert_eq!(run.filled[4], 3.0);
    for (k, &v) in run.filled.iter().enumerate() {
        assert!(v >= grid[k / 3][k % 3], "fill must never lower a cell");
    }

    // The centre receives only the corners' diagonal shares.
    let center = run.accu[&(1, 1)];
    assert!(center > 1.0 && center < 2.0, "centre saw {center}");

    // All nine units leave the grid through the four edge cells of the
    // flat cross.
    let exits: f32 =
        run.accu[&(0, 1)] + run.accu[&(1, 0)] + run.accu[&(1, 2)] + run.accu[&(2, 1)];
    assert!((exits - 9.0).abs() < 1e-3, "edge cells saw {exits}");
}

/// Two basins over a saddle, the east one opening into the grid edge:
/// the west basin fills to the saddle, the east one is never raised.
#[test]
fn twin_basins_with_grid_edge_drain() {
    let grid: &[&[Elev]] = &[
        &[9.0, 9.0, 9.0, 9.0, 9.0],
        &[9.0, 5.0, 4.0, 5.0, 9.0],
        &[9.0, 0.0, 2.0, 0.0, 0.0],
        &[9.0, 5.0, 4.0, 5.0, 9.0],
        &[9.0, 9.0, 9.0, 9.0, 9.0],
    ];
    let run = run_pipeline(grid, &FlowOptions::default());

    let at = |i: Dim, j: Dim| run.filled[(i * 5 + j) as usize];
    // West basin rises to the 2.0 saddle; the east basin keeps its 0.0
    // floor because it already reaches the outside.
    assert_eq!(at(2, 1), 2.0);
    assert_eq!(at(2, 3), 0.0);
    assert_eq!(at(2, 2), 2.0);

    // The east basin is the outside watershed; the west one is its own.
    assert_eq!(run.labels[&(2, 3)], LABEL_BOUNDARY);
    assert_ne!(run.labels[&(2, 1)], LABEL_BOUNDARY);
}

/// Basins sealed behind an interior void ring cannot drain anywhere:
/// they are raised to their common saddle and reported as an island.
#[test]
fn island_basins_behind_interior_void() {
    const N: Elev = ELEVATION_NODATA;
    let grid: &[&[Elev]] = &[
        &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
        &[9.0, N, N, N, N, N, 9.0],
        &[9.0, N, 4.0, 4.0, 4.0, N, 9.0],
        &[9.0, N, 0.0, 2.0, 0.0, N, 9.0],
        &[9.0, N, 4.0, 4.0, 4.0, N, 9.0],
        &[9.0, N, N, N, N, N, 9.0],
        &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
    ];
    let run = run_pipeline(grid, &FlowOptions::default());

    let at = |i: Dim, j: Dim| run.filled[(i * 7 + j) as usize];
    // Both minima rise to the saddle between them; there is no outlet.
    assert_eq!(at(3, 2), 2.0);
    assert_eq!(at(3, 4), 2.0);
    assert_eq!(at(3, 3), 2.0);
    // The void ring passes through untouched.
    assert!(is_nodata(at(1, 1)));

    // The two minima belong to different watersheds, neither of them the
    // outside one.
    let west = run.labels[&(3, 2)];
    let east = run.labels[&(3, 4)];
    assert_ne!(west, east);
    assert_ne!(west, LABEL_BOUNDARY);
    assert_ne!(east, LABEL_BOUNDARY);
}

/// Fill never lowers terrain and leaves draining terrain alone.
#[test]
fn fill_is_monotone_on_rough_terrain() {
    // Deterministic rough terrain from a small LCG.
    let mut state = 12345u32;
    let mut grid_data = Vec::new();
    for _ in 0..8 {
        let mut row = Vec::new();
        for _ in 0..8 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            row.push(f32::from((state >> 16) as u16 % 100));
        }
        grid_data.push(row);
    }
    let grid: Vec<&[Elev]> = grid_data.iter().map(Vec::as_slice).collect();
    let run = run_pipeline(&grid, &FlowOptions::default());

    for i in 0..8 {
        for j in 0..8 {
            let original = grid_data[i][j];
            let filled = run.filled[i * 8 + j];
            assert!(filled >= original, "({i}, {j}) was lowered");
        }
    }

    // Rainfall is conserved: no cell accumulates more than the grid
    // holds, and every data cell reports something.
    for (&(i, j), &a) in &run.accu {
        assert!(
            a == ACCU_NODATA || (a >= 1.0 - 1e-5 && a <= 64.0 + 1e-3),
            "({i}, {j}) accumulated {a}"
        );
    }
}

#[test]
fn sfd_mode_runs_the_same_scenarios() {
    let grid: &[&[Elev]] = &[
        &[10.0, 10.0, 10.0],
        &[10.0, 10.0, 9.0],
        &[10.0, 10.0, 10.0],
    ];
    let options = FlowOptions { sfd: true, ..FlowOptions::default() };
    let run = run_pipeline(grid, &options);
    // SFD routes everything along single directions; the outlet still
    // collects the entire grid.
    assert!((run.accu[&(1, 2)] - 9.0).abs() < 1e-4);
}

#[test]
fn cancelled_pipeline_stops_early() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = Config::default().tmp_dir(tmp.path().to_path_buf());
    let mut elev: Stream<Elev> = Stream::new(tmp.path()).expect("stream");
    for _ in 0..9 {
        elev.push(&1.0f32).expect("push");
    }
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut recorder = StatsRecorder::new(None).expect("recorder");
    let result = compute_flow_directions(
        &mut elev,
        3,
        3,
        &FlowOptions::default(),
        &config,
        &cancel,
        &mut recorder,
    );
    assert!(matches!(result, Err(crate::error::VoxError::Cancelled)));
}
