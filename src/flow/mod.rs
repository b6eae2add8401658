//! External-memory terrain flow pipeline.
//!
//! The drivers here chain the passes exactly as the data flows: nodata
//! classification, plateau detection, direction assignment, watershed
//! labeling, depression filling, then a second direction pass over the
//! filled terrain and the accumulation sweep. Every intermediate product
//! is a spill-backed stream, so grids never need to fit in memory.

pub mod ccforest;
pub mod direction;
pub mod filldepr;
pub mod grid;
pub mod nodata;
pub mod plateau;
pub mod stats;
pub mod sweep;
pub mod types;
pub mod water;
pub mod window;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use self::filldepr::{commit_fill, fill_depressions};
use self::grid::PlateauGrid;
use self::nodata::classify_nodata;
use self::plateau::{PlateauOutput, find_plateaus};
use self::stats::StatsRecorder;
use self::sweep::{FlowCell, SweepOutput, build_sweep_stream};
use self::types::{
    DEPTH_INITIAL, Dim, Dir, ELEVATION_BOUNDARY, Elev, LABEL_BOUNDARY, LABEL_UNDEF,
    LabelFactory,
};
use self::water::{
    LabelElev, WaterGridCell, WaterItem, create_water_windows, find_boundaries,
    generate_watersheds,
};
use crate::config::Config;
use crate::error::{VoxError, VoxResult};
use crate::stream::{Stream, sort_stream};

/// Cooperative cancellation shared between the caller and the pipeline.
/// Checked at row granularity; a cancelled run returns
/// [`VoxError::Cancelled`] and leaves its spill files to their streams.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the pipeline notices at its next check.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// The error form of [`Self::is_cancelled`], for `?` chains.
    pub fn check(&self) -> VoxResult<()> {
        if self.is_cancelled() { Err(VoxError::Cancelled) } else { Ok(()) }
    }
}

/// Caller-facing knobs of the flow pipeline.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Single flow direction (D8) instead of the default MFD.
    pub sfd: bool,
    /// Accumulation above this switches a cell to D8 routing.
    pub d8cut: f32,
    /// Emit the topographic convergence index.
    pub tci: bool,
    /// Cell size west-east.
    pub ew_res: f32,
    /// Cell size north-south.
    pub ns_res: f32,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self { sfd: false, d8cut: f32::INFINITY, tci: false, ew_res: 1.0, ns_res: 1.0 }
    }
}

/// Products of the direction phase.
pub struct FlowDirections {
    /// Filled elevation, row-major.
    pub filled: Stream<Elev>,
    /// Final (elevation, direction, depth) grid, row-major.
    pub flow_grid: Stream<FlowCell>,
    /// Watershed label per cell, row-major.
    pub watersheds: Stream<LabelElev>,
    /// Flat regions still draining nowhere after filling (islands).
    pub depression_count: u64,
    /// Flat regions that resolved to a spill.
    pub spill_count: u64,
}

/// Assigns directions on every detected plateau: BFS inward from the
/// spill cells, off-grid seeding for spill-less flats on the grid edge,
/// fresh contiguous labels for true depressions.
fn assign_directions(
    plateau_output: &mut PlateauOutput,
    nrows: Dim,
    ncols: Dim,
    sfd: bool,
    labels: &mut LabelFactory,
    config: &Config,
    recorder: &mut StatsRecorder,
) -> VoxResult<(Stream<WaterItem>, u64, u64)> {
    let dir = config.stream_tmpdir()?.clone();
    let mut out: Stream<WaterItem> = Stream::new(&dir)?;
    let mut depressions = 0;
    let mut spills = 0;

    labels.reset();
    plateau_output.stats.rewind()?;
    plateau_output.plateaus.rewind()?;
    while let Some(ps) = plateau_output.stats.next()? {
        config.charge(PlateauGrid::bytes(&ps))?;
        let mut grid = PlateauGrid::new(&ps);
        grid.load(&mut plateau_output.plateaus)?;

        if !ps.has_spill {
            grid.seed_grid_edges(nrows, ncols, sfd);
        }
        if grid.has_spill() {
            spills += 1;
            grid.assign_directions(sfd);
            grid.save(LABEL_UNDEF, &mut out)?;
        } else {
            depressions += 1;
            grid.save(labels.next(), &mut out)?;
        }
    }
    recorder.record_count("spilled plateaus", spills);
    recorder.record_count("depressions", depressions);
    Ok((out, depressions, spills))
}

/// Merges plateau water items, per-cell directions and elevations into
/// the dense water grid. Boundary-nodata cells join the outside
/// watershed here.
fn merge_water_grid(
    items: Stream<WaterItem>,
    dirs: &mut Stream<Dir>,
    elev: &mut Stream<Elev>,
    nrows: Dim,
    ncols: Dim,
    cancel: &CancelToken,
    config: &Config,
) -> VoxResult<Stream<WaterGridCell>> {
    let dir = config.stream_tmpdir()?.clone();
    let mut sorted =
        sort_stream(items, &dir, config.memory_limit, |a, b| (a.i, a.j).cmp(&(b.i, b.j)))?;
    let mut out = Stream::new(&dir)?;
    sorted.rewind()?;
    dirs.rewind()?;
    elev.rewind()?;
    let mut next_item = sorted.next()?;
    for i in 0..nrows {
        cancel.check()?;
        for j in 0..ncols {
            let el = elev.next()?.ok_or(VoxError::StreamNotRewound)?;
            let cell_dir = dirs.next()?.ok_or(VoxError::StreamNotRewound)?;
            let cell = match next_item {
                Some(item) if (item.i, item.j) == (i, j) => {
                    next_item = sorted.next()?;
                    WaterGridCell { el, dir: item.dir, label: item.label, depth: item.depth }
                }
                _ => WaterGridCell {
                    el,
                    dir: cell_dir,
                    label: if el == ELEVATION_BOUNDARY { LABEL_BOUNDARY } else { LABEL_UNDEF },
                    depth: DEPTH_INITIAL,
                },
            };
            out.push(&cell)?;
        }
    }
    Ok(out)
}

/// Same merge shape as [`merge_water_grid`], producing the lean final
/// grid the sweep reads.
fn merge_flow_grid(
    items: Stream<WaterItem>,
    dirs: &mut Stream<Dir>,
    elev: &mut Stream<Elev>,
    nrows: Dim,
    ncols: Dim,
    cancel: &CancelToken,
    config: &Config,
) -> VoxResult<Stream<FlowCell>> {
    let dir = config.stream_tmpdir()?.clone();
    let mut sorted =
        sort_stream(items, &dir, config.memory_limit, |a, b| (a.i, a.j).cmp(&(b.i, b.j)))?;
    let mut out = Stream::new(&dir)?;
    sorted.rewind()?;
    dirs.rewind()?;
    elev.rewind()?;
    let mut next_item = sorted.next()?;
    for i in 0..nrows {
        cancel.check()?;
        for j in 0..ncols {
            let el = elev.next()?.ok_or(VoxError::StreamNotRewound)?;
            let cell_dir = dirs.next()?.ok_or(VoxError::StreamNotRewound)?;
            let cell = match next_item {
                Some(item) if (item.i, item.j) == (i, j) => {
                    next_item = sorted.next()?;
                    FlowCell { el, dir: item.dir, depth: item.depth }
                }
                _ => FlowCell { el, dir: cell_dir, depth: DEPTH_INITIAL },
            };
            out.push(&cell)?;
        }
    }
    Ok(out)
}

/// Computes filled elevation, flow directions and watershed labels for a
/// row-major elevation stream.
pub fn compute_flow_directions(
    elev: &mut Stream<Elev>,
    nrows: Dim,
    ncols: Dim,
    options: &FlowOptions,
    config: &Config,
    cancel: &CancelToken,
    recorder: &mut StatsRecorder,
) -> VoxResult<FlowDirections> {
    let dir = config.stream_tmpdir()?.clone();
    let mut labels = LabelFactory::new();

    recorder.comment("classifying nodata (inner & boundary)");
    cancel.check()?;
    let mut classified = classify_nodata(elev, nrows, ncols, config)?;

    recorder.comment("assigning preliminary directions");
    cancel.check()?;
    let mut plateau_output =
        find_plateaus(&mut classified, nrows, ncols, options.sfd, &mut labels, config)?;
    recorder.record_count("plateau records", plateau_output.plateaus.len());

    cancel.check()?;
    let (water_items, _, _) = assign_directions(
        &mut plateau_output,
        nrows,
        ncols,
        options.sfd,
        &mut labels,
        config,
        recorder,
    )?;

    recorder.comment("generating watersheds and watershed graph");
    cancel.check()?;
    let merged = merge_water_grid(
        water_items,
        &mut plateau_output.directions,
        &mut classified,
        nrows,
        ncols,
        cancel,
        config,
    )?;
    let mut windows_in = merged;
    let windows = create_water_windows(&mut windows_in, nrows, ncols, config)?;
    let watershed_output =
        generate_watersheds(windows, nrows, ncols, &mut labels, config)?;
    recorder.record_count("watershed labels", labels.count() as u64);

    recorder.comment("extracting watershed boundaries");
    cancel.check()?;
    let mut labeled = sort_stream(
        watershed_output.labeled,
        &dir,
        config.memory_limit,
        |a, b| (a.i, a.j).cmp(&(b.i, b.j)),
    )?;
    let boundaries = find_boundaries(&mut labeled, nrows, ncols, config)?;
    recorder.record_count("boundary edges", boundaries.len());

    recorder.comment("flooding depressions");
    cancel.check()?;
    let raise = fill_depressions(boundaries, labels.count(), config)?;
    let mut filled = commit_fill(&mut labeled, &raise, config)?;

    recorder.comment("reassigning directions on filled terrain");
    cancel.check()?;
    let mut final_plateaus =
        find_plateaus(&mut filled, nrows, ncols, options.sfd, &mut labels, config)?;
    let (final_items, depression_count, spill_count) = assign_directions(
        &mut final_plateaus,
        nrows,
        ncols,
        options.sfd,
        &mut labels,
        config,
        recorder,
    )?;
    if depression_count > 0 {
        warn!("{depression_count} depressions (islands) remain after filling");
    }
    let flow_grid = merge_flow_grid(
        final_items,
        &mut final_plateaus.directions,
        &mut filled,
        nrows,
        ncols,
        cancel,
        config,
    )?;

    Ok(FlowDirections {
        filled,
        flow_grid,
        watersheds: labeled,
        depression_count,
        spill_count,
    })
}

/// Runs the accumulation sweep over the final flow grid. The output is
/// row-major.
pub fn compute_flow_accumulation(
    flow_grid: &mut Stream<FlowCell>,
    nrows: Dim,
    ncols: Dim,
    options: &FlowOptions,
    config: &Config,
    cancel: &CancelToken,
    recorder: &mut StatsRecorder,
) -> VoxResult<Stream<SweepOutput>> {
    recorder.comment("creating sweep stream");
    cancel.check()?;
    let items = build_sweep_stream(flow_grid, nrows, ncols, config)?;
    recorder.record_count("sweep items", items.len());

    recorder.comment("sweeping");
    cancel.check()?;
    let out = sweep::sweep(
        items,
        options.ew_res,
        options.ns_res,
        options.d8cut,
        options.tci,
        config,
    )?;
    recorder.comment("sweeping done");
    Ok(out)
}
