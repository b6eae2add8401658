mod grid_io;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::info;
use terravox::flow::stats::StatsRecorder;
use terravox::flow::sweep::ACCU_NODATA;
use terravox::flow::types::{LABEL_UNDEF, is_nodata};
use terravox::flow::{
    CancelToken, FlowOptions, compute_flow_accumulation, compute_flow_directions,
};
use terravox::{Config, VoxResult};

use grid_io::{elev_out, read_grid, write_grid};

/// Flow computation for massive grids: filled elevation, flow
/// directions, sink watersheds, flow accumulation and TCI.
#[derive(Parser, Debug)]
#[command(name = "terraflow", version)]
struct Cli {
    /// Input elevation grid (ESRI ASCII)
    #[arg(long)]
    elevation: PathBuf,

    /// Output filled (flooded) elevation grid
    #[arg(long)]
    filled: Option<PathBuf>,

    /// Output flow direction grid
    #[arg(long)]
    direction: Option<PathBuf>,

    /// Output sink-watershed grid
    #[arg(long)]
    swatershed: Option<PathBuf>,

    /// Output flow accumulation grid
    #[arg(long)]
    accumulation: Option<PathBuf>,

    /// Output topographic convergence index grid
    #[arg(long)]
    tci: Option<PathBuf>,

    /// SFD (D8) flow (default is MFD)
    #[arg(short = 's')]
    sfd: bool,

    /// Route flow as SFD once accumulation exceeds this value
    /// (meaningful only for MFD flow; defaults to infinity)
    #[arg(long)]
    d8cut: Option<f32>,

    /// Memory cap in MB for the external-memory structures
    #[arg(long, default_value_t = 300)]
    memory: usize,

    /// Directory for temporary stream files (they can be large);
    /// defaults to $STREAM_TMPDIR
    #[arg(long)]
    directory: Option<PathBuf>,

    /// File for runtime statistics
    #[arg(long)]
    stats: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("terraflow: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> VoxResult<()> {
    if cli.filled.is_none()
        && cli.direction.is_none()
        && cli.swatershed.is_none()
        && cli.accumulation.is_none()
        && cli.tci.is_none()
    {
        return Err(std::io::Error::other("at least one output must be specified").into());
    }

    let mut config = Config::from_env();
    config.memory_limit = cli.memory << 20;
    let _owned_tmp: Option<tempfile::TempDir>;
    if let Some(dir) = &cli.directory {
        std::fs::create_dir_all(dir)?;
        config.tmp_dir = Some(dir.clone());
        _owned_tmp = None;
    } else if config.tmp_dir.is_none() {
        let dir = tempfile::tempdir()?;
        config.tmp_dir = Some(dir.path().to_path_buf());
        _owned_tmp = Some(dir);
    } else {
        _owned_tmp = None;
    }
    let tmp_dir = config.stream_tmpdir()?.clone();

    let mut recorder = StatsRecorder::new(cli.stats.as_deref())?;
    let cancel = CancelToken::new();

    let (header, mut elev) = read_grid(&cli.elevation, &tmp_dir)?;
    info!("region size is {} x {}", header.nrows, header.ncols);
    recorder
        .record_count("region cells", u64::from(header.nrows as u32) * u64::from(header.ncols as u32));

    let options = FlowOptions {
        sfd: cli.sfd,
        d8cut: cli.d8cut.unwrap_or(f32::INFINITY),
        tci: cli.tci.is_some(),
        ew_res: header.cellsize as f32,
        ns_res: header.cellsize as f32,
    };

    let mut result = compute_flow_directions(
        &mut elev,
        header.nrows,
        header.ncols,
        &options,
        &config,
        &cancel,
        &mut recorder,
    )?;

    if let Some(path) = &cli.filled {
        result.filled.rewind()?;
        let mut cells = Vec::new();
        while let Some(v) = result.filled.next()? {
            cells.push(elev_out(v));
        }
        write_grid(path, &header, cells)?;
    }

    if let Some(path) = &cli.direction {
        result.flow_grid.rewind()?;
        let mut cells = Vec::new();
        while let Some(c) = result.flow_grid.next()? {
            cells.push(if is_nodata(c.el) { None } else { Some(f64::from(c.dir)) });
        }
        write_grid(path, &header, cells)?;
    }

    if let Some(path) = &cli.swatershed {
        result.watersheds.rewind()?;
        let mut cells = Vec::new();
        while let Some(c) = result.watersheds.next()? {
            cells.push(if c.label == LABEL_UNDEF { None } else { Some(f64::from(c.label)) });
        }
        write_grid(path, &header, cells)?;
    }

    if cli.accumulation.is_some() || cli.tci.is_some() {
        let mut sweep_out = compute_flow_accumulation(
            &mut result.flow_grid,
            header.nrows,
            header.ncols,
            &options,
            &config,
            &cancel,
            &mut recorder,
        )?;

        // The sweep emits data cells only; spread them over the full
        // grid, nodata elsewhere.
        let mut accu = vec![None; (header.nrows * header.ncols) as usize];
        let mut tci = vec![None; (header.nrows * header.ncols) as usize];
        sweep_out.rewind()?;
        while let Some(o) = sweep_out.next()? {
            let k = (o.i * header.ncols + o.j) as usize;
            if o.accu != ACCU_NODATA {
                accu[k] = Some(f64::from(o.accu));
                tci[k] = Some(f64::from(o.tci));
            }
        }
        if let Some(path) = &cli.accumulation {
            write_grid(path, &header, accu)?;
        }
        if let Some(path) = &cli.tci {
            write_grid(path, &header, tci)?;
        }
    }

    recorder.flush();
    Ok(())
}
