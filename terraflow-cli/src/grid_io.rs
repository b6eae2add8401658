//! ESRI ASCII grid row I/O.
//!
//! The pipeline treats 2D rasters as abstract row-oriented streams; this
//! module is the concrete reader/writer the CLI plugs in. Values equal
//! to the header's nodata token map to the pipeline's internal nodata
//! sentinel and back.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use terravox::flow::types::{ELEVATION_NODATA, Elev, is_nodata};
use terravox::stream::Stream;
use terravox::{VoxError, VoxResult};

/// Geometry of an ASCII grid file.
#[derive(Debug, Clone, PartialEq)]
pub struct GridHeader {
    pub ncols: i32,
    pub nrows: i32,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    pub nodata_value: f64,
}

fn bad(path: &Path, what: &str) -> VoxError {
    VoxError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {what}", path.display()),
    ))
}

/// Reads an ASCII grid into an elevation stream, mapping the file's
/// nodata token to the internal sentinel.
pub fn read_grid(path: &Path, tmp_dir: &Path) -> VoxResult<(GridHeader, Stream<Elev>)> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let mut header = GridHeader {
        ncols: 0,
        nrows: 0,
        xllcorner: 0.0,
        yllcorner: 0.0,
        cellsize: 1.0,
        nodata_value: -9999.0,
    };
    let mut first_data_line: Option<String> = None;
    for line in lines.by_ref() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let value = parts.next().unwrap_or_default();
        match key.to_ascii_lowercase().as_str() {
            "ncols" => header.ncols = value.parse().map_err(|_| bad(path, "bad ncols"))?,
            "nrows" => header.nrows = value.parse().map_err(|_| bad(path, "bad nrows"))?,
            "xllcorner" | "xllcenter" => {
                header.xllcorner = value.parse().map_err(|_| bad(path, "bad xllcorner"))?;
            }
            "yllcorner" | "yllcenter" => {
                header.yllcorner = value.parse().map_err(|_| bad(path, "bad yllcorner"))?;
            }
            "cellsize" => {
                header.cellsize = value.parse().map_err(|_| bad(path, "bad cellsize"))?;
            }
            "nodata_value" => {
                header.nodata_value =
                    value.parse().map_err(|_| bad(path, "bad nodata_value"))?;
            }
            _ => {
                first_data_line = Some(line);
                break;
            }
        }
    }
    if header.ncols <= 0 || header.nrows <= 0 {
        return Err(bad(path, "missing ncols/nrows"));
    }

    let mut stream: Stream<Elev> = Stream::new(tmp_dir)?;
    let mut count: u64 = 0;
    let mut take = |line: &str, stream: &mut Stream<Elev>| -> VoxResult<()> {
        for token in line.split_whitespace() {
            let v: f64 = token.parse().map_err(|_| bad(path, "bad cell value"))?;
            let cell = if v == header.nodata_value { ELEVATION_NODATA } else { v as Elev };
            stream.push(&cell)?;
            count += 1;
        }
        Ok(())
    };
    if let Some(line) = first_data_line {
        take(&line, &mut stream)?;
    }
    for line in lines {
        take(&line?, &mut stream)?;
    }
    if count != u64::from(header.ncols as u32) * u64::from(header.nrows as u32) {
        return Err(bad(path, "cell count does not match header"));
    }
    Ok((header, stream))
}

/// Writes one grid; `values` yields cells row-major, `None` meaning
/// nodata.
pub fn write_grid<I>(path: &Path, header: &GridHeader, values: I) -> VoxResult<()>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ncols {}", header.ncols)?;
    writeln!(out, "nrows {}", header.nrows)?;
    writeln!(out, "xllcorner {}", header.xllcorner)?;
    writeln!(out, "yllcorner {}", header.yllcorner)?;
    writeln!(out, "cellsize {}", header.cellsize)?;
    writeln!(out, "NODATA_value {}", header.nodata_value)?;

    let mut col = 0;
    for v in values {
        if col > 0 {
            write!(out, " ")?;
        }
        match v {
            Some(v) => write!(out, "{v}")?,
            None => write!(out, "{}", header.nodata_value)?,
        }
        col += 1;
        if col == header.ncols {
            writeln!(out)?;
            col = 0;
        }
    }
    out.flush()?;
    Ok(())
}

/// Maps an internal elevation to an output cell.
#[must_use]
pub fn elev_out(v: Elev) -> Option<f64> {
    if is_nodata(v) { None } else { Some(f64::from(v)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_roundtrip_with_nodata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("grid.asc");
        let header = GridHeader {
            ncols: 3,
            nrows: 2,
            xllcorner: 10.0,
            yllcorner: 20.0,
            cellsize: 30.0,
            nodata_value: -9999.0,
        };
        let cells = [Some(1.5), None, Some(3.0), Some(4.0), Some(5.0), None];
        write_grid(&path, &header, cells).unwrap();

        let (back, mut stream) = read_grid(&path, tmp.path()).unwrap();
        assert_eq!(back, header);
        stream.rewind().unwrap();
        let mut out = Vec::new();
        while let Some(v) = stream.next().unwrap() {
            out.push(elev_out(v));
        }
        assert_eq!(out, cells);
    }

    #[test]
    fn short_grid_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("grid.asc");
        std::fs::write(&path, "ncols 3\nnrows 2\n1 2 3\n").unwrap();
        assert!(read_grid(&path, tmp.path()).is_err());
    }

    #[test]
    fn missing_dimensions_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("grid.asc");
        std::fs::write(&path, "cellsize 1\n1 2 3\n").unwrap();
        assert!(read_grid(&path, tmp.path()).is_err());
    }
}
