//! Moving 3-row window over a row-major grid stream.

use super::{Record, Stream};
use crate::error::VoxResult;

/// Scans a `nrows x ncols` grid stream, presenting each cell with its 3x3
/// neighbourhood. Cells beyond the grid are the caller's `nodata` token.
/// The visitor runs exactly `nrows * ncols` times, row-major.
///
/// The visitor receives `(i, j, window)` with the window rows ordered
/// north, centre, south and columns west to east; `window[1][1]` is the
/// cell itself.
pub fn scan3<T, F>(
    stream: &mut Stream<T>,
    nrows: i32,
    ncols: i32,
    nodata: T,
    mut visit: F,
) -> VoxResult<()>
where
    T: Record,
    F: FnMut(i32, i32, &[[T; 3]; 3]) -> VoxResult<()>,
{
    let width = ncols as usize + 2;
    // Three padded rows cycle through above/centre/below.
    let mut rows = [
        vec![nodata; width],
        vec![nodata; width],
        vec![nodata; width],
    ];

    stream.rewind()?;
    let mut read_into = |row: &mut Vec<T>, stream: &mut Stream<T>| -> VoxResult<()> {
        row.fill(nodata);
        stream.read_row(&mut row[1..=ncols as usize])?;
        Ok(())
    };

    // Preload the first (centre) row.
    if nrows > 0 {
        read_into(&mut rows[1], stream)?;
    }
    for i in 0..nrows {
        if i + 1 < nrows {
            read_into(&mut rows[2], stream)?;
        } else {
            rows[2].fill(nodata);
        }
        for j in 0..ncols {
            let c = j as usize;
            let window = [
                [rows[0][c], rows[0][c + 1], rows[0][c + 2]],
                [rows[1][c], rows[1][c + 1], rows[1][c + 2]],
                [rows[2][c], rows[2][c + 1], rows[2][c + 2]],
            ];
            visit(i, j, &window)?;
        }
        rows.rotate_left(1);
    }
    Ok(())
}
