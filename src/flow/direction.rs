//! Per-cell flow direction encoding.

use super::types::{
    DIR_E, DIR_N, DIR_NE, DIR_NW, DIR_S, DIR_SE, DIR_SW, DIR_W, DIRECTION_UNDEF, Dim, Dir,
    is_nodata, is_void,
};
use super::window::ElevationWindow;

const ROOT_TWO: f32 = std::f32::consts::SQRT_2;

/// Multiple flow directions: one bit per strictly lower non-void
/// neighbour. Flat cells come back as 0 and are the plateau pass's
/// problem; boundary-nodata neighbours count as downslope targets (flow
/// may exit into the data edge), interior voids never do.
#[must_use]
pub fn encode_direction_mfd(win: &ElevationWindow) -> Dir {
    let center = win.center();
    if is_nodata(center) {
        return DIRECTION_UNDEF;
    }
    let mut dir = 0;
    for (k, bit) in [
        (0, DIR_NW),
        (1, DIR_N),
        (2, DIR_NE),
        (3, DIR_W),
        (5, DIR_E),
        (6, DIR_SW),
        (7, DIR_S),
        (8, DIR_SE),
    ] {
        let n = win.get(k);
        if n < center && !is_void(n) {
            dir |= bit;
        }
    }
    dir
}

/// Single flow direction (D8): the one neighbour with the steepest drop,
/// diagonal drops scaled by 1/sqrt(2). Flat cells come back as 0.
#[must_use]
pub fn encode_direction_sfd(win: &ElevationWindow) -> Dir {
    let center = win.center();
    if is_nodata(center) {
        return DIRECTION_UNDEF;
    }
    let mut max_drop = 0.0f32;
    let mut dir = 0;
    for (k, bit) in [
        (0, DIR_NW),
        (1, DIR_N),
        (2, DIR_NE),
        (3, DIR_W),
        (5, DIR_E),
        (6, DIR_SW),
        (7, DIR_S),
        (8, DIR_SE),
    ] {
        let n = win.get(k);
        if is_void(n) {
            continue;
        }
        let scale = if k % 2 == 1 { 1.0 } else { ROOT_TWO };
        let drop = (center - n) / scale;
        if drop > max_drop {
            max_drop = drop;
            dir = bit;
        }
    }
    dir
}

/// The off-grid direction of a grid-edge cell: the bits pointing past the
/// edge. Used to seed spill-less flat regions that touch the edge; their
/// water has nowhere to go but out.
#[must_use]
pub fn edge_direction(row: Dim, col: Dim, nrows: Dim, ncols: Dim) -> Dir {
    let mut dir = 0;
    if row == 0 {
        dir = DIR_NW | DIR_N | DIR_NE;
    }
    if row == nrows - 1 {
        dir = DIR_SE | DIR_S | DIR_SW;
    }
    if col == 0 {
        dir = if row == 0 {
            DIR_NW
        } else if row == nrows - 1 {
            DIR_SW
        } else {
            DIR_SW | DIR_W | DIR_NW
        };
    }
    if col == ncols - 1 {
        dir = if row == 0 {
            DIR_NE
        } else if row == nrows - 1 {
            DIR_SE
        } else {
            DIR_NE | DIR_E | DIR_SE
        };
    }
    dir
}

/// Reduces a multi-bit direction to its dominant single bit.
///
/// Contiguous fans resolve to their middle (rounded toward the smaller
/// code); disjoint fans prefer cardinals, and among true ties the
/// smallest code wins.
#[must_use]
pub fn find_dominant(dir: Dir) -> Dir {
    match dir {
        1 | 2 | 4 | 8 | 16 | 32 | 64 | 128 => return dir,

        // Two-bit fans: keep the cardinal.
        3 | 129 => return 1,
        6 | 12 => return 4,
        24 | 48 => return 16,
        96 | 192 => return 64,

        // Three-bit fans: the middle.
        7 => return 2,
        14 => return 4,
        28 => return 8,
        56 => return 16,
        112 => return 32,
        224 => return 64,
        193 => return 128,
        131 => return 1,

        // Four-bit fans.
        135 | 195 => return 1,
        15 | 30 => return 4,
        120 | 60 => return 16,
        225 | 240 => return 64,

        // Five-bit fans.
        199 => return 1,
        143 => return 2,
        31 => return 4,
        62 => return 8,
        124 => return 16,
        248 => return 32,
        241 => return 64,
        227 => return 128,
        _ => {}
    }

    // No recognised fan: prefer cardinals, then the smallest code.
    if dir & (DIR_E | DIR_S | DIR_W | DIR_N) != 0 {
        for bit in [DIR_E, DIR_S, DIR_W, DIR_N] {
            if dir & bit != 0 {
                return bit;
            }
        }
    }
    for bit in [DIR_SE, DIR_SW, DIR_NW, DIR_NE] {
        if dir & bit != 0 {
            return bit;
        }
    }
    dir
}
