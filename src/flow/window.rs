//! 3x3 cell windows.

use super::types::{Dim, Elev, is_nodata};

/// A 3x3 neighbourhood, row-major with the centre at linear index 4.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window3<T>(
    /// The cells, north row first.
    pub [T; 9],
);

impl<T: Copy> Window3<T> {
    /// Builds a window from the three scan rows.
    #[must_use]
    pub fn from_rows(rows: &[[T; 3]; 3]) -> Self {
        Self([
            rows[0][0], rows[0][1], rows[0][2],
            rows[1][0], rows[1][1], rows[1][2],
            rows[2][0], rows[2][1], rows[2][2],
        ])
    }

    /// The centre cell.
    #[must_use]
    pub fn center(&self) -> T {
        self.0[4]
    }

    /// Linear access, `0..9`.
    #[must_use]
    pub fn get(&self, k: usize) -> T {
        self.0[k]
    }

    /// Offset access, `di, dj` in `-1..=1`.
    #[must_use]
    pub fn at(&self, di: Dim, dj: Dim) -> T {
        self.0[((di + 1) * 3 + dj + 1) as usize]
    }

    /// Linear store, `0..9`.
    pub fn set(&mut self, k: usize, v: T) {
        self.0[k] = v;
    }

    /// Offset store, `di, dj` in `-1..=1`.
    pub fn set_at(&mut self, di: Dim, dj: Dim, v: T) {
        self.0[((di + 1) * 3 + dj + 1) as usize] = v;
    }
}

/// Elevation window.
pub type ElevationWindow = Window3<Elev>;

/// Raises a 1-cell pit to its lowest neighbour: a centre strictly below
/// all eight data neighbours can never drain and would trap the plateau
/// pass, so it is filled on the way in.
pub fn fill_pit(win: &mut ElevationWindow) {
    let center = win.center();
    if is_nodata(center) {
        return;
    }
    let mut lowest = Elev::MAX;
    for k in [0usize, 1, 2, 3, 5, 6, 7, 8] {
        let n = win.get(k);
        if is_nodata(n) {
            return;
        }
        lowest = lowest.min(n);
    }
    if center < lowest {
        win.set(4, lowest);
    }
}
