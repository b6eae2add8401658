//! Volume geometry: the on-disk region and the query window.
//!
//! Both share one shape. The region describes how the cells are stored;
//! the window describes how a caller wants to see them. All public value
//! accessors on a map are window-relative and go through the resampler.

use serde::{Deserialize, Serialize};

use crate::error::{VoxError, VoxResult};

/// Geo-referenced cuboid of cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Projection code. Compared, never interpreted: projection math is
    /// delegated to the caller.
    pub proj: i32,
    /// Projection zone.
    pub zone: i32,
    /// Cell count north-south.
    pub rows: i32,
    /// Cell count west-east.
    pub cols: i32,
    /// Cell count bottom-top.
    pub depths: i32,
    /// Northern extent.
    pub north: f64,
    /// Southern extent.
    pub south: f64,
    /// Eastern extent.
    pub east: f64,
    /// Western extent.
    pub west: f64,
    /// Upper vertical extent.
    pub top: f64,
    /// Lower vertical extent.
    pub bottom: f64,
    /// Cell size west-east.
    pub ew_res: f64,
    /// Cell size north-south.
    pub ns_res: f64,
    /// Cell size bottom-top.
    pub tb_res: f64,
    /// Free-form horizontal unit string, e.g. "meters".
    pub unit: String,
    /// Vertical unit code.
    pub vertical_unit: i32,
    /// Format version of the volume this region describes.
    pub version: i32,
}

/// The current format version written by this crate.
pub const REGION_VERSION: i32 = 2;

/// The query geometry is the same shape as the storage geometry.
pub type Window = Region;

impl Region {
    /// Recomputes the derived fields from the extents.
    ///
    /// Horizontal resolutions always follow from the extents and the cell
    /// counts. Vertically, a positive `depths` wins and fixes `tb_res`;
    /// otherwise `depths` is derived from `tb_res` (at least one slice).
    pub fn adjust(&mut self) -> VoxResult<()> {
        if self.depths > 0 {
            self.tb_res = (self.top - self.bottom) / f64::from(self.depths);
        } else {
            if self.tb_res <= 0.0 {
                return Err(VoxError::InvalidRegion("tb_res must be positive".into()));
            }
            self.depths = (((self.top - self.bottom) / self.tb_res).round() as i32).max(1);
        }
        self.ew_res = (self.east - self.west) / f64::from(self.cols);
        self.ns_res = (self.north - self.south) / f64::from(self.rows);
        self.validate()
    }

    /// Checks the shape invariants: positive cell counts and resolutions,
    /// extents ordered on every axis.
    pub fn validate(&self) -> VoxResult<()> {
        let fail = |msg: &str| Err(VoxError::InvalidRegion(msg.into()));
        if self.rows <= 0 || self.cols <= 0 || self.depths <= 0 {
            return fail("rows, cols and depths must be positive");
        }
        if self.ew_res <= 0.0 || self.ns_res <= 0.0 || self.tb_res <= 0.0 {
            return fail("resolutions must be positive");
        }
        if self.south >= self.north {
            return fail("south must be below north");
        }
        if self.west >= self.east {
            return fail("west must be below east");
        }
        if self.bottom >= self.top {
            return fail("bottom must be below top");
        }
        Ok(())
    }

    /// Number of cells in the region.
    #[must_use]
    pub fn cells(&self) -> i64 {
        i64::from(self.rows) * i64::from(self.cols) * i64::from(self.depths)
    }

    /// Whether `other` can be queried against this region. Only the
    /// projection identity is checked; extents may differ.
    #[must_use]
    pub fn compatible_with(&self, other: &Region) -> bool {
        self.proj == other.proj && self.zone == other.zone
    }

    /// Maps window cell coordinates to region cell coordinates (nearest
    /// lower cell of the window cell's centre).
    #[must_use]
    pub fn cell_from_window(&self, window: &Window, x: i32, y: i32, z: i32) -> (i32, i32, i32) {
        let north = window.north - (f64::from(y) + 0.5) * window.ns_res;
        let east = window.west + (f64::from(x) + 0.5) * window.ew_res;
        let height = window.bottom + (f64::from(z) + 0.5) * window.tb_res;
        let rx = ((east - self.west) / self.ew_res).floor() as i32;
        let ry = ((self.north - north) / self.ns_res).floor() as i32;
        let rz = ((height - self.bottom) / self.tb_res).floor() as i32;
        (rx, ry, rz)
    }
}

/// A small default region for construction sites and tests: one cell per
/// unit of extent.
#[must_use]
pub fn unit_region(rows: i32, cols: i32, depths: i32) -> Region {
    Region {
        proj: 0,
        zone: 0,
        rows,
        cols,
        depths,
        north: f64::from(rows),
        south: 0.0,
        east: f64::from(cols),
        west: 0.0,
        top: f64::from(depths),
        bottom: 0.0,
        ew_res: 1.0,
        ns_res: 1.0,
        tb_res: 1.0,
        unit: "none".to_string(),
        vertical_unit: 0,
        version: REGION_VERSION,
    }
}
