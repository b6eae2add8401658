//! Resampling between the query window and the storage region.
//!
//! A resampler is a capability handed to the map at open time; callers can
//! swap in their own interpolation. Everything in this crate reads through
//! [`NearestNeighbor`].

use std::rc::Rc;

use crate::error::VoxResult;
use crate::map::Map;
use crate::region::Window;

/// Maps one window cell to a value, using the map's region-relative
/// accessors.
pub trait Resampler {
    /// Samples window cell `(x, y, z)`.
    fn sample(&self, map: &mut Map, window: &Window, x: i32, y: i32, z: i32) -> VoxResult<f64>;
}

/// The default resampler: value of the region cell containing the window
/// cell's centre; null when the centre falls outside the region.
#[derive(Debug, Default)]
pub struct NearestNeighbor;

impl Resampler for NearestNeighbor {
    fn sample(&self, map: &mut Map, window: &Window, x: i32, y: i32, z: i32) -> VoxResult<f64> {
        let (rx, ry, rz) = map.region().cell_from_window(window, x, y, z);
        if !map.layout().coord_in_range(rx, ry, rz) {
            return Ok(crate::codec::null_f64());
        }
        map.get_f64(rx, ry, rz)
    }
}

/// Shared resampler handle stored on a map.
pub type ResamplerHandle = Rc<dyn Resampler>;
