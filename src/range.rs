//! Persistent min/max range of the non-null cells of a volume.
//!
//! The sidecar holds two big-endian f64 values, or nothing at all when the
//! volume never saw a non-null cell.

use std::fs::File;
use std::path::Path;

use crate::codec::{read_f64s, write_f64s};
use crate::error::VoxResult;
use crate::header::RANGE_ELEMENT;

/// Running range over observed non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FpRange {
    minmax: Option<(f64, f64)>,
}

impl FpRange {
    /// Folds one non-null value into the range.
    pub fn update(&mut self, v: f64) {
        self.minmax = Some(match self.minmax {
            None => (v, v),
            Some((min, max)) => (min.min(v), max.max(v)),
        });
    }

    /// `(min, max)` of everything seen, or `None` for an all-null volume.
    #[must_use]
    pub fn get(&self) -> Option<(f64, f64)> {
        self.minmax
    }

    /// Writes the sidecar into a volume directory.
    pub fn write_to(&self, dir: &Path) -> VoxResult<()> {
        let mut file = File::create(dir.join(RANGE_ELEMENT))?;
        if let Some((min, max)) = self.minmax {
            write_f64s(&mut file, &[min, max])?;
        }
        Ok(())
    }

    /// Reads the sidecar; a missing or empty file is the all-null range.
    pub fn read_from(dir: &Path) -> VoxResult<Self> {
        let path = dir.join(RANGE_ELEMENT);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Self::default());
        }
        let mut pair = [0.0f64; 2];
        read_f64s(&mut file, &mut pair)?;
        Ok(Self { minmax: Some((pair[0], pair[1])) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_tracks_extremes() {
        let mut range = FpRange::default();
        assert_eq!(range.get(), None);
        range.update(3.5);
        assert_eq!(range.get(), Some((3.5, 3.5)));
        range.update(-1.0);
        range.update(2.0);
        assert_eq!(range.get(), Some((-1.0, 3.5)));
    }

    #[test]
    fn sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut range = FpRange::default();
        range.update(1.25);
        range.update(9.75);
        range.write_to(dir.path()).unwrap();
        assert_eq!(FpRange::read_from(dir.path()).unwrap(), range);
    }

    #[test]
    fn empty_sidecar_is_all_null() {
        let dir = tempfile::tempdir().unwrap();
        FpRange::default().write_to(dir.path()).unwrap();
        assert_eq!(FpRange::read_from(dir.path()).unwrap().get(), None);
    }

    #[test]
    fn missing_sidecar_is_all_null() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(FpRange::read_from(dir.path()).unwrap().get(), None);
    }
}
