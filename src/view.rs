use anyhow::{bail, Result};
use geo::Point;
use serde::{Deserialize, Serialize};

use crate::types::{Category, DisplayMode, PointRecord};

/// Per-category visibility. All categories start visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFlags {
    pub student: bool,
    pub lodging: bool,
    pub beneficiary: bool,
}

impl Default for CategoryFlags {
    fn default() -> Self {
        CategoryFlags { student: true, lodging: true, beneficiary: true }
    }
}

impl CategoryFlags {
    pub fn enabled(&self, category: Category) -> bool {
        match category {
            Category::Student => self.student,
            Category::Lodging => self.lodging,
            Category::Beneficiary => self.beneficiary,
        }
    }

    pub fn set(&mut self, category: Category, visible: bool) {
        match category {
            Category::Student => self.student = visible,
            Category::Lodging => self.lodging = visible,
            Category::Beneficiary => self.beneficiary = visible,
        }
    }
}

/// UI-owned state: display mode, visibility flags and the map center. The
/// visible point set is derived from these on demand and has no lifecycle of
/// its own.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub mode: DisplayMode,
    pub flags: CategoryFlags,
    pub center: Point<f64>,
    pub zoom: u8,
}

impl ViewState {
    pub fn new(center: Point<f64>, zoom: u8) -> Self {
        ViewState { mode: DisplayMode::default(), flags: CategoryFlags::default(), center, zoom }
    }

    /// The subset of `raw` whose category is currently enabled. Pure and
    /// idempotent: re-applying the same flags yields the same set.
    pub fn visible_points(&self, raw: &[PointRecord]) -> Vec<PointRecord> {
        raw.iter().filter(|p| self.flags.enabled(p.category)).cloned().collect()
    }

    /// Manual center input. Rejects non-finite or out-of-range coordinates
    /// without mutating the current center.
    pub fn set_center(&mut self, lat: f64, lon: f64) -> Result<()> {
        if !lat.is_finite() || !lon.is_finite() {
            bail!("coordinates must be finite numbers");
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            bail!("coordinates out of range: lat {}, lon {}", lat, lon);
        }
        self.center = Point::new(lon, lat);
        Ok(())
    }
}
