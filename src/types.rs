use std::fmt;
use std::str::FromStr;

use geo::Point;
use serde::{Deserialize, Serialize};

/// Which source population a record belongs to. Attached explicitly at load
/// time; never re-derived after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Student,
    Lodging,
    Beneficiary,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Student, Category::Lodging, Category::Beneficiary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Student => "student",
            Category::Lodging => "lodging",
            Category::Beneficiary => "beneficiary",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One geocoded location with its display label and category tag.
///
/// Invariant: `position` is always finite; the loader drops anything else
/// before a record is built.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub position: Point<f64>,
    pub label: String,
    pub category: Category,
}

impl PointRecord {
    pub fn lat(&self) -> f64 {
        self.position.y()
    }

    pub fn lon(&self) -> f64 {
        self.position.x()
    }
}

/// Rendering strategy for the visible point set. Exactly one is active at a
/// time; switching is a full layer replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Markers,
    Heatmap,
    Cluster,
}

impl DisplayMode {
    pub const ALL: [DisplayMode; 3] =
        [DisplayMode::Markers, DisplayMode::Heatmap, DisplayMode::Cluster];

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Markers => "markers",
            DisplayMode::Heatmap => "heatmap",
            DisplayMode::Cluster => "cluster",
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markers" => Ok(DisplayMode::Markers),
            "heatmap" => Ok(DisplayMode::Heatmap),
            "cluster" => Ok(DisplayMode::Cluster),
            other => Err(anyhow::anyhow!("unknown display mode: {}", other)),
        }
    }
}
