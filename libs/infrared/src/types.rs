use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// A backend project. Projects are the leasable workspaces ("slots").
    ProjectId
);
id_type!(
    /// The root snapshot of a project; geometry and analyses hang off it.
    SnapshotId
);
id_type!(
    /// Opaque handle returned when an analysis is triggered.
    AnalysisHandle
);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: String,
}

/// Parameters for creating a new, empty project at the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectSpec {
    pub name: String,
    /// Analysis grid resolution in metres.
    pub resolution: u32,
    pub south_west_lat: f64,
    pub south_west_lon: f64,
    /// Edge length of the square project area in metres.
    pub size: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    Building,
    StreetSegment,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GeometryObject {
    pub id: String,
    pub kind: GeometryKind,
}

/// A single building footprint in the project's local metric frame.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildingSpec {
    pub footprint: geo::Polygon<f64>,
    pub height: f64,
    pub building_use: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum Analysis {
    WindComfort { wind_direction: u32, wind_speed: u32 },
    SunlightHours,
}

/// Per-object outcome of a batched create or delete call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.succeeded.extend(other.succeeded);
        self.failed += other.failed;
    }
}

/// The backend's native analysis output: a regular grid of normalised values
/// in the project's local metric frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RawResult {
    #[serde(rename = "analysisOutputN")]
    pub north: f64,
    #[serde(rename = "analysisOutputE")]
    pub east: f64,
    #[serde(rename = "analysisOutputS")]
    pub south: f64,
    #[serde(rename = "analysisOutputW")]
    pub west: f64,
    #[serde(rename = "analysisOutputX")]
    pub resolution_x: usize,
    #[serde(rename = "analysisOutputY")]
    pub resolution_y: usize,
    #[serde(rename = "analysisOutputData")]
    pub data: Vec<Vec<f64>>,
}

impl RawResult {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// `resolution_x` / `resolution_y` count grid lines, so the grid has one
    /// cell fewer per axis. Checks that `data` covers every cell.
    pub fn is_well_formed(&self) -> bool {
        let (cols, rows) = (
            self.resolution_x.saturating_sub(1),
            self.resolution_y.saturating_sub(1),
        );
        cols > 0
            && rows > 0
            && self.data.len() >= rows
            && self.data.iter().take(rows).all(|row| row.len() >= cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_result_uses_backend_field_names() {
        let json = serde_json::json!({
            "analysisOutputN": 700.0,
            "analysisOutputE": 700.0,
            "analysisOutputS": 0.0,
            "analysisOutputW": 0.0,
            "analysisOutputX": 2,
            "analysisOutputY": 2,
            "analysisOutputData": [[0.2, 0.4], [0.6, 0.8]],
        });
        let raw: RawResult = serde_json::from_value(json).unwrap();
        assert_eq!(raw.width(), 700.0);
        assert_eq!(raw.height(), 700.0);
        assert!(raw.is_well_formed());
    }

    #[test]
    fn short_rows_are_not_well_formed() {
        let raw = RawResult {
            north: 1.0,
            east: 1.0,
            south: 0.0,
            west: 0.0,
            resolution_x: 3,
            resolution_y: 2,
            data: vec![vec![0.0]],
        };
        assert!(!raw.is_well_formed());
    }

    #[test]
    fn batch_outcome_merge() {
        let mut a = BatchOutcome {
            succeeded: vec!["a".into()],
            failed: 0,
        };
        a.merge(BatchOutcome {
            succeeded: vec!["b".into()],
            failed: 2,
        });
        assert_eq!(a.succeeded.len(), 2);
        assert!(!a.is_complete());
    }
}
