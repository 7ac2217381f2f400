use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::Error, geometry::Region, tiler::TileFrame};

pub const MAX_WIND_SPEED: u32 = 80;
pub const MAX_WIND_DIRECTION: u32 = 360;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SimKind {
    Wind,
    Sun,
}

impl SimKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimKind::Wind => "wind",
            SimKind::Sun => "sun",
        }
    }
}

impl fmt::Display for SimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wind" => Ok(SimKind::Wind),
            "sun" => Ok(SimKind::Sun),
            other => Err(Error::InvalidRequest(format!("unknown simulation kind {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimParams {
    /// Speed in km/h, direction in degrees.
    Wind { wind_speed: u32, wind_direction: u32 },
    Sun,
}

impl SimParams {
    pub fn kind(&self) -> SimKind {
        match self {
            SimParams::Wind { .. } => SimKind::Wind,
            SimParams::Sun => SimKind::Sun,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let SimParams::Wind {
            wind_speed,
            wind_direction,
        } = *self
        {
            if wind_speed > MAX_WIND_SPEED {
                return Err(Error::InvalidRequest(format!(
                    "wind_speed must be within 0..={MAX_WIND_SPEED}, got {wind_speed}"
                )));
            }
            if wind_direction > MAX_WIND_DIRECTION {
                return Err(Error::InvalidRequest(format!(
                    "wind_direction must be within 0..={MAX_WIND_DIRECTION}, got {wind_direction}"
                )));
            }
        }
        Ok(())
    }

    pub fn analysis(&self) -> infrared::Analysis {
        match *self {
            SimParams::Wind {
                wind_speed,
                wind_direction,
            } => infrared::Analysis::WindComfort {
                wind_direction,
                wind_speed,
            },
            SimParams::Sun => infrared::Analysis::SunlightHours,
        }
    }
}

/// One tile's unit of work.
#[derive(Clone, Debug)]
pub struct SimulationTask {
    pub frame: TileFrame,
    /// Buildings clipped to the tile, in world coordinates.
    pub buildings: Region,
    pub params: SimParams,
}

fn sha256_hex(value: &serde_json::Value) -> String {
    // serde_json maps are ordered, so equal values serialize identically
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

impl SimulationTask {
    /// Cache key over the task's semantic inputs. Wind keys carry a second
    /// hash over the wind parameters.
    pub fn content_key(&self) -> String {
        let inputs = serde_json::json!({
            "buildings": self.buildings.to_feature_collection(),
            "simulation_area": geojson::Value::from(&self.frame.bounds().to_polygon()),
        });
        let key = sha256_hex(&inputs);
        match self.params {
            SimParams::Wind {
                wind_speed,
                wind_direction,
            } => {
                let settings = serde_json::json!({
                    "wind_speed": wind_speed,
                    "wind_direction": wind_direction,
                });
                format!("{key}_{}", sha256_hex(&settings))
            }
            SimParams::Sun => key,
        }
    }
}

/// Lawson comfort classes behind the six normalised wind comfort values.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindComfort {
    SittingLong,
    SittingShort,
    WalkingSlow,
    WalkingFast,
    Uncomfortable,
    Dangerous,
}

impl WindComfort {
    pub const ALL: [WindComfort; 6] = [
        WindComfort::SittingLong,
        WindComfort::SittingShort,
        WindComfort::WalkingSlow,
        WindComfort::WalkingFast,
        WindComfort::Uncomfortable,
        WindComfort::Dangerous,
    ];

    pub fn value(&self) -> f64 {
        match self {
            WindComfort::SittingLong => 0.0,
            WindComfort::SittingShort => 0.2,
            WindComfort::WalkingSlow => 0.4,
            WindComfort::WalkingFast => 0.6,
            WindComfort::Uncomfortable => 0.8,
            WindComfort::Dangerous => 1.0,
        }
    }

    pub fn from_value(value: f64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| (c.value() - value).abs() < 1e-9)
    }

    pub fn label(&self) -> &'static str {
        match self {
            WindComfort::SittingLong => "Sitting Long",
            WindComfort::SittingShort => "Sitting Short",
            WindComfort::WalkingSlow => "Walking Slow",
            WindComfort::WalkingFast => "Walking Fast",
            WindComfort::Uncomfortable => "Uncomfortable",
            WindComfort::Dangerous => "Dangerous",
        }
    }
}

/// Sunlight values are fractions of a 12 hour day.
pub fn sunlight_hours(value: f64) -> f64 {
    value * 12.0
}
