use std::collections::HashMap;

use geo::{
    Area, BooleanOps, BoundingRect, ConvexHull, Coord, MapCoords, MultiPolygon, Polygon, Rect,
    Translate,
};
use geojson::{Feature, FeatureCollection, JsonObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const DEFAULT_HEIGHT: f64 = 10.0;
pub const DEFAULT_USE: &str = "residential";

/// Axis aligned box in the projected CRS.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Square of side `size` anchored at `min`.
    pub fn square(min: Coord<f64>, size: f64) -> Self {
        Self::new(min.x, min.y, min.x + size, min.y + size)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn min(&self) -> Coord<f64> {
        Coord {
            x: self.min_x,
            y: self.min_y,
        }
    }

    /// Grows the box by `d` on every side; negative `d` shrinks it.
    pub fn expand(&self, d: f64) -> Self {
        Self::new(self.min_x - d, self.min_y - d, self.max_x + d, self.max_y + d)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        Rect::new(self.min(), Coord {
            x: self.max_x,
            y: self.max_y,
        })
        .to_polygon()
    }

    pub fn to_multi_polygon(&self) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![self.to_polygon()])
    }
}

impl From<Rect<f64>> for Bounds {
    fn from(rect: Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Building {
    pub footprint: MultiPolygon<f64>,
    pub height: f64,
    pub building_use: String,
}

impl Building {
    /// One building per polygon; the backend rejects multipolygons.
    pub fn explode(&self) -> impl Iterator<Item = infrared::BuildingSpec> + '_ {
        self.footprint
            .iter()
            .map(|polygon| infrared::BuildingSpec {
                footprint: polygon.clone(),
                height: self.height,
                building_use: self.building_use.clone(),
            })
    }

    fn to_feature(&self) -> Feature {
        let mut properties = JsonObject::new();
        properties.insert("height".to_string(), self.height.into());
        properties.insert("use".to_string(), self.building_use.clone().into());
        feature(&self.footprint, properties)
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn multi_polygon(feature: &Feature) -> Result<Option<MultiPolygon<f64>>, Error> {
    let Some(geometry) = &feature.geometry else {
        return Ok(None);
    };
    match geo::Geometry::<f64>::try_from(geometry.value.clone())? {
        geo::Geometry::Polygon(polygon) => Ok(Some(MultiPolygon::new(vec![polygon]))),
        geo::Geometry::MultiPolygon(multi) => Ok(Some(multi)),
        other => Err(Error::InvalidRequest(format!(
            "building geometry must be a polygon, got {other:?}"
        ))),
    }
}

fn feature(geometry: &MultiPolygon<f64>, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Building footprints to simulate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Region {
    pub buildings: Vec<Building>,
}

impl Region {
    pub fn from_feature_collection(collection: &FeatureCollection) -> Result<Self, Error> {
        let mut buildings = Vec::with_capacity(collection.features.len());
        for feature in &collection.features {
            let Some(footprint) = multi_polygon(feature)? else {
                continue;
            };
            buildings.push(Building {
                footprint,
                height: number(feature.property("height")).unwrap_or(DEFAULT_HEIGHT),
                building_use: feature
                    .property("use")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_USE)
                    .to_string(),
            });
        }
        Ok(Self { buildings })
    }

    pub fn to_feature_collection(&self) -> FeatureCollection {
        FeatureCollection {
            bbox: None,
            features: self.buildings.iter().map(Building::to_feature).collect(),
            foreign_members: None,
        }
    }

    pub fn footprint(&self) -> MultiPolygon<f64> {
        self.buildings
            .iter()
            .flat_map(|b| b.footprint.iter().cloned())
            .collect()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.footprint().bounding_rect().map(Bounds::from)
    }

    pub fn area(&self) -> f64 {
        self.footprint().unsigned_area()
    }

    pub fn convex_hull(&self) -> Polygon<f64> {
        self.footprint().convex_hull()
    }

    pub fn map_coords(&self, f: impl Fn(Coord<f64>) -> Coord<f64> + Copy) -> Self {
        Self {
            buildings: self
                .buildings
                .iter()
                .map(|b| Building {
                    footprint: b.footprint.map_coords(f),
                    ..b.clone()
                })
                .collect(),
        }
    }

    pub fn try_map_coords<E>(
        &self,
        f: impl Fn(Coord<f64>) -> Result<Coord<f64>, E> + Copy,
    ) -> Result<Self, E> {
        let buildings = self
            .buildings
            .iter()
            .map(|b| {
                Ok(Building {
                    footprint: b.footprint.try_map_coords(f)?,
                    ..b.clone()
                })
            })
            .collect::<Result<_, E>>()?;
        Ok(Self { buildings })
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        self.map_coords(|c| Coord {
            x: c.x + dx,
            y: c.y + dy,
        })
    }

    /// Buildings cut to `bounds`. Buildings entirely outside are dropped.
    pub fn clip(&self, bounds: &Bounds) -> Self {
        let mask = bounds.to_multi_polygon();
        let buildings = self
            .buildings
            .iter()
            .filter_map(|b| {
                let footprint = b.footprint.intersection(&mask);
                (footprint.unsigned_area() > 0.0).then(|| Building {
                    footprint,
                    ..b.clone()
                })
            })
            .collect();
        Self { buildings }
    }
}

/// Polygons sharing one result value.
#[derive(Clone, Debug, PartialEq)]
pub struct ValuedArea {
    pub value: f64,
    pub area: MultiPolygon<f64>,
}

impl ValuedArea {
    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self {
            value: self.value,
            area: self.area.translate(dx, dy),
        }
    }
}

fn union_all(mut parts: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    // pairwise rounds keep the operands of each union similarly sized
    while parts.len() > 1 {
        let mut merged = Vec::with_capacity(parts.len().div_ceil(2));
        let mut iter = parts.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => merged.push(a.union(&b)),
                None => merged.push(a),
            }
        }
        parts = merged;
    }
    parts.pop().unwrap_or_else(|| MultiPolygon::new(vec![]))
}

/// Merges all areas with an identical value into one multipolygon per value,
/// ordered by value.
pub fn dissolve(areas: impl IntoIterator<Item = ValuedArea>) -> Vec<ValuedArea> {
    let mut groups: HashMap<u64, (f64, Vec<MultiPolygon<f64>>)> = HashMap::new();
    for area in areas {
        groups
            .entry(area.value.to_bits())
            .or_insert_with(|| (area.value, Vec::new()))
            .1
            .push(area.area);
    }
    let mut dissolved = groups
        .into_values()
        .map(|(value, parts)| ValuedArea {
            value,
            area: union_all(parts),
        })
        .filter(|a| !a.area.0.is_empty())
        .collect::<Vec<_>>();
    dissolved.sort_by(|a, b| a.value.total_cmp(&b.value));
    dissolved
}

/// Cuts every area to `bounds`, dropping what falls outside.
pub fn crop(areas: &[ValuedArea], bounds: &Bounds) -> Vec<ValuedArea> {
    let mask = bounds.to_multi_polygon();
    areas
        .iter()
        .map(|a| ValuedArea {
            value: a.value,
            area: a.area.intersection(&mask),
        })
        .filter(|a| a.area.unsigned_area() > 0.0)
        .collect()
}

pub fn to_feature_collection(areas: &[ValuedArea]) -> FeatureCollection {
    let features = areas
        .iter()
        .map(|a| {
            let mut properties = JsonObject::new();
            properties.insert("value".to_string(), a.value.into());
            feature(&a.area, properties)
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn from_feature_collection(collection: &FeatureCollection) -> Result<Vec<ValuedArea>, Error> {
    let mut areas = Vec::with_capacity(collection.features.len());
    for feature in &collection.features {
        let Some(area) = multi_polygon(feature)? else {
            continue;
        };
        let value = number(feature.property("value"))
            .ok_or_else(|| Error::MalformedResult("feature without value".to_string()))?;
        areas.push(ValuedArea { value, area });
    }
    Ok(areas)
}
