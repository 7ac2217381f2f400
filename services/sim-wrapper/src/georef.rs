//! Turns the backend's raw grid into dissolved, world positioned polygons.

use geojson::FeatureCollection;
use infrared::RawResult;

use crate::{
    crs::Utm,
    error::Error,
    geometry::{self, Bounds, ValuedArea},
    tiler::TileFrame,
};

const EXTENT_TOLERANCE: f64 = 1e-6;

/// `n` evenly spaced values from `start` to `end`, both included.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![start; n];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
        .collect()
}

pub fn check_dimensions(raw: &RawResult, expected: f64) -> Result<(), Error> {
    if (raw.width() - expected).abs() > EXTENT_TOLERANCE
        || (raw.height() - expected).abs() > EXTENT_TOLERANCE
    {
        return Err(Error::ResultDimensions {
            width: raw.width(),
            height: raw.height(),
            expected,
        });
    }
    if !raw.is_well_formed() {
        return Err(Error::MalformedResult(format!(
            "{} rows for a {}x{} grid",
            raw.data.len(),
            raw.resolution_x,
            raw.resolution_y
        )));
    }
    Ok(())
}

/// One rectangle per run of equal values within a grid row, in the grid's
/// local frame. Row `i` spans `y[i]..y[i + 1]`.
pub fn cells(raw: &RawResult) -> Vec<ValuedArea> {
    let xs = linspace(raw.west, raw.east, raw.resolution_x);
    let ys = linspace(raw.south, raw.north, raw.resolution_y);
    let cols = raw.resolution_x.saturating_sub(1);
    let mut cells = Vec::new();
    for (i, row) in raw.data.iter().take(raw.resolution_y.saturating_sub(1)).enumerate() {
        let mut start = 0;
        while start < cols {
            let value = row[start];
            let mut end = start + 1;
            while end < cols && row[end].to_bits() == value.to_bits() {
                end += 1;
            }
            if value.is_finite() {
                cells.push(ValuedArea {
                    value,
                    area: Bounds::new(xs[start], ys[i], xs[end], ys[i + 1]).to_multi_polygon(),
                });
            }
            start = end;
        }
    }
    cells
}

/// Moves local cells into the frame, drops the buffer ring and merges equal
/// values. Output stays in the projected CRS.
pub fn place(cells: Vec<ValuedArea>, frame: &TileFrame) -> Vec<ValuedArea> {
    let placed: Vec<_> = cells
        .iter()
        .map(|c| c.translate(frame.origin_x, frame.origin_y))
        .collect();
    geometry::dissolve(geometry::crop(&placed, &frame.crop()))
}

pub struct Georeferencer {
    utm: Utm,
    expected_size: f64,
}

impl Georeferencer {
    pub fn new(utm: Utm, expected_size: f64) -> Self {
        Self { utm, expected_size }
    }

    pub fn georeference(
        &self,
        raw: &RawResult,
        frame: &TileFrame,
    ) -> Result<FeatureCollection, Error> {
        check_dimensions(raw, self.expected_size)?;
        let geographic = self.utm.to_geographic()?;
        let areas = place(cells(raw), frame)
            .into_iter()
            .map(|a| {
                Ok(ValuedArea {
                    value: a.value,
                    area: geographic.apply(&a.area)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(geometry::to_feature_collection(&areas))
    }
}
