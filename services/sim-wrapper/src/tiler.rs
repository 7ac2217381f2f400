use geo::{Area, BooleanOps, MultiPolygon};
use serde::{Deserialize, Serialize};

use crate::{
    config::TilingConfig,
    geometry::{Bounds, Region},
};

/// One simulation sub-area.
///
/// The backend always simulates a square of `tile_size + 2 * buffer` whose
/// lower left corner is `origin`. Only `crop` of the output is kept, the
/// ring around it is unreliable.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    /// Unbuffered box: one grid cell, or the region's bounding box when the
    /// region fits into a single tile.
    pub inner: Bounds,
    /// `inner` grown by the buffer. Buildings are clipped to this box.
    pub extent: Bounds,
    pub frame: TileFrame,
    pub buildings: Region,
}

/// Placement of the backend's simulated square in world coordinates.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct TileFrame {
    pub origin_x: f64,
    pub origin_y: f64,
    pub size: f64,
    pub buffer: f64,
}

impl TileFrame {
    pub fn bounds(&self) -> Bounds {
        Bounds::new(
            self.origin_x,
            self.origin_y,
            self.origin_x + self.size,
            self.origin_y + self.size,
        )
    }

    /// Part of the simulated square that survives cropping.
    pub fn crop(&self) -> Bounds {
        self.bounds().expand(-self.buffer)
    }
}

pub struct Tiler {
    tile_size: f64,
    buffer: f64,
}

impl Tiler {
    pub fn new(config: &TilingConfig) -> Self {
        Self {
            tile_size: config.tile_size,
            buffer: config.buffer,
        }
    }

    fn make_tile(&self, row: usize, col: usize, inner: Bounds, region: &Region) -> Tile {
        let extent = inner.expand(self.buffer);
        Tile {
            row,
            col,
            inner,
            extent,
            frame: TileFrame {
                origin_x: extent.min_x,
                origin_y: extent.min_y,
                size: self.tile_size + 2.0 * self.buffer,
                buffer: self.buffer,
            },
            buildings: region.clip(&extent),
        }
    }

    /// Splits `region` into tiles, row-major from the bounding box's minimum
    /// corner. Returns nothing for an empty or zero-area region, or when the
    /// tile size is not a positive length.
    pub fn tile(&self, region: &Region) -> Vec<Tile> {
        if !(self.tile_size.is_finite() && self.tile_size > 0.0) {
            return vec![];
        }
        let Some(bbox) = region.bounds() else {
            return vec![];
        };
        if bbox.is_degenerate() || region.area() <= 0.0 {
            return vec![];
        }

        if bbox.width() <= self.tile_size && bbox.height() <= self.tile_size {
            return vec![self.make_tile(0, 0, bbox, region)];
        }

        let cols = (bbox.width() / self.tile_size).floor() as usize + 1;
        let rows = (bbox.height() / self.tile_size).floor() as usize + 1;
        let hull = MultiPolygon::new(vec![region.convex_hull()]);

        let mut tiles = Vec::new();
        let mut min_y = bbox.min_y;
        for row in 0..rows {
            // each edge is the previous cell's edge, so neighbours share it bit for bit
            let max_y = min_y + self.tile_size;
            let mut min_x = bbox.min_x;
            for col in 0..cols {
                let max_x = min_x + self.tile_size;
                let inner = Bounds::new(min_x, min_y, max_x, max_y);
                let overlap = hull.intersection(&inner.to_multi_polygon()).unsigned_area();
                if overlap > 0.0 {
                    tiles.push(self.make_tile(row, col, inner, region));
                }
                min_x = max_x;
            }
            min_y = max_y;
        }
        tiles
    }
}
