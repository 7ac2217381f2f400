//! Reprojection between WGS84 `(lon, lat)` degrees and metric UTM
//! `(easting, northing)` through `proj4rs`.

use geo::{Coord, MapCoords};
use proj4rs::proj::Proj;

use crate::error::Error;

const GEOGRAPHIC: &str = "+proj=longlat +ellps=GRS80 +no_defs";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Utm {
    pub zone: u8,
    pub northern: bool,
}

impl Utm {
    pub fn new(zone: u8, northern: bool) -> Self {
        Self { zone, northern }
    }

    /// EPSG code of the matching ETRS89 / UTM zone.
    pub fn epsg(&self) -> u32 {
        if self.northern {
            25800 + u32::from(self.zone)
        } else {
            32700 + u32::from(self.zone)
        }
    }

    fn proj_string(&self) -> String {
        let south = if self.northern { "" } else { " +south" };
        format!(
            "+proj=utm +zone={}{south} +ellps=GRS80 +units=m +no_defs",
            self.zone
        )
    }

    /// Geographic to projected.
    pub fn to_projected(&self) -> Result<Reprojection, Error> {
        Ok(Reprojection {
            from: parse(GEOGRAPHIC)?,
            to: parse(&self.proj_string())?,
            from_geographic: true,
        })
    }

    /// Projected back to geographic.
    pub fn to_geographic(&self) -> Result<Reprojection, Error> {
        Ok(Reprojection {
            from: parse(&self.proj_string())?,
            to: parse(GEOGRAPHIC)?,
            from_geographic: false,
        })
    }
}

fn parse(definition: &str) -> Result<Proj, Error> {
    Proj::from_proj_string(definition)
        .map_err(|err| Error::Projection(format!("{definition}: {err}")))
}

/// One direction of a UTM zone transform. Geographic coordinates are in
/// degrees on the outside; proj4rs wants radians.
pub struct Reprojection {
    from: Proj,
    to: Proj,
    from_geographic: bool,
}

impl Reprojection {
    pub fn convert(&self, coord: Coord<f64>) -> Result<Coord<f64>, Error> {
        let mut point = if self.from_geographic {
            (coord.x.to_radians(), coord.y.to_radians(), 0.0)
        } else {
            (coord.x, coord.y, 0.0)
        };
        proj4rs::transform::transform(&self.from, &self.to, &mut point)
            .map_err(|err| Error::Projection(format!("({}, {}): {err}", coord.x, coord.y)))?;
        Ok(if self.from_geographic {
            Coord {
                x: point.0,
                y: point.1,
            }
        } else {
            Coord {
                x: point.0.to_degrees(),
                y: point.1.to_degrees(),
            }
        })
    }

    pub fn apply<G>(&self, geometry: &G) -> Result<G, Error>
    where
        G: MapCoords<f64, f64, Output = G>,
    {
        geometry.try_map_coords(|c| self.convert(c))
    }
}

#[cfg(test)]
mod tests {
    use geo::{Rect, polygon};

    use super::*;

    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn central_meridian_on_equator() {
        let utm = Utm::new(32, true);
        let c = utm.to_projected().unwrap().convert(Coord { x: 9.0, y: 0.0 }).unwrap();
        assert!(close(c.x, 500_000.0, 1e-3), "{c:?}");
        assert!(close(c.y, 0.0, 1e-3), "{c:?}");
        assert_eq!(utm.epsg(), 25832);
    }

    #[test]
    fn hamburg_lands_in_zone_32() {
        let utm = Utm::new(32, true);
        let c = utm
            .to_projected()
            .unwrap()
            .convert(Coord { x: 10.0, y: 53.55 })
            .unwrap();
        assert!(c.x > 560_000.0 && c.x < 570_000.0, "{c:?}");
        assert!(c.y > 5_930_000.0 && c.y < 5_940_000.0, "{c:?}");
    }

    #[test]
    fn inverse_undoes_forward() {
        let utm = Utm::new(32, true);
        let (forward, inverse) = (utm.to_projected().unwrap(), utm.to_geographic().unwrap());
        for (lon, lat) in [(9.0, 0.0), (10.0, 53.55), (7.5, 47.3), (11.9, 60.1)] {
            let back = inverse
                .convert(forward.convert(Coord { x: lon, y: lat }).unwrap())
                .unwrap();
            assert!(close(back.x, lon, 1e-8), "{lon} -> {}", back.x);
            assert!(close(back.y, lat, 1e-8), "{lat} -> {}", back.y);
        }
    }

    #[test]
    fn southern_hemisphere_uses_false_northing() {
        let utm = Utm::new(33, false);
        let c = utm
            .to_projected()
            .unwrap()
            .convert(Coord { x: 15.0, y: -10.0 })
            .unwrap();
        assert!(c.y < 10_000_000.0 && c.y > 8_000_000.0, "{c:?}");
        let back = utm.to_geographic().unwrap().convert(c).unwrap();
        assert!(close(back.y, -10.0, 1e-8));
    }

    #[test]
    fn whole_geometries_are_reprojected() {
        let utm = Utm::new(32, true);
        let square = Rect::new(
            Coord {
                x: 565_000.0,
                y: 5_934_000.0,
            },
            Coord {
                x: 565_500.0,
                y: 5_934_500.0,
            },
        )
        .to_polygon();
        let geographic = utm.to_geographic().unwrap().apply(&square).unwrap();
        for c in geographic.exterior().coords() {
            assert!(c.x > 9.0 && c.x < 11.0 && c.y > 53.0 && c.y < 54.0, "{c:?}");
        }
        let back = utm.to_projected().unwrap().apply(&geographic).unwrap();
        let corner = back.exterior().0[0];
        assert!(close(corner.x, square.exterior().0[0].x, 1e-4));

        let triangle = polygon![(x: 9.0, y: 53.0), (x: 9.1, y: 53.0), (x: 9.0, y: 53.1)];
        assert!(utm.to_projected().unwrap().apply(&triangle).is_ok());
    }
}
