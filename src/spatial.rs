//! Query regions and footprint intersection.
//!
//! A [`Region`] is a validated `W/E/S/N` box. Intersection tests go through
//! the `geo` crate when the `spatial` feature is enabled; without it,
//! [`intersects`] returns `None` and callers treat the spatial filter as a
//! no-op.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::models::Geometry;
#[cfg(feature = "spatial")]
use crate::models::Position;

#[derive(Debug, Error, PartialEq)]
pub enum RegionError {
    #[error("region must have four components W/E/S/N, got {0:?}")]
    Arity(String),
    #[error("region component {0:?} is not a number")]
    NotANumber(String),
    #[error("region bounds must be finite")]
    NonFinite,
    #[error("inverted or empty region: west {west} >= east {east} or south {south} >= north {north}")]
    Inverted {
        west: f64,
        east: f64,
        south: f64,
        north: f64,
    },
}

/// A geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub west: f64,
    pub east: f64,
    pub south: f64,
    pub north: f64,
}

impl Region {
    /// Build a region, rejecting non-finite, inverted and degenerate boxes.
    pub fn new(west: f64, east: f64, south: f64, north: f64) -> Result<Self, RegionError> {
        if ![west, east, south, north].iter().all(|v| v.is_finite()) {
            return Err(RegionError::NonFinite);
        }
        if west >= east || south >= north {
            return Err(RegionError::Inverted {
                west,
                east,
                south,
                north,
            });
        }
        Ok(Self {
            west,
            east,
            south,
            north,
        })
    }

    pub fn to_geometry(&self) -> Geometry {
        Geometry::rectangle(self.west, self.east, self.south, self.north)
    }
}

impl FromStr for Region {
    type Err = RegionError;

    /// Parses `W/E/S/N`; commas are accepted as separators too.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(['/', ',']).map(str::trim).collect();
        if parts.len() != 4 {
            return Err(RegionError::Arity(s.to_string()));
        }
        let mut vals = [0.0f64; 4];
        for (slot, part) in vals.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| RegionError::NotANumber(part.to_string()))?;
        }
        Region::new(vals[0], vals[1], vals[2], vals[3])
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.west, self.east, self.south, self.north)
    }
}

/// Whether `geometry` intersects `region`.
///
/// `None` means the answer is unknown: no geometry engine is compiled in,
/// or the geometry is one the engine cannot read.
#[cfg(feature = "spatial")]
pub fn intersects(geometry: &Geometry, region: &Region) -> Option<bool> {
    use geo::{coord, Intersects, Rect};

    let rect = Rect::new(
        coord! { x: region.west, y: region.south },
        coord! { x: region.east, y: region.north },
    );
    to_geo(geometry).map(|g| g.intersects(&rect))
}

#[cfg(not(feature = "spatial"))]
pub fn intersects(_geometry: &Geometry, _region: &Region) -> Option<bool> {
    None
}

#[cfg(feature = "spatial")]
fn to_geo(geometry: &Geometry) -> Option<geo::Geometry<f64>> {
    use geo::{MultiLineString, MultiPoint, MultiPolygon, Point};

    let g = match geometry {
        Geometry::Point(p) => geo::Geometry::Point(Point::from(to_coord(p)?)),
        Geometry::MultiPoint(ps) => geo::Geometry::MultiPoint(MultiPoint::new(
            ps.iter()
                .map(|p| to_coord(p).map(Point::from))
                .collect::<Option<_>>()?,
        )),
        Geometry::LineString(ps) => geo::Geometry::LineString(to_line(ps)?),
        Geometry::MultiLineString(ls) => geo::Geometry::MultiLineString(MultiLineString::new(
            ls.iter().map(|l| to_line(l)).collect::<Option<_>>()?,
        )),
        Geometry::Polygon(rings) => geo::Geometry::Polygon(to_polygon(rings)?),
        Geometry::MultiPolygon(polys) => geo::Geometry::MultiPolygon(MultiPolygon::new(
            polys.iter().map(|r| to_polygon(r)).collect::<Option<_>>()?,
        )),
        Geometry::Other(_) => return None,
    };
    Some(g)
}

/// `x` and `y` of a position; a trailing `z` is ignored.
#[cfg(feature = "spatial")]
fn to_coord(p: &[f64]) -> Option<geo::Coord<f64>> {
    match p {
        [x, y, ..] => Some(geo::coord! { x: *x, y: *y }),
        _ => None,
    }
}

#[cfg(feature = "spatial")]
fn to_line(ps: &[Position]) -> Option<geo::LineString<f64>> {
    ps.iter()
        .map(|p| to_coord(p))
        .collect::<Option<Vec<_>>>()
        .map(geo::LineString::new)
}

#[cfg(feature = "spatial")]
fn to_polygon(rings: &[Vec<Position>]) -> Option<geo::Polygon<f64>> {
    let mut rings = rings
        .iter()
        .map(|r| to_line(r))
        .collect::<Option<Vec<_>>>()?
        .into_iter();
    let exterior = rings.next()?;
    Some(geo::Polygon::new(exterior, rings.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slash_and_comma_forms() {
        let a: Region = "-120/-110/30/40".parse().unwrap();
        let b: Region = "-120, -110, 30, 40".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "-120/-110/30/40");
    }

    #[test]
    fn rejects_inverted_and_degenerate() {
        assert!(matches!(
            "10/0/0/10".parse::<Region>(),
            Err(RegionError::Inverted { .. })
        ));
        assert!(matches!(
            "0/10/5/5".parse::<Region>(),
            Err(RegionError::Inverted { .. })
        ));
        assert_eq!(
            Region::new(f64::NAN, 1.0, 0.0, 1.0),
            Err(RegionError::NonFinite)
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!("1/2/3".parse::<Region>(), Err(RegionError::Arity(_))));
        assert!(matches!(
            "a/2/3/4".parse::<Region>(),
            Err(RegionError::NotANumber(_))
        ));
    }

    #[cfg(feature = "spatial")]
    #[test]
    fn intersection_against_rectangles() {
        let region = Region::new(0.0, 10.0, 0.0, 10.0).unwrap();
        let inside = Geometry::rectangle(2.0, 3.0, 2.0, 3.0);
        let overlapping = Geometry::rectangle(8.0, 12.0, -2.0, 1.0);
        let outside = Geometry::rectangle(20.0, 30.0, 20.0, 30.0);
        assert_eq!(intersects(&inside, &region), Some(true));
        assert_eq!(intersects(&overlapping, &region), Some(true));
        assert_eq!(intersects(&outside, &region), Some(false));

        let multi = Geometry::MultiPolygon(vec![
            match outside {
                Geometry::Polygon(r) => r,
                _ => unreachable!(),
            },
            match inside {
                Geometry::Polygon(r) => r,
                _ => unreachable!(),
            },
        ]);
        assert_eq!(intersects(&multi, &region), Some(true));
    }

    #[cfg(feature = "spatial")]
    #[test]
    fn intersection_reads_xy_of_3d_and_non_polygon_shapes() {
        let region = Region::new(0.0, 10.0, 0.0, 10.0).unwrap();
        let tall = Geometry::Polygon(vec![vec![
            vec![1.0, 1.0, 50.0],
            vec![2.0, 1.0, 50.0],
            vec![2.0, 2.0, 50.0],
            vec![1.0, 1.0, 50.0],
        ]]);
        assert_eq!(intersects(&tall, &region), Some(true));
        assert_eq!(intersects(&Geometry::Point(vec![5.0, 5.0]), &region), Some(true));
        assert_eq!(intersects(&Geometry::Point(vec![50.0, 5.0]), &region), Some(false));
        let crossing = Geometry::LineString(vec![vec![-5.0, 5.0], vec![15.0, 5.0]]);
        assert_eq!(intersects(&crossing, &region), Some(true));

        assert_eq!(intersects(&Geometry::Point(vec![5.0]), &region), None);
        assert_eq!(
            intersects(&Geometry::Other(serde_json::json!({"type": "GeometryCollection"})), &region),
            None
        );
    }
}
