//! Spatial values decoded from GEOMETRY columns.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LineString {
    pub points: Vec<Point>,
}

/// A polygon: the first ring is the exterior, the rest are holes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polygon {
    pub rings: Vec<LineString>,
}

/// A geometry value of one of the supported well-known shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Point),
    LineString(LineString),
    Polygon(Polygon),
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl LineString {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// A ring is closed when its first and last points coincide.
    pub fn is_closed(&self) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => self.points.len() > 1 && first == last,
            _ => false,
        }
    }
}

impl Polygon {
    pub fn new(rings: Vec<LineString>) -> Self {
        Self { rings }
    }
}

impl Geometry {
    /// Well-known-text type name.
    pub const fn wkt_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "POINT",
            Geometry::LineString(_) => "LINESTRING",
            Geometry::Polygon(_) => "POLYGON",
        }
    }

    /// Render as well-known text, e.g. `POINT(1 2)`.
    pub fn to_wkt(&self) -> String {
        self.to_string()
    }
}

fn write_points(f: &mut fmt::Formatter<'_>, points: &[Point]) -> fmt::Result {
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{} {}", point.x, point.y)?;
    }
    Ok(())
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Point(p) => write!(f, "POINT({} {})", p.x, p.y),
            Geometry::LineString(line) => {
                f.write_str("LINESTRING(")?;
                write_points(f, &line.points)?;
                f.write_str(")")
            }
            Geometry::Polygon(polygon) => {
                f.write_str("POLYGON(")?;
                for (i, ring) in polygon.rings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    f.write_str("(")?;
                    write_points(f, &ring.points)?;
                    f.write_str(")")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wkt_rendering() {
        let point = Geometry::Point(Point::new(1.0, 2.5));
        assert_eq!(point.to_wkt(), "POINT(1 2.5)");

        let line = Geometry::LineString(LineString::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
        ]));
        assert_eq!(line.to_wkt(), "LINESTRING(0 0,1 1)");

        let ring = LineString::new(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 0.0),
        ]);
        assert!(ring.is_closed());
        let polygon = Geometry::Polygon(Polygon::new(vec![ring]));
        assert_eq!(polygon.to_wkt(), "POLYGON((0 0,0 1,1 1,0 0))");
        assert_eq!(polygon.wkt_name(), "POLYGON");
    }
}
