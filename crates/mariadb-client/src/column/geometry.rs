//! Geometry values: a 4-byte SRID followed by well-known binary.

use mariadb_core::{Geometry, LineString, Point, Polygon};

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;

struct Wkb<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> Wkb<'a> {
    fn bytes<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.data.get(self.pos..self.pos + N)?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Some(out)
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.bytes::<4>()?;
        Some(if self.little_endian {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn f64(&mut self) -> Option<f64> {
        let b = self.bytes::<8>()?;
        Some(if self.little_endian {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        })
    }

    fn point(&mut self) -> Option<Point> {
        Some(Point::new(self.f64()?, self.f64()?))
    }

    fn line(&mut self) -> Option<LineString> {
        let count = self.u32()? as usize;
        // each point needs 16 bytes; reject counts the buffer cannot hold
        if count > (self.data.len() - self.pos) / 16 {
            return None;
        }
        let points = (0..count).map(|_| self.point()).collect::<Option<Vec<_>>>()?;
        Some(LineString::new(points))
    }
}

/// Parse a geometry column value. Returns `None` for unsupported shapes
/// (multi-geometries, collections) or malformed input.
pub fn parse(raw: &[u8]) -> Option<Geometry> {
    let wkb = raw.get(4..)?;
    let (&order, _) = wkb.split_first()?;
    let mut reader = Wkb {
        data: wkb,
        pos: 1,
        little_endian: order == 1,
    };
    match reader.u32()? {
        WKB_POINT => reader.point().map(Geometry::Point),
        WKB_LINESTRING => reader.line().map(Geometry::LineString),
        WKB_POLYGON => {
            let rings = reader.u32()? as usize;
            if rings > reader.data.len() - reader.pos {
                return None;
            }
            let rings = (0..rings).map(|_| reader.line()).collect::<Option<Vec<_>>>()?;
            Some(Geometry::Polygon(Polygon::new(rings)))
        }
        other => {
            tracing::debug!(wkb_type = other, "unsupported geometry type");
            None
        }
    }
}

/// Encode with SRID 0 and little-endian WKB, the form the server accepts
/// for geometry parameters.
#[allow(clippy::cast_possible_truncation)]
pub fn encode(geometry: &Geometry) -> Vec<u8> {
    fn points(out: &mut Vec<u8>, line: &LineString) {
        out.extend_from_slice(&(line.points.len() as u32).to_le_bytes());
        for p in &line.points {
            out.extend_from_slice(&p.x.to_le_bytes());
            out.extend_from_slice(&p.y.to_le_bytes());
        }
    }

    let mut out = vec![0, 0, 0, 0, 1];
    match geometry {
        Geometry::Point(p) => {
            out.extend_from_slice(&WKB_POINT.to_le_bytes());
            out.extend_from_slice(&p.x.to_le_bytes());
            out.extend_from_slice(&p.y.to_le_bytes());
        }
        Geometry::LineString(line) => {
            out.extend_from_slice(&WKB_LINESTRING.to_le_bytes());
            points(&mut out, line);
        }
        Geometry::Polygon(polygon) => {
            out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
            out.extend_from_slice(&(polygon.rings.len() as u32).to_le_bytes());
            for ring in &polygon.rings {
                points(&mut out, ring);
            }
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn encode_point(x: f64, y: f64) -> Vec<u8> {
    encode(&Geometry::Point(Point::new(x, y)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        let raw = encode_point(1.0, 2.5);
        assert_eq!(parse(&raw), Some(Geometry::Point(Point::new(1.0, 2.5))));
    }

    #[test]
    fn test_parse_big_endian_linestring() {
        let mut raw = vec![0, 0, 0, 0, 0];
        raw.extend_from_slice(&WKB_LINESTRING.to_be_bytes());
        raw.extend_from_slice(&2u32.to_be_bytes());
        for v in [0.0f64, 0.0, 1.0, 1.0] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        let geometry = parse(&raw).unwrap();
        assert_eq!(geometry.to_wkt(), "LINESTRING(0 0,1 1)");
    }

    #[test]
    fn test_parse_polygon_and_garbage() {
        let ring = LineString::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 0.0),
        ]);
        let raw = encode(&Geometry::Polygon(Polygon::new(vec![ring])));
        match parse(&raw) {
            Some(Geometry::Polygon(p)) => {
                assert_eq!(p.rings.len(), 1);
                assert!(p.rings[0].is_closed());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(parse(&[0, 0, 0, 0, 1, 9, 0, 0, 0]), None);
        assert_eq!(parse(&[1, 2]), None);
    }
}
