/// Geographic coordinate types.
/// All coordinate math uses f64; longitude/latitude are in degrees (WGS84).
use serde::{Deserialize, Serialize};

/// A point in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Longitude in degrees, -180 to +180.
    pub lon: f64,
    /// Latitude in degrees, -90 to +90.
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BBox {
    /// Smallest box enclosing all points. None for an empty slice.
    pub fn enclosing(points: &[GeoPoint]) -> Option<Self> {
        let first = points.first()?;
        let mut b = Self {
            min_lon: first.lon,
            max_lon: first.lon,
            min_lat: first.lat,
            max_lat: first.lat,
        };
        for p in &points[1..] {
            b.min_lon = b.min_lon.min(p.lon);
            b.max_lon = b.max_lon.max(p.lon);
            b.min_lat = b.min_lat.min(p.lat);
            b.max_lat = b.max_lat.max(p.lat);
        }
        Some(b)
    }

    /// Inclusive on all edges.
    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    pub fn overlaps(&self, other: &BBox) -> bool {
        self.min_lon < other.max_lon
            && self.max_lon > other.min_lon
            && self.min_lat < other.max_lat
            && self.max_lat > other.min_lat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enclosing_box_contains_all_points() {
        let pts = [
            GeoPoint::new(-60.0, -5.0),
            GeoPoint::new(-75.5, 10.0),
            GeoPoint::new(-40.0, 2.5),
        ];
        let b = BBox::enclosing(&pts).unwrap();
        assert_eq!(b.min_lon, -75.5);
        assert_eq!(b.max_lat, 10.0);
        assert!(pts.iter().all(|&p| b.contains(p)));
    }

    #[test]
    fn enclosing_empty_is_none() {
        assert!(BBox::enclosing(&[]).is_none());
    }

    #[test]
    fn overlap_is_strict() {
        let a = BBox { min_lon: 0.0, max_lon: 5.0, min_lat: 0.0, max_lat: 5.0 };
        let touching = BBox { min_lon: 5.0, max_lon: 10.0, min_lat: 0.0, max_lat: 5.0 };
        let inside = BBox { min_lon: 1.0, max_lon: 2.0, min_lat: 1.0, max_lat: 2.0 };
        assert!(!a.overlaps(&touching));
        assert!(a.overlaps(&inside));
    }
}
