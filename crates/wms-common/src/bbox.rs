//! Bounding box types and operations.

use serde::{Deserialize, Serialize};

/// An axis aligned rectangle in map coordinates.
///
/// For geographic CRS (EPSG:4326, CRS:84), coordinates are in degrees.
/// For projected CRS (EPSG:3857, etc.), coordinates are in map units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Create a new bounding box from corner coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Create a bounding box from two arbitrary corners, ordering the bounds.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::new(x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2))
    }

    /// Return a copy with min/max swapped where they are reversed.
    pub fn normalized(&self) -> Self {
        Self::from_corners(self.min_x, self.min_y, self.max_x, self.max_y)
    }

    /// Parse a WMS BBOX parameter string: "minx,miny,maxx,maxy"
    pub fn from_wms_string(s: &str) -> Result<Self, BboxParseError> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(BboxParseError::InvalidFormat(s.to_string()));
        }

        let parse = |p: &str| {
            p.parse::<f64>()
                .map_err(|_| BboxParseError::InvalidNumber(p.to_string()))
        };

        Ok(Self {
            min_x: parse(parts[0])?,
            min_y: parse(parts[1])?,
            max_x: parse(parts[2])?,
            max_y: parse(parts[3])?,
        })
    }

    /// Format as a WMS BBOX parameter value.
    ///
    /// With `change_xy` the axes are swapped: "miny,minx,maxy,maxx".
    pub fn to_wms_param(&self, change_xy: bool) -> String {
        let (a, b, c, d) = if change_xy {
            (self.min_y, self.min_x, self.max_y, self.max_x)
        } else {
            (self.min_x, self.min_y, self.max_x, self.max_y)
        };
        format!(
            "{},{},{},{}",
            format_coordinate(a),
            format_coordinate(b),
            format_coordinate(c),
            format_coordinate(d)
        )
    }

    /// Width of the bounding box in coordinate units.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height of the bounding box in coordinate units.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Center point.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// A box with no area.
    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
    }

    /// Swap the x and y axes.
    pub fn inverted(&self) -> Self {
        Self::new(self.min_y, self.min_x, self.max_y, self.max_x)
    }

    /// Check if this bbox intersects another.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }

    /// Compute the intersection of two bounding boxes.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }

        Some(BoundingBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Smallest box containing both boxes.
    pub fn combine(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Check if a point is contained within this bbox.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Check if `other` lies completely inside this bbox.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    /// Containment test that tolerates rounding noise.
    ///
    /// `other` is shrunk by an epsilon five orders of magnitude below the
    /// larger side of this box before testing.
    pub fn fuzzy_contains(&self, other: &BoundingBox) -> bool {
        let significant_digits = self.width().max(self.height()).log10();
        let epsilon = 10f64.powf(significant_digits - 5.0);
        self.contains(&BoundingBox::new(
            other.min_x + epsilon,
            other.min_y + epsilon,
            other.max_x - epsilon,
            other.max_y - epsilon,
        ))
    }
}

/// Format a coordinate for a request parameter.
///
/// Uses the shortest decimal representation that round-trips to the same
/// double, never scientific notation, and prints zero as "0".
pub fn format_coordinate(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}

#[derive(Debug, thiserror::Error)]
pub enum BboxParseError {
    #[error("Invalid BBOX format: {0}. Expected 'minx,miny,maxx,maxy'")]
    InvalidFormat(String),

    #[error("Invalid number in BBOX: {0}")]
    InvalidNumber(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wms_bbox() {
        let bbox = BoundingBox::from_wms_string("-125.0,24.0,-66.0,50.0").unwrap();
        assert_eq!(bbox.min_x, -125.0);
        assert_eq!(bbox.min_y, 24.0);
        assert_eq!(bbox.max_x, -66.0);
        assert_eq!(bbox.max_y, 50.0);
    }

    #[test]
    fn test_intersection() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
        let c = BoundingBox::new(20.0, 20.0, 30.0, 30.0);

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));

        let intersection = a.intersection(&b).unwrap();
        assert_eq!(intersection.min_x, 5.0);
        assert_eq!(intersection.min_y, 5.0);
        assert_eq!(intersection.max_x, 10.0);
        assert_eq!(intersection.max_y, 10.0);
    }

    #[test]
    fn test_format_coordinate() {
        assert_eq!(format_coordinate(0.0), "0");
        assert_eq!(format_coordinate(-0.0), "0");
        assert_eq!(format_coordinate(100.0), "100");
        assert_eq!(format_coordinate(0.1), "0.1");
        assert_eq!(format_coordinate(-20037508.342789244), "-20037508.342789244");
        assert_eq!(format_coordinate(1e-7), "0.0000001");
    }

    #[test]
    fn test_wms_param_round_trip() {
        let bbox = BoundingBox::new(-20037508.342789244, 0.1 + 0.2, 1.0 / 3.0, 48.858093);
        let formatted = bbox.to_wms_param(false);
        let parsed = BoundingBox::from_wms_string(&formatted).unwrap();
        assert_eq!(parsed, bbox);
    }

    #[test]
    fn test_wms_param_swapped() {
        let bbox = BoundingBox::new(1.5, 2.0, 3.0, 4.25);
        assert_eq!(bbox.to_wms_param(false), "1.5,2,3,4.25");
        assert_eq!(bbox.to_wms_param(true), "2,1.5,4.25,3");
    }

    #[test]
    fn test_fuzzy_contains_absorbs_rounding() {
        let outer = BoundingBox::new(0.0, 0.0, 1000.0, 1000.0);
        let almost = BoundingBox::new(-0.000001, 0.0, 1000.000001, 1000.0);
        assert!(!outer.contains(&almost));
        assert!(outer.fuzzy_contains(&almost));
        assert!(!outer.fuzzy_contains(&BoundingBox::new(-1.0, 0.0, 10.0, 10.0)));
    }

    #[test]
    fn test_normalized_and_combine() {
        let bbox = BoundingBox::new(10.0, 5.0, 0.0, -5.0).normalized();
        assert_eq!(bbox, BoundingBox::new(0.0, -5.0, 10.0, 5.0));
        let union = bbox.combine(&BoundingBox::new(20.0, 0.0, 30.0, 1.0));
        assert_eq!(union, BoundingBox::new(0.0, -5.0, 30.0, 5.0));
        assert!(BoundingBox::new(0.0, 0.0, 0.0, 10.0).is_empty());
    }
}
