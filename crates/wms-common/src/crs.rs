//! Coordinate Reference System types and utilities.
//!
//! Only what the WMS client needs is modelled here: the authority identifier,
//! the map units and whether the CRS declares a northing-first axis order.
//! Reprojection is delegated to a [`CrsTransformer`].

use crate::BoundingBox;
use proj4rs::Proj;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of one degree along the equator of the WGS84 spheroid.
pub const METERS_PER_DEGREE: f64 = 6378137.0 * 2.0 * std::f64::consts::PI / 360.0;

const WEB_MERCATOR_RADIUS: f64 = 6378137.0;
const WEB_MERCATOR_MAX_LAT: f64 = 85.0511287798;

/// Projected EPSG codes whose definition puts northing before easting.
const INVERTED_PROJECTED: &[u32] = &[2180, 3006, 3844, 31466, 31467, 31468, 31469];

/// Projected EPSG codes measured in feet.
const FEET_PROJECTED: &[u32] = &[2263, 2264, 2272, 2285, 2926];

/// EPSG codes that are all variants of spherical web mercator.
const WEB_MERCATOR_CODES: &[u32] = &[3857, 900913, 3785, 102100, 102113];

/// Units of a CRS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapUnits {
    Meters,
    Feet,
    Degrees,
    Unknown,
}

impl MapUnits {
    pub fn meters_per_unit(&self) -> f64 {
        match self {
            MapUnits::Meters | MapUnits::Unknown => 1.0,
            MapUnits::Feet => 0.3048,
            MapUnits::Degrees => METERS_PER_DEGREE,
        }
    }
}

/// How to treat the axis order declared by a CRS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AxisOrientationPolicy {
    /// Northing first whenever the EPSG definition says so.
    #[default]
    HonourEpsg,
    /// Northing first only for CRS given as URN/URL identifiers.
    HonourUrn,
    /// Always easting first.
    Ignore,
}

impl AxisOrientationPolicy {
    /// Parse a policy name as used in provider URIs.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "honourepsg" | "honour_epsg" => Some(Self::HonourEpsg),
            "honoururn" | "honour_urn" => Some(Self::HonourUrn),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }

    /// Decide whether coordinates in `crs` are exchanged northing first.
    pub fn is_inverted(&self, crs: &Crs) -> bool {
        match self {
            Self::HonourEpsg => crs.axis_inverted,
            Self::HonourUrn => crs.from_urn && crs.axis_inverted,
            Self::Ignore => false,
        }
    }
}

/// A coordinate reference system identified by authority and code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crs {
    /// Normalised identifier, e.g. "EPSG:4326" or "CRS:84".
    pub authid: String,
    pub units: MapUnits,
    /// Axis order of the definition is northing/latitude first.
    pub axis_inverted: bool,
    /// The identifier was given in URN or URL form.
    pub from_urn: bool,
}

impl Crs {
    /// Build from an EPSG code.
    ///
    /// Geographic codes are those whose registry definition is a
    /// longitude/latitude system; their EPSG axis order is latitude first.
    /// Codes unknown to the registry are taken as projected.
    pub fn epsg(code: u32) -> Self {
        let geographic = is_geographic_code(code);
        let units = if geographic {
            MapUnits::Degrees
        } else if FEET_PROJECTED.contains(&code) {
            MapUnits::Feet
        } else {
            MapUnits::Meters
        };
        Self {
            authid: format!("EPSG:{}", code),
            units,
            axis_inverted: geographic || INVERTED_PROJECTED.contains(&code),
            from_urn: false,
        }
    }

    /// WGS84 with longitude first.
    pub fn crs84() -> Self {
        Self {
            authid: "CRS:84".to_string(),
            units: MapUnits::Degrees,
            axis_inverted: false,
            from_urn: false,
        }
    }

    /// Parse a CRS identifier as found in capabilities documents and requests.
    ///
    /// Accepts formats like:
    /// - "EPSG:4326", "epsg:3857"
    /// - "CRS:84", "OGC:CRS84", "urn:ogc:def:crs:OGC:1.3:CRS84"
    /// - "urn:ogc:def:crs:EPSG::4326", "urn:ogc:def:crs:EPSG:6.3:4326"
    /// - "http://www.opengis.net/def/crs/EPSG/0/4326"
    /// - "http://www.opengis.net/gml/srs/epsg.xml#4326"
    pub fn from_ogc(s: &str) -> Result<Self, CrsParseError> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();

        if upper == "CRS:84" || upper.ends_with("CRS84") {
            return Ok(Self::crs84());
        }

        let from_urn = upper.starts_with("URN:") || upper.starts_with("HTTP");
        let code = if let Some(rest) = upper.strip_prefix("EPSG:") {
            rest
        } else if upper.starts_with("URN:OGC:DEF:CRS:EPSG:") {
            upper.rsplit(':').next().unwrap_or_default()
        } else if upper.contains("/DEF/CRS/EPSG/") {
            upper.rsplit('/').next().unwrap_or_default()
        } else if let Some((_, rest)) = upper.split_once("EPSG.XML#") {
            rest
        } else {
            return Err(CrsParseError::UnsupportedCrs(s.to_string()));
        };

        let code: u32 = code
            .parse()
            .map_err(|_| CrsParseError::UnsupportedCrs(s.to_string()))?;
        let mut crs = Self::epsg(code);
        crs.from_urn = from_urn;
        Ok(crs)
    }

    pub fn is_geographic(&self) -> bool {
        self.units == MapUnits::Degrees
    }

    pub fn is_web_mercator(&self) -> bool {
        self.epsg_code()
            .map(|c| WEB_MERCATOR_CODES.contains(&c))
            .unwrap_or(false)
    }

    pub fn epsg_code(&self) -> Option<u32> {
        self.authid.strip_prefix("EPSG:")?.parse().ok()
    }

    pub fn meters_per_unit(&self) -> f64 {
        self.units.meters_per_unit()
    }
}

fn is_geographic_code(code: u32) -> bool {
    u16::try_from(code)
        .ok()
        .and_then(|code| Proj::from_epsg_code(code).ok())
        .is_some_and(|proj| proj.is_latlong())
}

impl PartialEq for Crs {
    fn eq(&self, other: &Self) -> bool {
        self.authid == other.authid
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrsParseError {
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("No transformation from {src} to {dst}")]
    Unsupported { src: String, dst: String },

    #[error("Transformation of ({x}, {y}) from {src} to {dst} failed")]
    OutOfDomain {
        src: String,
        dst: String,
        x: f64,
        y: f64,
    },
}

/// Reprojects coordinates between two CRS.
pub trait CrsTransformer: Send + Sync {
    /// Transform a single point, coordinates in easting/northing order.
    fn transform_point(
        &self,
        src: &Crs,
        dst: &Crs,
        x: f64,
        y: f64,
    ) -> Result<(f64, f64), TransformError>;

    /// Transform a rectangle by densifying its edges.
    fn transform_bbox(
        &self,
        src: &Crs,
        dst: &Crs,
        bbox: &BoundingBox,
    ) -> Result<BoundingBox, TransformError> {
        if src == dst {
            return Ok(*bbox);
        }

        const STEPS: usize = 20;
        let mut out: Option<BoundingBox> = None;
        for i in 0..=STEPS {
            let t = i as f64 / STEPS as f64;
            let x = bbox.min_x + t * bbox.width();
            let y = bbox.min_y + t * bbox.height();
            for (px, py) in [(x, bbox.min_y), (x, bbox.max_y), (bbox.min_x, y), (bbox.max_x, y)] {
                let (tx, ty) = self.transform_point(src, dst, px, py)?;
                let p = BoundingBox::new(tx, ty, tx, ty);
                out = Some(match out {
                    Some(acc) => acc.combine(&p),
                    None => p,
                });
            }
        }
        Ok(out.unwrap_or(*bbox))
    }
}

/// Transformer covering the CRS pairs web map servers commonly mix:
/// identity, geographic to geographic (datum shifts ignored) and
/// geographic to/from spherical web mercator.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTransformer;

impl BuiltinTransformer {
    fn unsupported(src: &Crs, dst: &Crs) -> TransformError {
        TransformError::Unsupported {
            src: src.authid.clone(),
            dst: dst.authid.clone(),
        }
    }
}

impl CrsTransformer for BuiltinTransformer {
    fn transform_point(
        &self,
        src: &Crs,
        dst: &Crs,
        x: f64,
        y: f64,
    ) -> Result<(f64, f64), TransformError> {
        if src == dst || (src.is_web_mercator() && dst.is_web_mercator()) {
            return Ok((x, y));
        }

        if src.is_geographic() && dst.is_geographic() {
            return Ok((x, y));
        }

        if src.is_geographic() && dst.is_web_mercator() {
            let lat = y.clamp(-WEB_MERCATOR_MAX_LAT, WEB_MERCATOR_MAX_LAT);
            let mx = x.to_radians() * WEB_MERCATOR_RADIUS;
            let my = (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
                .tan()
                .ln()
                * WEB_MERCATOR_RADIUS;
            return Ok((mx, my));
        }

        if src.is_web_mercator() && dst.is_geographic() {
            let lon = (x / WEB_MERCATOR_RADIUS).to_degrees();
            let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2)
                .to_degrees();
            if !lon.is_finite() || !lat.is_finite() {
                return Err(TransformError::OutOfDomain {
                    src: src.authid.clone(),
                    dst: dst.authid.clone(),
                    x,
                    y,
                });
            }
            return Ok((lon, lat));
        }

        Err(Self::unsupported(src, dst))
    }
}
