//! Common types shared by the WMS/WMTS client crates.

pub mod bbox;
pub mod crs;
pub mod error;
pub mod tile;

pub use bbox::BoundingBox;
pub use crs::{AxisOrientationPolicy, BuiltinTransformer, Crs, CrsTransformer, MapUnits};
pub use error::{WmsError, WmsResult};
pub use tile::{TileMatrix, TileMatrixLimits, TileMatrixSet, TilePosition, TileRange};
