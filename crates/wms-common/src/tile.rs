//! WMTS Tile Matrix and TileMatrixSet definitions.
//!
//! Implements OGC WMTS tile matrix concepts for tiled map services. Matrices
//! inside a set are kept ordered by resolution (finest first) so that
//! neighbouring resolution levels can be found for preview rendering.

use crate::BoundingBox;
use serde::{Deserialize, Serialize};

/// Standardized rendering pixel size in meters (OGC WMTS 0.28mm).
pub const STANDARD_PIXEL_SIZE: f64 = 0.00028;

/// Tile size used by XYZ slippy map services.
pub const XYZ_TILE_SIZE: u32 = 256;

/// A tile position inside one tile matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePosition {
    pub row: i64,
    pub col: i64,
}

impl TilePosition {
    pub fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }
}

/// Inclusive range of tile columns and rows.
///
/// A range is empty when `col1 < col0` or `row1 < row0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub col0: i64,
    pub row0: i64,
    pub col1: i64,
    pub row1: i64,
}

impl TileRange {
    pub const EMPTY: TileRange = TileRange {
        col0: 0,
        row0: 0,
        col1: -1,
        row1: -1,
    };

    pub fn is_empty(&self) -> bool {
        self.col1 < self.col0 || self.row1 < self.row0
    }

    /// Number of tiles covered.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        ((self.col1 - self.col0 + 1) * (self.row1 - self.row0 + 1)) as usize
    }

    /// All positions, row by row.
    pub fn positions(&self) -> Vec<TilePosition> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.len());
        for row in self.row0..=self.row1 {
            for col in self.col0..=self.col1 {
                out.push(TilePosition { row, col });
            }
        }
        out
    }
}

/// Server declared bounds of the valid tiles of one matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileMatrixLimits {
    pub tile_matrix: String,
    pub min_tile_row: i64,
    pub max_tile_row: i64,
    pub min_tile_col: i64,
    pub max_tile_col: i64,
}

impl TileMatrixLimits {
    /// Limits must be ordered and lie inside the matrix.
    pub fn is_valid_for(&self, matrix: &TileMatrix) -> bool {
        self.min_tile_col >= 0
            && self.min_tile_col <= self.max_tile_col
            && self.max_tile_col < matrix.matrix_width as i64
            && self.min_tile_row >= 0
            && self.min_tile_row <= self.max_tile_row
            && self.max_tile_row < matrix.matrix_height as i64
    }
}

/// A single tile matrix (zoom level) definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMatrix {
    /// Identifier (usually zoom level as string)
    pub identifier: String,

    /// Scale denominator
    pub scale_denominator: f64,

    /// Top-left corner coordinates
    pub top_left_corner: (f64, f64),

    /// Tile width in pixels
    pub tile_width: u32,

    /// Tile height in pixels
    pub tile_height: u32,

    /// Number of tile columns
    pub matrix_width: u32,

    /// Number of tile rows
    pub matrix_height: u32,

    /// Map units per pixel
    pub tres: f64,
}

impl TileMatrix {
    /// Build a matrix from WMTS capabilities values.
    pub fn from_scale(
        identifier: impl Into<String>,
        scale_denominator: f64,
        top_left_corner: (f64, f64),
        tile_size: (u32, u32),
        matrix_size: (u32, u32),
        meters_per_unit: f64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            scale_denominator,
            top_left_corner,
            tile_width: tile_size.0,
            tile_height: tile_size.1,
            matrix_width: matrix_size.0,
            matrix_height: matrix_size.1,
            tres: scale_denominator * STANDARD_PIXEL_SIZE / meters_per_unit,
        }
    }

    /// Single level matrix covering `extent`, used to split plain WMS
    /// GetMap requests into tiles of at most `tile_size` pixels.
    pub fn pseudo(extent: &BoundingBox, tile_size: (u32, u32), tres: f64) -> Self {
        let tw = tile_size.0.max(1);
        let th = tile_size.1.max(1);
        Self {
            identifier: String::new(),
            scale_denominator: 0.0,
            top_left_corner: (extent.min_x, extent.max_y),
            tile_width: tw,
            tile_height: th,
            matrix_width: (extent.width() / tw as f64 / tres).ceil().max(0.0) as u32,
            matrix_height: (extent.height() / th as f64 / tres).ceil().max(0.0) as u32,
            tres,
        }
    }

    /// Size of one tile in map units.
    pub fn tile_span(&self) -> (f64, f64) {
        (
            self.tile_width as f64 * self.tres,
            self.tile_height as f64 * self.tres,
        )
    }

    /// Get the bounding box for a specific tile.
    ///
    /// Positions outside the grid are not rejected.
    pub fn tile_bbox(&self, col: i64, row: i64) -> BoundingBox {
        let (tw, th) = self.tile_span();
        let (x0, y0) = self.top_left_corner;
        BoundingBox::new(
            x0 + col as f64 * tw,
            y0 - (row + 1) as f64 * th,
            x0 + (col + 1) as f64 * tw,
            y0 - row as f64 * th,
        )
    }

    /// Area covered by the whole matrix.
    pub fn extent(&self) -> BoundingBox {
        let (tw, th) = self.tile_span();
        let (x0, y0) = self.top_left_corner;
        BoundingBox::new(
            x0,
            y0 - th * self.matrix_height as f64,
            x0 + tw * self.matrix_width as f64,
            y0,
        )
    }

    /// Tile containing a map coordinate, without range checks.
    pub fn coord_to_tile(&self, x: f64, y: f64) -> TilePosition {
        let (tw, th) = self.tile_span();
        TilePosition {
            col: ((x - self.top_left_corner.0) / tw).floor() as i64,
            row: ((self.top_left_corner.1 - y) / th).floor() as i64,
        }
    }

    /// Inclusive tile range overlapping `view`, clipped to the grid and to
    /// `limits` when given. Empty if the view misses the grid.
    pub fn view_extent_intersection(
        &self,
        view: &BoundingBox,
        limits: Option<&TileMatrixLimits>,
    ) -> TileRange {
        let (tw, th) = self.tile_span();
        if !(tw > 0.0 && th > 0.0) || self.matrix_width == 0 || self.matrix_height == 0 {
            return TileRange::EMPTY;
        }

        let (min_col, max_col, min_row, max_row) = match limits {
            Some(l) => (l.min_tile_col, l.max_tile_col, l.min_tile_row, l.max_tile_row),
            None => (
                0,
                self.matrix_width as i64 - 1,
                0,
                self.matrix_height as i64 - 1,
            ),
        };

        let (x0, y0) = self.top_left_corner;
        let cell = |v: f64| v.floor().clamp(i64::MIN as f64, i64::MAX as f64) as i64;

        let range = TileRange {
            col0: cell((view.min_x - x0) / tw).max(min_col),
            row0: cell((y0 - view.max_y) / th).max(min_row),
            col1: cell((view.max_x - x0) / tw).min(max_col),
            row1: cell((y0 - view.min_y) / th).min(max_row),
        };

        if range.is_empty() {
            TileRange::EMPTY
        } else {
            range
        }
    }
}

/// A complete tile matrix set definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileMatrixSet {
    /// Identifier for the tile matrix set
    pub identifier: String,

    pub title: String,

    pub abstract_: String,

    pub keywords: Vec<String>,

    /// Coordinate reference system as advertised
    pub crs: String,

    /// Well-known scale set URI (optional)
    pub well_known_scale_set: Option<String>,

    /// Individual tile matrices, ordered by ascending resolution value
    tile_matrices: Vec<TileMatrix>,
}

impl TileMatrixSet {
    pub fn new(identifier: impl Into<String>, crs: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            crs: crs.into(),
            ..Default::default()
        }
    }

    /// Add a matrix, replacing one with the same resolution.
    pub fn insert(&mut self, matrix: TileMatrix) {
        match self
            .tile_matrices
            .binary_search_by(|m| m.tres.total_cmp(&matrix.tres))
        {
            Ok(i) => self.tile_matrices[i] = matrix,
            Err(i) => self.tile_matrices.insert(i, matrix),
        }
    }

    /// Matrices ordered from finest to coarsest.
    pub fn tile_matrices(&self) -> &[TileMatrix] {
        &self.tile_matrices
    }

    pub fn is_empty(&self) -> bool {
        self.tile_matrices.is_empty()
    }

    /// Get a tile matrix by identifier.
    pub fn get_matrix(&self, identifier: &str) -> Option<&TileMatrix> {
        self.tile_matrices
            .iter()
            .find(|m| m.identifier == identifier)
    }

    /// The matrix with the largest resolution value.
    pub fn coarsest(&self) -> Option<&TileMatrix> {
        self.tile_matrices.last()
    }

    /// Matrix whose resolution is closest to `vres`.
    ///
    /// Between the two levels bracketing `vres` the closer one wins, ties go
    /// to the coarser level. Outside the available range the nearest end is
    /// used.
    pub fn find_nearest_resolution(&self, vres: f64) -> Option<&TileMatrix> {
        let idx = self.tile_matrices.partition_point(|m| m.tres < vres);
        if idx == self.tile_matrices.len() {
            return self.tile_matrices.last();
        }
        if idx > 0 {
            let prev = &self.tile_matrices[idx - 1];
            let next = &self.tile_matrices[idx];
            if vres - prev.tres < next.tres - vres {
                return Some(prev);
            }
        }
        self.tile_matrices.get(idx)
    }

    /// Matrix `offset` levels away from the one with resolution exactly
    /// `tres`. Positive offsets move to coarser levels.
    pub fn find_other_resolution(&self, tres: f64, offset: i32) -> Option<&TileMatrix> {
        let idx = self.tile_matrices.iter().position(|m| m.tres == tres)?;
        let target = idx as i64 + offset as i64;
        if target < 0 {
            return None;
        }
        self.tile_matrices.get(target as usize)
    }
}

/// Bing style quadkey of a tile.
///
/// Zoom 0 yields an empty key.
pub fn tile_to_quadkey(col: i64, row: i64, z: u32) -> String {
    let mut key = String::with_capacity(z as usize);
    for i in (1..=z).rev() {
        let mask = 1i64 << (i - 1);
        let mut digit = 0u8;
        if col & mask != 0 {
            digit += 1;
        }
        if row & mask != 0 {
            digit += 2;
        }
        key.push((b'0' + digit) as char);
    }
    key
}

/// Tile matrix set of an XYZ service projected so the world becomes the
/// square `world` (top-left origin), one matrix per zoom level.
pub fn xyz_tile_matrix_set(
    identifier: &str,
    crs: &str,
    world: &BoundingBox,
    zmin: u32,
    zmax: u32,
) -> TileMatrixSet {
    let mut set = TileMatrixSet::new(identifier, crs);
    let xspan = world.width();
    for zoom in zmin..=zmax.min(30) {
        let n = 1u32 << zoom;
        set.insert(TileMatrix {
            identifier: zoom.to_string(),
            scale_denominator: 0.0,
            top_left_corner: (world.min_x, world.max_y),
            tile_width: XYZ_TILE_SIZE,
            tile_height: XYZ_TILE_SIZE,
            matrix_width: n,
            matrix_height: n,
            tres: xspan / (XYZ_TILE_SIZE as f64 * n as f64),
        });
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(id: &str, tres: f64) -> TileMatrix {
        TileMatrix {
            identifier: id.to_string(),
            scale_denominator: tres / STANDARD_PIXEL_SIZE,
            top_left_corner: (0.0, 10_000.0),
            tile_width: 100,
            tile_height: 100,
            matrix_width: 4,
            matrix_height: 4,
            tres,
        }
    }

    fn pyramid() -> TileMatrixSet {
        let mut set = TileMatrixSet::new("set", "EPSG:3857");
        for (id, tres) in [("0", 100.0), ("1", 50.0), ("2", 25.0), ("3", 12.5)] {
            set.insert(matrix(id, tres));
        }
        set
    }

    #[test]
    fn test_quadkey() {
        assert_eq!(tile_to_quadkey(0, 0, 1), "0");
        assert_eq!(tile_to_quadkey(1, 1, 1), "3");
        assert_eq!(tile_to_quadkey(5, 5, 0), "");
        assert_eq!(tile_to_quadkey(3, 5, 3), "213");
    }

    #[test]
    fn test_tile_bbox() {
        let m = matrix("0", 1.0);
        let bbox = m.tile_bbox(1, 2);
        assert_eq!(bbox, BoundingBox::new(100.0, 9_700.0, 200.0, 9_800.0));
        assert_eq!(m.extent(), BoundingBox::new(0.0, 9_600.0, 400.0, 10_000.0));
    }

    #[test]
    fn test_view_outside_grid_is_empty() {
        let m = matrix("0", 1.0);
        for view in [
            BoundingBox::new(-500.0, 9_000.0, -10.0, 9_500.0),
            BoundingBox::new(500.0, 9_000.0, 900.0, 9_500.0),
            BoundingBox::new(0.0, 10_100.0, 400.0, 10_200.0),
            BoundingBox::new(0.0, 0.0, 400.0, 9_000.0),
        ] {
            let range = m.view_extent_intersection(&view, None);
            assert!(range.is_empty(), "{view:?} gave {range:?}");
            assert!(range.positions().is_empty());
        }
    }

    #[test]
    fn test_view_inside_grid_is_covered() {
        let m = matrix("0", 1.0);
        let views = [
            BoundingBox::new(10.0, 9_650.0, 390.0, 9_990.0),
            BoundingBox::new(150.0, 9_750.0, 160.0, 9_760.0),
            BoundingBox::new(0.5, 9_600.5, 399.5, 9_999.5),
        ];
        for view in views {
            let range = m.view_extent_intersection(&view, None);
            assert!(!range.is_empty());
            let union = range
                .positions()
                .iter()
                .map(|p| m.tile_bbox(p.col, p.row))
                .reduce(|a, b| a.combine(&b))
                .unwrap();
            assert!(union.contains(&view), "{union:?} does not contain {view:?}");
        }
    }

    #[test]
    fn test_view_clipped_to_limits() {
        let m = matrix("0", 1.0);
        let limits = TileMatrixLimits {
            tile_matrix: "0".into(),
            min_tile_row: 1,
            max_tile_row: 2,
            min_tile_col: 2,
            max_tile_col: 3,
        };
        assert!(limits.is_valid_for(&m));
        let range = m.view_extent_intersection(&m.extent(), Some(&limits));
        assert_eq!(
            range,
            TileRange {
                col0: 2,
                row0: 1,
                col1: 3,
                row1: 2
            }
        );
        assert_eq!(range.len(), 4);
        assert_eq!(range.positions()[1], TilePosition::new(1, 3));
    }

    #[test]
    fn test_find_nearest_resolution() {
        let set = pyramid();
        assert_eq!(set.find_nearest_resolution(20.0).unwrap().tres, 25.0);
        assert_eq!(set.find_nearest_resolution(14.0).unwrap().tres, 12.5);
        assert_eq!(set.find_nearest_resolution(1.0).unwrap().tres, 12.5);
        assert_eq!(set.find_nearest_resolution(1000.0).unwrap().tres, 100.0);
        assert_eq!(set.find_nearest_resolution(37.5).unwrap().tres, 50.0);
        for m in set.tile_matrices() {
            assert_eq!(set.find_nearest_resolution(m.tres).unwrap(), m);
        }
        assert!(TileMatrixSet::default().find_nearest_resolution(1.0).is_none());
    }

    #[test]
    fn test_find_other_resolution() {
        let set = pyramid();
        assert_eq!(set.find_other_resolution(25.0, 1).unwrap().tres, 50.0);
        assert_eq!(set.find_other_resolution(25.0, 2).unwrap().tres, 100.0);
        assert_eq!(set.find_other_resolution(25.0, -1).unwrap().tres, 12.5);
        assert!(set.find_other_resolution(25.0, 3).is_none());
        assert!(set.find_other_resolution(12.5, -1).is_none());
        assert!(set.find_other_resolution(30.0, 1).is_none());
    }

    #[test]
    fn test_insert_keeps_order_and_replaces() {
        let mut set = pyramid();
        set.insert(matrix("dup", 25.0));
        assert_eq!(set.tile_matrices().len(), 4);
        assert_eq!(set.get_matrix("dup").unwrap().tres, 25.0);
        assert!(set.get_matrix("2").is_none());
        assert_eq!(set.coarsest().unwrap().identifier, "0");
    }

    #[test]
    fn test_pseudo_matrix() {
        let extent = BoundingBox::new(0.0, 0.0, 1000.0, 500.0);
        let m = TileMatrix::pseudo(&extent, (256, 256), 1.0);
        assert_eq!(m.top_left_corner, (0.0, 500.0));
        assert_eq!(m.matrix_width, 4);
        assert_eq!(m.matrix_height, 2);
    }

    #[test]
    fn test_xyz_set() {
        let world = BoundingBox::new(
            -20037508.342789244,
            -20037508.342789244,
            20037508.342789244,
            20037508.342789244,
        );
        let set = xyz_tile_matrix_set("tms0", "EPSG:3857", &world, 0, 18);
        assert_eq!(set.tile_matrices().len(), 19);
        let z0 = set.get_matrix("0").unwrap();
        assert_eq!(z0.matrix_width, 1);
        assert!((z0.tres - 156543.03392804097).abs() < 1e-6);
        assert_eq!(set.tile_matrices()[0].identifier, "18");
    }
}
