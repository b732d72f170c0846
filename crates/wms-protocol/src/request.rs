//! Request URL builders.
//!
//! Every request the provider issues is composed here: GetMap, tile
//! requests for the WMS-C, WMTS (KVP and RESTful) and XYZ tile modes,
//! GetFeatureInfo for WMS and WMTS, and GetLegendGraphic.

use crate::capabilities::{TileMode, WmsCapabilities};
use crate::settings::{prepare_uri, DpiMode, WmsSettings};
use tracing::debug;
use wms_common::tile::tile_to_quadkey;
use wms_common::{BoundingBox, TileMatrix, TilePosition, WmsError, WmsResult};

/// SLD version sent with GetLegendGraphic; the server's cannot be determined.
pub const LEGEND_SLD_VERSION: &str = "1.1.0";

/// One tile to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub url: String,
    /// Tile rectangle in map coordinates.
    pub rect: BoundingBox,
    /// Sequence number inside the draw call.
    pub index: usize,
}

/// A URL whose query items can be replaced.
///
/// Values are stored percent-encoded; setting a key removes every existing
/// item with that key before appending the new one at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryUrl {
    base: String,
    items: Vec<(String, String)>,
}

impl QueryUrl {
    pub fn parse(url: &str) -> Self {
        let (base, query) = url.split_once('?').unwrap_or((url, ""));
        let items = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p, ""));
                (k.to_string(), v.to_string())
            })
            .collect();
        Self {
            base: base.to_string(),
            items,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.set_encoded(key, encode_query_value(value));
    }

    /// Set a value that is already percent-encoded.
    pub fn set_encoded(&mut self, key: &str, value: String) {
        self.remove(key);
        self.items.push((key.to_string(), value));
    }

    /// `FORMAT`, with `+` sent as `%2b` so servers don't read it as a space.
    pub fn set_format(&mut self, format: &str) {
        if format.contains('+') {
            let value = format
                .split('+')
                .map(encode_query_value)
                .collect::<Vec<_>>()
                .join("%2b");
            self.set_encoded("FORMAT", value);
        } else {
            self.set("FORMAT", format);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.items.retain(|(k, _)| k != key);
    }

    /// Query keys compare case-insensitively in OGC services.
    pub fn has_key_ignore_case(&self, key: &str) -> bool {
        self.items.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Encoded value of `key`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.items.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn to_url(&self) -> String {
        let mut out = self.base.clone();
        out.push('?');
        for (i, (k, v)) in self.items.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }
}

/// Percent-encode a query value, leaving the characters WMS servers expect
/// verbatim in lists, coordinates and MIME types untouched.
pub fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || "-_.~,:/;*!()'@".contains(c) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
        }
    }
    out
}

/// Replace every case-insensitive occurrence of `pattern` in `s`.
pub fn replace_ignore_case(s: &str, pattern: &str, value: &str) -> String {
    if pattern.is_empty() {
        return s.to_string();
    }
    let lower = s.to_ascii_lowercase();
    let needle = pattern.to_ascii_lowercase();
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (start, _) in lower.match_indices(&needle) {
        out.push_str(&s[last..start]);
        out.push_str(value);
        last = start + needle.len();
    }
    out.push_str(&s[last..]);
    out
}

/// JPEG can't carry transparency and some servers reject the request
/// if asked for it.
pub fn wants_transparency(mime: &str) -> bool {
    let lower = mime.to_ascii_lowercase();
    mime == "image/x-jpegorpng" || (!lower.contains("jpeg") && !lower.contains("jpg"))
}

/// Context of a GetLegendGraphic request for a contextual legend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegendContext {
    pub extent: BoundingBox,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

/// Composes request URLs for one provider.
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder<'a> {
    settings: &'a WmsSettings,
    caps: &'a WmsCapabilities,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(settings: &'a WmsSettings, caps: &'a WmsCapabilities) -> Self {
        Self { settings, caps }
    }

    fn version(&self) -> &str {
        &self.caps.version
    }

    /// `CRS` for WMS 1.3, `SRS` before.
    pub fn crs_key(&self) -> &'static str {
        if self.version() == "1.3.0" || self.version() == "1.3" {
            "CRS"
        } else {
            "SRS"
        }
    }

    pub fn change_xy(&self) -> bool {
        self.caps
            .should_invert_axis_orientation(&self.settings.crs_id)
    }

    fn bbox_param(&self, extent: &BoundingBox) -> String {
        extent.to_wms_param(self.change_xy())
    }

    fn set_crs(&self, url: &mut QueryUrl) {
        url.set(self.crs_key(), &self.settings.crs_id);
    }

    fn set_dpi(&self, url: &mut QueryUrl, dpi: Option<u32>) {
        let Some(dpi) = dpi else { return };
        let mode = self.settings.dpi_mode;
        if mode.contains(DpiMode::QGIS) {
            url.set("DPI", &dpi.to_string());
        }
        if mode.contains(DpiMode::UMN) {
            url.set("MAP_RESOLUTION", &dpi.to_string());
        }
        if mode.contains(DpiMode::GEOSERVER) {
            url.set("FORMAT_OPTIONS", &format!("dpi:{}", dpi));
        }
    }

    fn set_transparent(&self, url: &mut QueryUrl) {
        if wants_transparency(&self.settings.image_mime_type) {
            url.set("TRANSPARENT", "TRUE");
        }
    }

    /// GetMap endpoint advertised by the server, or the base URL.
    pub fn get_map_url(&self) -> String {
        if self.settings.ignore_get_map_url {
            return self.settings.base_url.clone();
        }
        self.caps
            .request
            .get_map
            .get_url()
            .map(prepare_uri)
            .unwrap_or_else(|| self.settings.base_url.clone())
    }

    /// GetFeatureInfo endpoint advertised by the server, or the base URL.
    pub fn get_feature_info_url(&self) -> String {
        if self.settings.ignore_get_feature_info_url {
            return self.settings.base_url.clone();
        }
        self.caps
            .request
            .get_feature_info
            .get_url()
            .map(prepare_uri)
            .unwrap_or_else(|| self.settings.base_url.clone())
    }

    /// KVP GetTile endpoint; `None` when tiles must be requested RESTful.
    pub fn get_tile_url(&self) -> Option<String> {
        let op = &self.caps.request.get_tile;
        let href = op.get_url()?;
        if !op.allowed_encodings.is_empty() && !op.allowed_encodings.iter().any(|e| e == "KVP") {
            return None;
        }
        Some(prepare_uri(href))
    }

    /// Legend image URL for the first active sublayer.
    ///
    /// Taken from the layer style's legend URL when it has an image format,
    /// otherwise from the GetLegendGraphic endpoint or the base URL.
    pub fn get_legend_graphic_url(&self) -> String {
        let mut url = String::new();

        if let (Some(layer), Some(style)) = (
            self.settings.active_sub_layers.first(),
            self.settings.active_sub_styles.first(),
        ) {
            if let Some(l) = self.caps.layers_supported.iter().find(|l| &l.name == layer) {
                let chosen = if !style.is_empty() && style != "default" {
                    l.style(style)
                } else if l.styles.len() == 1 {
                    l.styles.first()
                } else {
                    l.style("default")
                };
                if let Some(s) = chosen {
                    if let Some(legend) = s
                        .legend_urls
                        .iter()
                        .find(|u| u.format.starts_with("image/") && !u.href.is_empty())
                    {
                        url = legend.href.clone();
                    }
                }
            }
        }

        if url.is_empty() {
            if let Some(href) = self.caps.request.get_legend_graphic.get_url() {
                url = href.to_string();
            }
        }

        if url.is_empty() {
            self.settings.base_url.clone()
        } else {
            prepare_uri(&url)
        }
    }

    /// Visible active sublayers with their styles, comma separated.
    pub fn visible_layers(&self) -> (String, String) {
        let (layers, styles): (Vec<&str>, Vec<&str>) = self
            .settings
            .active_sub_layers
            .iter()
            .zip(&self.settings.active_sub_styles)
            .filter(|(layer, _)| self.settings.is_visible(layer))
            .map(|(l, s)| (l.as_str(), s.as_str()))
            .unzip();
        (layers.join(","), styles.join(","))
    }

    /// Plain WMS GetMap request.
    pub fn get_map(
        &self,
        extent: &BoundingBox,
        width: u32,
        height: u32,
        dpi: Option<u32>,
    ) -> String {
        let (layers, styles) = self.visible_layers();

        let mut url = QueryUrl::parse(&self.get_map_url());
        url.set("SERVICE", "WMS");
        url.set("VERSION", self.version());
        url.set("REQUEST", "GetMap");
        url.set("BBOX", &self.bbox_param(extent));
        self.set_crs(&mut url);
        url.set("WIDTH", &width.to_string());
        url.set("HEIGHT", &height.to_string());
        url.set("LAYERS", &layers);
        url.set("STYLES", &styles);
        url.set_format(&self.settings.image_mime_type);
        self.set_dpi(&mut url, dpi);
        self.set_transparent(&mut url);

        let url = url.to_url();
        debug!(url = %url, "getmap");
        url
    }

    /// Requests for `tiles` of `matrix` in the given tile mode.
    pub fn tile_requests(
        &self,
        mode: TileMode,
        tile_layer_urls: Option<&std::collections::BTreeMap<String, String>>,
        tile_matrix_set: &str,
        matrix: &TileMatrix,
        tiles: &[TilePosition],
        dpi: Option<u32>,
    ) -> WmsResult<Vec<TileRequest>> {
        match mode {
            TileMode::Wmsc => Ok(self.wmsc_tile_requests(matrix, tiles, dpi)),
            TileMode::Wmts => match self.get_tile_url() {
                Some(_) => Ok(self.wmts_kvp_tile_requests(tile_matrix_set, matrix, tiles)),
                None => {
                    let template = tile_layer_urls
                        .and_then(|urls| urls.get(&self.settings.image_mime_type))
                        .ok_or_else(|| {
                            WmsError::InvalidProvider(format!(
                                "no tile URL template for format {}",
                                self.settings.image_mime_type
                            ))
                        })?;
                    Ok(self.wmts_rest_tile_requests(template, tile_matrix_set, matrix, tiles))
                }
            },
            TileMode::Xyz => Ok(self.xyz_tile_requests(matrix, tiles)),
        }
    }

    /// WMS-C (and pseudo-tiled WMS) GetMap requests, one per tile.
    pub fn wmsc_tile_requests(
        &self,
        matrix: &TileMatrix,
        tiles: &[TilePosition],
        dpi: Option<u32>,
    ) -> Vec<TileRequest> {
        let mut url = QueryUrl::parse(&self.get_map_url());
        url.set("SERVICE", "WMS");
        url.set("VERSION", self.version());
        url.set("REQUEST", "GetMap");
        url.set("LAYERS", &self.settings.active_sub_layers.join(","));
        url.set("STYLES", &self.settings.active_sub_styles.join(","));
        url.set("WIDTH", &matrix.tile_width.to_string());
        url.set("HEIGHT", &matrix.tile_height.to_string());
        url.set_format(&self.settings.image_mime_type);
        self.set_crs(&mut url);
        if self.settings.tiled {
            url.set("TILED", "true");
        }
        self.set_dpi(&mut url, dpi);
        self.set_transparent(&mut url);
        url.remove("BBOX");

        let base = url.to_url();
        tiles
            .iter()
            .enumerate()
            .map(|(index, tile)| {
                let rect = matrix.tile_bbox(tile.col, tile.row);
                TileRequest {
                    url: format!("{}&BBOX={}", base, self.bbox_param(&rect)),
                    rect,
                    index,
                }
            })
            .collect()
    }

    fn dimension_values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.settings
            .tile_dimension_values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref().unwrap_or("")))
    }

    fn first_layer_and_style(&self) -> (&str, &str) {
        (
            self.settings
                .active_sub_layers
                .first()
                .map(String::as_str)
                .unwrap_or(""),
            self.settings
                .active_sub_styles
                .first()
                .map(String::as_str)
                .unwrap_or(""),
        )
    }

    /// WMTS GetTile requests in KVP encoding.
    pub fn wmts_kvp_tile_requests(
        &self,
        tile_matrix_set: &str,
        matrix: &TileMatrix,
        tiles: &[TilePosition],
    ) -> Vec<TileRequest> {
        let endpoint = if self.settings.ignore_get_map_url {
            self.settings.base_url.clone()
        } else {
            self.get_tile_url()
                .unwrap_or_else(|| self.settings.base_url.clone())
        };
        let (layer, style) = self.first_layer_and_style();

        let mut url = QueryUrl::parse(&endpoint);
        url.set("SERVICE", "WMTS");
        url.set("REQUEST", "GetTile");
        url.set("VERSION", self.version());
        url.set("LAYER", layer);
        url.set("STYLE", style);
        url.set("FORMAT", &self.settings.image_mime_type);
        url.set("TILEMATRIXSET", tile_matrix_set);
        url.set("TILEMATRIX", &matrix.identifier);
        for (k, v) in self.dimension_values() {
            url.set(k, v);
        }
        url.remove("TILEROW");
        url.remove("TILECOL");

        let base = url.to_url();
        tiles
            .iter()
            .enumerate()
            .map(|(index, tile)| TileRequest {
                url: format!("{}&TILEROW={}&TILECOL={}", base, tile.row, tile.col),
                rect: matrix.tile_bbox(tile.col, tile.row),
                index,
            })
            .collect()
    }

    fn substitute_common(&self, template: &str, tile_matrix_set: &str, matrix: &TileMatrix) -> String {
        let (layer, style) = self.first_layer_and_style();
        let mut url = replace_ignore_case(template, "{layer}", layer);
        url = replace_ignore_case(&url, "{style}", style);
        url = replace_ignore_case(&url, "{tilematrixset}", tile_matrix_set);
        url = replace_ignore_case(&url, "{tilematrix}", &matrix.identifier);
        url
    }

    fn substitute_dimensions(&self, mut url: String) -> String {
        for (k, v) in self.dimension_values() {
            url = replace_ignore_case(&url, &format!("{{{}}}", k), v);
        }
        url
    }

    /// WMTS GetTile requests from a RESTful resource template.
    pub fn wmts_rest_tile_requests(
        &self,
        template: &str,
        tile_matrix_set: &str,
        matrix: &TileMatrix,
        tiles: &[TilePosition],
    ) -> Vec<TileRequest> {
        let url = self.substitute_common(template, tile_matrix_set, matrix);
        let url = self.substitute_dimensions(url);

        tiles
            .iter()
            .enumerate()
            .map(|(index, tile)| {
                let turl = replace_ignore_case(&url, "{tilerow}", &tile.row.to_string());
                TileRequest {
                    url: replace_ignore_case(&turl, "{tilecol}", &tile.col.to_string()),
                    rect: matrix.tile_bbox(tile.col, tile.row),
                    index,
                }
            })
            .collect()
    }

    /// XYZ tile requests from the base URL template. Indices start at 1.
    pub fn xyz_tile_requests(&self, matrix: &TileMatrix, tiles: &[TilePosition]) -> Vec<TileRequest> {
        let z: u32 = matrix.identifier.parse().unwrap_or(0);
        tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| TileRequest {
                url: xyz_tile_url(&self.settings.base_url, matrix, z, *tile),
                rect: matrix.tile_bbox(tile.col, tile.row),
                index: i + 1,
            })
            .collect()
    }

    /// WMS GetFeatureInfo request for `layers` at pixel `point` of the
    /// `width` x `height` map of `extent`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_feature_info(
        &self,
        extent: &BoundingBox,
        width: u32,
        height: u32,
        layers: &str,
        styles: &str,
        info_format: &str,
        point: (i64, i64),
    ) -> String {
        let mut url = QueryUrl::parse(&self.get_feature_info_url());
        url.set("SERVICE", "WMS");
        url.set("VERSION", self.version());
        url.set("REQUEST", "GetFeatureInfo");
        url.set("BBOX", &self.bbox_param(extent));
        self.set_crs(&mut url);
        url.set("WIDTH", &width.to_string());
        url.set("HEIGHT", &height.to_string());
        url.set("LAYERS", layers);
        url.set("STYLES", styles);
        url.set_format(&self.settings.image_mime_type);
        url.set("QUERY_LAYERS", layers);
        url.set("INFO_FORMAT", info_format);

        let (xk, yk) = if self.crs_key() == "CRS" {
            ("I", "J")
        } else {
            ("X", "Y")
        };
        url.set(xk, &point.0.to_string());
        url.set(yk, &point.1.to_string());

        if self.settings.feature_count > 0 {
            url.set("FEATURE_COUNT", &self.settings.feature_count.to_string());
        }
        url.to_url()
    }

    /// WMTS GetFeatureInfo request for pixel `(i, j)` of tile `tile`.
    ///
    /// Uses the layer's RESTful template for `info_format` when there is one.
    pub fn wmts_get_feature_info(
        &self,
        rest_template: Option<&str>,
        tile_matrix_set: &str,
        matrix: &TileMatrix,
        tile: TilePosition,
        pixel: (i64, i64),
        info_format: &str,
    ) -> String {
        if let Some(template) = rest_template {
            let mut url = self.substitute_common(template, tile_matrix_set, matrix);
            url = replace_ignore_case(&url, "{tilerow}", &tile.row.to_string());
            url = replace_ignore_case(&url, "{tilecol}", &tile.col.to_string());
            url = replace_ignore_case(&url, "{i}", &pixel.0.to_string());
            url = replace_ignore_case(&url, "{j}", &pixel.1.to_string());
            return self.substitute_dimensions(url);
        }

        let (layer, style) = self.first_layer_and_style();
        let mut url = QueryUrl::parse(&self.get_feature_info_url());
        url.set("SERVICE", "WMTS");
        url.set("REQUEST", "GetFeatureInfo");
        url.set("VERSION", self.version());
        url.set("LAYER", layer);
        url.set("STYLE", style);
        url.set("INFOFORMAT", info_format);
        url.set("TILEMATRIXSET", tile_matrix_set);
        url.set("TILEMATRIX", &matrix.identifier);
        for (k, v) in self.dimension_values() {
            url.set(k, v);
        }
        url.set("TILEROW", &tile.row.to_string());
        url.set("TILECOL", &tile.col.to_string());
        url.set("I", &pixel.0.to_string());
        url.set("J", &pixel.1.to_string());
        url.to_url()
    }

    /// GetLegendGraphic request for the first active sublayer.
    ///
    /// Parameters already present in the legend URL are left alone.
    /// `legend_dpi` adds the vendor resolution parameters; `context` the
    /// visible map for contextual legends.
    pub fn get_legend_graphic(
        &self,
        scale: f64,
        legend_dpi: Option<u32>,
        context: Option<&LegendContext>,
    ) -> String {
        let mut url = QueryUrl::parse(&self.get_legend_graphic_url());
        let (layer, style) = self.first_layer_and_style();

        let set_absent = |url: &mut QueryUrl, key: &str, value: &str| {
            if !url.has_key_ignore_case(key) {
                url.set(key, value);
            }
        };
        set_absent(&mut url, "SERVICE", "WMS");
        set_absent(&mut url, "VERSION", self.version());
        set_absent(&mut url, "SLD_VERSION", LEGEND_SLD_VERSION);
        set_absent(&mut url, "REQUEST", "GetLegendGraphic");
        if !url.has_key_ignore_case("FORMAT") {
            url.set_format(&self.settings.image_mime_type);
        }
        set_absent(&mut url, "LAYER", layer);
        set_absent(&mut url, "STYLE", style);
        set_absent(&mut url, "TRANSPARENT", "true");

        if let Some(dpi) = legend_dpi {
            let mode = self.settings.dpi_mode;
            let scale_value = format!("{:.6}", scale);
            if mode.contains(DpiMode::QGIS) {
                url.set("DPI", &dpi.to_string());
            }
            if mode.contains(DpiMode::UMN) {
                url.set("MAP_RESOLUTION", &dpi.to_string());
                url.set("SCALE", &scale_value);
            }
            if mode.contains(DpiMode::GEOSERVER) {
                url.set("FORMAT_OPTIONS", &format!("dpi:{}", dpi));
                url.set("SCALE", &scale_value);
            }
        }

        if self.settings.enable_contextual_legend {
            if let Some(ctx) = context {
                url.set("BBOX", &self.bbox_param(&ctx.extent));
                self.set_crs(&mut url);
                url.set("WIDTH", &ctx.width.to_string());
                url.set("HEIGHT", &ctx.height.to_string());
                url.set("SCALE", &format!("{:.6}", ctx.scale));
            }
        }

        let url = url.to_url();
        debug!(url = %url, "getlegendgraphic");
        url
    }
}

/// Fill an XYZ template for one tile.
///
/// `{q}` is the Bing quadkey, `{-y}` the row counted from the bottom.
pub fn xyz_tile_url(template: &str, matrix: &TileMatrix, z: u32, tile: TilePosition) -> String {
    let mut url = template.to_string();
    if url.contains("{q}") {
        url = url.replace("{q}", &tile_to_quadkey(tile.col, tile.row, z));
    }
    url = replace_ignore_case(&url, "{x}", &tile.col.to_string());
    if url.contains("{-y}") {
        let flipped = matrix.matrix_height as i64 - tile.row - 1;
        url = replace_ignore_case(&url, "{-y}", &flipped.to_string());
    } else {
        url = replace_ignore_case(&url, "{y}", &tile.row.to_string());
    }
    replace_ignore_case(&url, "{z}", &z.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{LayerProperty, LegendUrl, OperationType, StyleProperty};
    use std::collections::BTreeMap;

    fn settings(uri: &str) -> WmsSettings {
        WmsSettings::parse_uri(uri).unwrap()
    }

    fn caps(version: &str) -> WmsCapabilities {
        WmsCapabilities {
            version: version.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_query_url_replaces_items() {
        let mut url = QueryUrl::parse("http://host/wms?map=/srv/a.map&FORMAT=x&");
        url.set("FORMAT", "image/png");
        url.set("LAYERS", "a b");
        assert_eq!(
            url.to_url(),
            "http://host/wms?map=/srv/a.map&FORMAT=image/png&LAYERS=a%20b"
        );
        assert!(url.has_key_ignore_case("layers"));
        assert_eq!(url.keys(), vec!["map", "FORMAT", "LAYERS"]);
    }

    #[test]
    fn test_format_plus_is_escaped() {
        let mut url = QueryUrl::parse("http://host/wms?");
        url.set_format("image/svg+xml");
        assert_eq!(url.value("FORMAT"), Some("image/svg%2bxml"));
    }

    #[test]
    fn test_replace_ignore_case() {
        assert_eq!(
            replace_ignore_case("a/{TileMatrix}/{tilematrix}.png", "{tilematrix}", "3"),
            "a/3/3.png"
        );
        assert_eq!(replace_ignore_case("abc", "", "x"), "abc");
    }

    #[test]
    fn test_transparency_rule() {
        assert!(wants_transparency("image/png"));
        assert!(wants_transparency("image/x-jpegorpng"));
        assert!(!wants_transparency("image/JPEG"));
        assert!(!wants_transparency("image/jpg"));
    }

    #[test]
    fn test_get_map_130_geographic() {
        let s = settings(
            "url=http://host/wms&layers=a&layers=b&styles=&styles=s2&format=image/png&crs=EPSG:4326",
        );
        let c = caps("1.3.0");
        let b = RequestBuilder::new(&s, &c);
        let url = b.get_map(&BoundingBox::new(-10.0, 40.0, 10.0, 50.0), 256, 128, Some(96));
        assert_eq!(
            url,
            "http://host/wms?SERVICE=WMS&VERSION=1.3.0&REQUEST=GetMap&BBOX=40,-10,50,10\
             &CRS=EPSG:4326&WIDTH=256&HEIGHT=128&LAYERS=a,b&STYLES=,s2&FORMAT=image/png\
             &DPI=96&MAP_RESOLUTION=96&FORMAT_OPTIONS=dpi:96&TRANSPARENT=TRUE"
        );
    }

    #[test]
    fn test_get_map_111_jpeg_hidden_layer() {
        let mut s = settings(
            "url=http://host/wms&layers=a&layers=b&styles=x&styles=y&format=image/jpeg&crs=EPSG:4326&dpiMode=2",
        );
        s.active_sub_layer_visibility.insert("a".into(), false);
        let c = caps("1.1.1");
        let b = RequestBuilder::new(&s, &c);
        let url = b.get_map(&BoundingBox::new(-10.0, 40.0, 10.0, 50.0), 100, 100, Some(300));
        assert!(url.contains("BBOX=-10,40,10,50&SRS=EPSG:4326"));
        assert!(url.contains("LAYERS=b&STYLES=y"));
        assert!(url.contains("MAP_RESOLUTION=300"));
        assert!(!url.contains("DPI=300"));
        assert!(!url.contains("FORMAT_OPTIONS"));
        assert!(!url.contains("TRANSPARENT"));
    }

    #[test]
    fn test_get_map_without_dpi() {
        let s = settings("url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:3857");
        let c = caps("1.3.0");
        let url = RequestBuilder::new(&s, &c).get_map(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), 1, 1, None);
        assert!(url.contains("BBOX=0,0,1,1&CRS=EPSG:3857"));
        assert!(!url.contains("DPI"));
    }

    #[test]
    fn test_advertised_get_map_url() {
        let s = settings("url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:3857");
        let mut c = caps("1.3.0");
        c.request.get_map = OperationType {
            get_urls: vec!["http://other/cgi?map=x".into()],
            ..Default::default()
        };
        let b = RequestBuilder::new(&s, &c);
        assert_eq!(b.get_map_url(), "http://other/cgi?map=x&");

        let s = settings(
            "url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:3857&IgnoreGetMapUrl=1",
        );
        assert_eq!(RequestBuilder::new(&s, &c).get_map_url(), "http://host/wms?");
    }

    #[test]
    fn test_wmsc_tiles() {
        let s = settings(
            "url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:4326&tileMatrixSet=",
        );
        let c = caps("1.1.1");
        let tm = TileMatrix::pseudo(&BoundingBox::new(0.0, 0.0, 512.0, 256.0), (256, 256), 1.0);
        let reqs = RequestBuilder::new(&s, &c).wmsc_tile_requests(
            &tm,
            &[TilePosition::new(0, 0), TilePosition::new(0, 1)],
            None,
        );
        assert_eq!(reqs.len(), 2);
        assert_eq!(
            reqs[1].url,
            "http://host/wms?SERVICE=WMS&VERSION=1.1.1&REQUEST=GetMap&LAYERS=a&STYLES=\
             &WIDTH=256&HEIGHT=256&FORMAT=image/png&SRS=EPSG:4326&TILED=true&TRANSPARENT=TRUE\
             &BBOX=256,0,512,256"
        );
        assert_eq!(reqs[1].rect, BoundingBox::new(256.0, 0.0, 512.0, 256.0));
        assert_eq!(reqs[1].index, 1);
    }

    fn wmts_matrix() -> TileMatrix {
        TileMatrix {
            identifier: "5".into(),
            scale_denominator: 0.0,
            top_left_corner: (0.0, 100.0),
            tile_width: 10,
            tile_height: 10,
            matrix_width: 10,
            matrix_height: 10,
            tres: 1.0,
        }
    }

    #[test]
    fn test_wmts_kvp_tiles() {
        let s = settings(
            "url=http://host/wmts&layers=roads&styles=default&format=image/png&crs=EPSG:3857\
             &tileMatrixSet=g&tileDimensions=time%3D2020",
        );
        let mut c = caps("1.0.0");
        c.request.get_tile = OperationType {
            get_urls: vec!["http://host/kvp?".into()],
            allowed_encodings: vec!["KVP".into()],
            ..Default::default()
        };
        let b = RequestBuilder::new(&s, &c);
        let reqs = b
            .tile_requests(TileMode::Wmts, None, "g", &wmts_matrix(), &[TilePosition::new(2, 3)], None)
            .unwrap();
        assert_eq!(
            reqs[0].url,
            "http://host/kvp?SERVICE=WMTS&REQUEST=GetTile&VERSION=1.0.0&LAYER=roads&STYLE=default\
             &FORMAT=image/png&TILEMATRIXSET=g&TILEMATRIX=5&time=2020&TILEROW=2&TILECOL=3"
        );
    }

    #[test]
    fn test_wmts_rest_tiles() {
        let s = settings(
            "url=http://host/wmts&layers=roads&styles=default&format=image/png&crs=EPSG:3857\
             &tileMatrixSet=g&tileDimensions=Time%3D2020",
        );
        let mut c = caps("1.0.0");
        c.request.get_tile = OperationType {
            get_urls: vec!["http://host/kvp?".into()],
            allowed_encodings: vec!["RESTful".into()],
            ..Default::default()
        };
        let b = RequestBuilder::new(&s, &c);
        assert!(b.get_tile_url().is_none());

        let mut urls = BTreeMap::new();
        urls.insert(
            "image/png".to_string(),
            "http://host/{Layer}/{Style}/{time}/{TileMatrixSet}/{TileMatrix}/{TileRow}/{TileCol}.png"
                .to_string(),
        );
        let reqs = b
            .tile_requests(
                TileMode::Wmts,
                Some(&urls),
                "g",
                &wmts_matrix(),
                &[TilePosition::new(2, 3)],
                None,
            )
            .unwrap();
        assert_eq!(reqs[0].url, "http://host/roads/default/2020/g/5/2/3.png");

        let missing = b.tile_requests(TileMode::Wmts, Some(&BTreeMap::new()), "g", &wmts_matrix(), &[], None);
        assert!(missing.is_err());
    }

    #[test]
    fn test_xyz_tiles() {
        let s = settings("type=xyz&url=http://tiles/%7Bz%7D/%7Bx%7D/%7B-y%7D.png");
        let c = caps("");
        let mut tm = wmts_matrix();
        tm.identifier = "3".into();
        tm.matrix_height = 8;
        let reqs = RequestBuilder::new(&s, &c).xyz_tile_requests(&tm, &[TilePosition::new(1, 2)]);
        assert_eq!(reqs[0].url, "http://tiles/3/2/6.png");
        assert_eq!(reqs[0].index, 1);

        assert_eq!(
            xyz_tile_url("http://t/{q}.jpeg?x={X}&y={Y}", &tm, 1, TilePosition::new(1, 1)),
            "http://t/3.jpeg?x=1&y=1"
        );
    }

    #[test]
    fn test_get_feature_info_versions() {
        let s = settings(
            "url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:3857&featureCount=5",
        );
        let c = caps("1.3.0");
        let url = RequestBuilder::new(&s, &c).get_feature_info(
            &BoundingBox::new(0.0, 0.0, 2.0, 2.0),
            2,
            2,
            "a",
            "",
            "text/html",
            (1, 0),
        );
        assert!(url.ends_with(
            "LAYERS=a&STYLES=&FORMAT=image/png&QUERY_LAYERS=a&INFO_FORMAT=text/html&I=1&J=0&FEATURE_COUNT=5"
        ));

        let c = caps("1.1.1");
        let url = RequestBuilder::new(&s, &c).get_feature_info(
            &BoundingBox::new(0.0, 0.0, 2.0, 2.0),
            2,
            2,
            "a",
            "",
            "text/plain",
            (1, 0),
        );
        assert!(url.contains("&SRS=EPSG:3857&"));
        assert!(url.contains("&X=1&Y=0"));
    }

    #[test]
    fn test_wmts_get_feature_info() {
        let s = settings(
            "url=http://host/wmts&layers=roads&styles=default&format=image/png&crs=EPSG:3857&tileMatrixSet=g",
        );
        let c = caps("1.0.0");
        let b = RequestBuilder::new(&s, &c);
        let rest = b.wmts_get_feature_info(
            Some("http://h/{layer}/{tilematrix}/{tilerow}/{tilecol}/{i}/{j}.html"),
            "g",
            &wmts_matrix(),
            TilePosition::new(4, 5),
            (7, 8),
            "text/html",
        );
        assert_eq!(rest, "http://h/roads/5/4/5/7/8.html");

        let kvp = b.wmts_get_feature_info(None, "g", &wmts_matrix(), TilePosition::new(4, 5), (7, 8), "text/html");
        assert_eq!(
            kvp,
            "http://host/wmts?SERVICE=WMTS&REQUEST=GetFeatureInfo&VERSION=1.0.0&LAYER=roads\
             &STYLE=default&INFOFORMAT=text/html&TILEMATRIXSET=g&TILEMATRIX=5&TILEROW=4&TILECOL=5&I=7&J=8"
        );
    }

    fn legend_caps() -> WmsCapabilities {
        let mut c = caps("1.3.0");
        c.layers_supported.push(LayerProperty {
            name: "a".into(),
            styles: vec![
                StyleProperty {
                    name: "default".into(),
                    legend_urls: vec![LegendUrl {
                        format: "image/png".into(),
                        href: "http://legend/default.png".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                StyleProperty {
                    name: "blue".into(),
                    legend_urls: vec![
                        LegendUrl {
                            format: "text/html".into(),
                            href: "http://legend/blue.html".into(),
                            ..Default::default()
                        },
                        LegendUrl {
                            format: "image/gif".into(),
                            href: "http://legend/blue.gif?SERVICE=WMS".into(),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        c
    }

    #[test]
    fn test_legend_url_source() {
        let c = legend_caps();
        let s = settings("url=http://host/wms&layers=a&styles=blue&format=image/png&crs=EPSG:3857");
        assert_eq!(
            RequestBuilder::new(&s, &c).get_legend_graphic_url(),
            "http://legend/blue.gif?SERVICE=WMS&"
        );

        let s = settings("url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:3857");
        assert_eq!(
            RequestBuilder::new(&s, &c).get_legend_graphic_url(),
            "http://legend/default.png?"
        );

        let s = settings("url=http://host/wms&layers=zz&styles=&format=image/png&crs=EPSG:3857");
        assert_eq!(RequestBuilder::new(&s, &c).get_legend_graphic_url(), "http://host/wms?");
    }

    #[test]
    fn test_legend_params_added_when_absent() {
        let c = legend_caps();
        let s = settings("url=http://host/wms&layers=a&styles=blue&format=image/png&crs=EPSG:3857");
        let url = RequestBuilder::new(&s, &c).get_legend_graphic(1000.0, None, None);
        assert_eq!(
            url,
            "http://legend/blue.gif?SERVICE=WMS&VERSION=1.3.0&SLD_VERSION=1.1.0\
             &REQUEST=GetLegendGraphic&FORMAT=image/png&LAYER=a&STYLE=blue&TRANSPARENT=true"
        );
    }

    #[test]
    fn test_legend_dpi_and_context() {
        let c = legend_caps();
        let s = settings(
            "url=http://host/wms&layers=a&styles=&format=image/png&crs=EPSG:4326&dpiMode=2&contextualWMSLegend=1",
        );
        let ctx = LegendContext {
            extent: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            width: 800,
            height: 600,
            scale: 5000.0,
        };
        let url = RequestBuilder::new(&s, &c).get_legend_graphic(5000.0, Some(150), Some(&ctx));
        assert!(url.contains("MAP_RESOLUTION=150"));
        assert!(!url.contains("DPI=150"));
        assert!(url.contains("BBOX=2,1,4,3&CRS=EPSG:4326&WIDTH=800&HEIGHT=600&SCALE=5000.000000"));
    }
}
