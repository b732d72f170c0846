//! GetFeatureInfo requests and decoding of their responses.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};
use wms_common::{BoundingBox, Crs, MapUnits, TileMatrix, TilePosition, WmsError, WmsResult};
use wms_protocol::getfeatureinfo::{
    decode_geojson, decode_gml, exception_candidate, select_parts, split_response, ResponsePart,
};
use wms_protocol::{service_exception_error, FeatureStore, IdentifyFormat, TileMode};

use crate::http::get_following_redirects;
use crate::provider::WmsProvider;

/// One entry of an identify result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentifyValue {
    /// Hidden or non-queryable sublayer; nothing was requested.
    NotQueried,
    Text(String),
    Features(Vec<FeatureStore>),
    Error(String),
}

/// Identify results keyed in request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyResult {
    pub format: IdentifyFormat,
    pub results: BTreeMap<usize, IdentifyValue>,
}

impl IdentifyResult {
    pub fn new(format: IdentifyFormat) -> Self {
        Self {
            format,
            results: BTreeMap::new(),
        }
    }

    fn push(&mut self, value: IdentifyValue) {
        let key = self.results.len();
        self.results.insert(key, value);
    }

    /// Every decoded feature store, in result order.
    pub fn feature_stores(&self) -> impl Iterator<Item = &FeatureStore> {
        self.results.values().flat_map(|v| match v {
            IdentifyValue::Features(stores) => stores.as_slice(),
            _ => &[][..],
        })
    }
}

/// Map view the identify point was picked in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentifyContext {
    pub extent: BoundingBox,
    pub width: u32,
    pub height: u32,
}

/// Map window sent with a GetFeatureInfo request and the pixel of the
/// queried point inside it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryWindow {
    pub extent: BoundingBox,
    pub width: u32,
    pub height: u32,
    pub pixel: (i64, i64),
}

/// Half size of the probe window used without a map context, roughly a
/// millimetre on the ground.
pub fn probe_resolution(units: MapUnits) -> f64 {
    match units {
        MapUnits::Feet => 0.003,
        // The longest degree of latitude is 111694 m.
        MapUnits::Degrees => 1e-8,
        MapUnits::Meters | MapUnits::Unknown => 0.001,
    }
}

/// Window and pixel for a query at `point`.
///
/// Without a context a 2x2 pixel probe around the point is used. Windows
/// one pixel wide or high are grown to two pixels since some servers
/// reject them.
pub fn query_window(
    point: (f64, f64),
    context: Option<IdentifyContext>,
    units: MapUnits,
) -> WmsResult<QueryWindow> {
    let (x, y) = point;
    let (mut extent, mut width, mut height) = match context.filter(|c| !c.extent.is_empty()) {
        Some(c) => {
            if c.width == 0 || c.height == 0 {
                return Err(WmsError::ContextNotSpecified);
            }
            (c.extent, c.width, c.height)
        }
        None => {
            let r = probe_resolution(units);
            (BoundingBox::new(x - r, y - r, x + r, y + r), 2, 2)
        }
    };

    let xres = extent.width() / width as f64;
    let yres = extent.height() / height as f64;
    if width == 1 {
        width = 2;
        extent.max_x += xres;
    }
    if height == 1 {
        height = 2;
        extent.max_y += yres;
    }

    Ok(QueryWindow {
        extent,
        width,
        height,
        pixel: (
            ((x - extent.min_x) / xres).floor() as i64,
            ((extent.max_y - y) / yres).floor() as i64,
        ),
    })
}

/// Tile of `matrix` containing `(x, y)` and the pixel offset inside it.
pub fn wmts_tile_pixel(matrix: &TileMatrix, x: f64, y: f64) -> (TilePosition, (i64, i64)) {
    let (tw, th) = matrix.tile_span();
    let (x0, y0) = matrix.top_left_corner;
    let col = ((x - x0) / tw).floor() as i64;
    let row = ((y0 - y) / th).floor() as i64;
    let tx = x0 + col as f64 * tw;
    let ty = y0 - row as f64 * th;
    let i = ((x - tx) / matrix.tres) as i64;
    let j = ((ty - y) / matrix.tres) as i64;
    (TilePosition::new(row, col), (i, j))
}

enum Planned {
    Skip,
    Query { sublayer: String, url: String },
}

impl WmsProvider {
    /// Query the features at `point` in the image CRS.
    ///
    /// Per sublayer failures become entries of the result; only an
    /// unsupported format or an incomplete context fail the call.
    #[instrument(skip(self, context), fields(uri = %self.uri()))]
    pub async fn identify(
        &self,
        point: (f64, f64),
        format: IdentifyFormat,
        context: Option<IdentifyContext>,
    ) -> WmsResult<IdentifyResult> {
        self.ensure_valid()?;

        let info_format = self
            .caps
            .identify_formats
            .get(&format)
            .filter(|f| !f.is_empty())
            .cloned()
            .ok_or(WmsError::UnsupportedFormat)?;
        debug!(info_format = %info_format, "identify");

        let mut result = IdentifyResult::new(format);
        if !self.extent().contains_point(point.0, point.1) {
            result.results.insert(1, IdentifyValue::Text(String::new()));
            return Ok(result);
        }

        let units = Crs::from_ogc(&self.settings.crs_id)
            .map(|c| c.units)
            .unwrap_or(MapUnits::Meters);
        let window = query_window(point, context, units)?;
        debug!(
            extent = ?window.extent,
            width = window.width,
            height = window.height,
            pixel = ?window.pixel,
            "identify window"
        );

        let plan = self.plan_identify(point, &window, &info_format);
        for (count, entry) in plan.into_iter().enumerate() {
            match entry {
                Planned::Skip => result.push(IdentifyValue::NotQueried),
                Planned::Query { sublayer, url } => {
                    if let Some(value) = self.identify_request(count, &sublayer, &url, format).await {
                        result.push(value);
                    }
                }
            }
        }
        Ok(result)
    }

    fn plan_identify(&self, point: (f64, f64), window: &QueryWindow, info_format: &str) -> Vec<Planned> {
        let builder = self.request_builder();
        let mut plan = Vec::new();

        if !self.settings.tiled {
            for (layer, style) in self
                .settings
                .active_sub_layers
                .iter()
                .zip(&self.settings.active_sub_styles)
            {
                if !self.settings.is_visible(layer) || !self.caps.is_queryable(layer) {
                    plan.push(Planned::Skip);
                    continue;
                }
                debug!(layer = %layer, "queryable");
                plan.push(Planned::Query {
                    sublayer: layer.clone(),
                    url: builder.get_feature_info(
                        &window.extent,
                        window.width,
                        window.height,
                        layer,
                        style,
                        info_format,
                        window.pixel,
                    ),
                });
            }
            return plan;
        }

        let (Some(tile_layer), Some(tms)) = (self.tile_layer(), self.tile_matrix_set()) else {
            return plan;
        };
        if tile_layer.tile_mode != TileMode::Wmts {
            return plan;
        }

        let vres = window.extent.width() / window.width as f64;
        let Some(matrix) = tms.find_nearest_resolution(vres) else {
            return plan;
        };
        let (tile, pixel) = wmts_tile_pixel(matrix, point.0, point.1);
        debug!(col = tile.col, row = tile.row, i = pixel.0, j = pixel.1, "identify tile");

        let rest = tile_layer
            .get_feature_info_urls
            .get(info_format)
            .map(String::as_str);
        if rest.is_none() && !self.has_feature_info_url() {
            debug!("No KVP and no feature info url for format {}", info_format);
            return plan;
        }

        if let Some(sublayer) = self.settings.active_sub_layers.first() {
            plan.push(Planned::Query {
                sublayer: sublayer.clone(),
                url: builder.wmts_get_feature_info(rest, &tms.identifier, matrix, tile, pixel, info_format),
            });
        }
        plan
    }

    async fn identify_request(
        &self,
        count: usize,
        sublayer: &str,
        url: &str,
        format: IdentifyFormat,
    ) -> Option<IdentifyValue> {
        debug!(url = %url, "getfeatureinfo");
        let client = self.client().ok()?;

        let response = match get_following_redirects(client.as_ref(), url, self.config.max_redirects).await {
            Ok(response) => response,
            Err(err) => {
                let text = format!("Map getfeatureinfo error: {} [{}]", err, url);
                warn!("{}", text);
                self.status(&text);
                self.set_error(WmsError::Transport(text));
                return None;
            }
        };

        if response.is_error() {
            self.status(&format!(
                "Map getfeatureinfo error {}: {}",
                response.status, response.reason
            ));
            self.set_error(WmsError::HttpStatus {
                status: response.status,
                reason: response.reason,
            });
            return None;
        }

        let parts = match split_response(response.content_type(), &response.body) {
            Ok(parts) => parts,
            Err(err) => {
                let text = format!("Cannot parse getfeatureinfo: {}", err);
                self.status(&text);
                self.set_error(WmsError::FeatureDecode(text));
                return None;
            }
        };
        if parts.is_empty() {
            debug!("getfeatureinfo response is empty");
            return None;
        }

        if let Some(err) = exception_candidate(&parts).and_then(service_exception_error) {
            warn!(
                "Get feature info request error (Title:{}; Error:{}; URL: {})",
                err.error_title(),
                err,
                url
            );
            self.set_error(err);
            return None;
        }

        match format {
            IdentifyFormat::Html | IdentifyFormat::Text => Some(IdentifyValue::Text(
                String::from_utf8_lossy(&parts[0].body).into_owned(),
            )),
            IdentifyFormat::Feature => Some(self.decode_features(count, sublayer, url, &parts)),
            IdentifyFormat::Value | IdentifyFormat::Undefined => None,
        }
    }

    fn decode_features(&self, count: usize, sublayer: &str, url: &str, parts: &[ResponsePart]) -> IdentifyValue {
        let target = match Crs::from_ogc(&self.settings.crs_id) {
            Ok(crs) => crs,
            Err(err) => return IdentifyValue::Error(err.to_string()),
        };
        let selection = select_parts(parts);
        debug!(gml = ?selection.gml, xsd = ?selection.xsd, json = ?selection.json, "feature parts");

        if let Some(gml) = selection.gml {
            let xsd = selection.xsd.map(|i| parts[i].body.as_slice());
            return match decode_gml(&parts[gml].body, xsd, &target, self.transformer.as_ref()) {
                Ok(mut stores) => {
                    for store in &mut stores {
                        let feature_type = store.params.get("featureType").cloned().unwrap_or_default();
                        store.set_provenance(sublayer, &feature_type, url);
                    }
                    IdentifyValue::Features(stores)
                }
                Err(err) => {
                    warn!(error = %err, url = %url, "GML decoding failed");
                    IdentifyValue::Error(err.to_string())
                }
            };
        }

        if let Some(json) = selection.json {
            return match decode_geojson(&parts[json].body, &target, self.transformer.as_ref()) {
                Ok(mut stores) => {
                    for (i, store) in stores.iter_mut().enumerate() {
                        store.set_provenance(sublayer, &format!("{}_{}", count, i), url);
                    }
                    IdentifyValue::Features(stores)
                }
                Err(err) => {
                    debug!(error = %err, "JSON error");
                    IdentifyValue::Error(err)
                }
            };
        }

        IdentifyValue::Features(Vec::new())
    }
}
