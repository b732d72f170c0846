//! Provider connection settings parsed from a data source URI.
//!
//! A URI is a list of `key=value` pairs joined by `&`, keys and values
//! percent-encoded, e.g.
//! `url=https://example.com/wms&layers=roads&styles=&format=image/png&crs=EPSG:3857`.
//! `layers` and `styles` may be repeated.

use crate::capabilities::ParserSettings;
use std::collections::{BTreeMap, HashMap};
use wms_common::{AxisOrientationPolicy, WmsError, WmsResult};

/// Zoom range used by XYZ sources when the URI gives none.
pub const DEFAULT_XYZ_ZOOM: (u32, u32) = (0, 18);

/// Which vendor specific DPI parameters accompany GetMap requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpiMode(pub u8);

impl DpiMode {
    pub const NONE: DpiMode = DpiMode(0);
    /// `DPI=` (QGIS server)
    pub const QGIS: DpiMode = DpiMode(1);
    /// `MAP_RESOLUTION=` (UMN MapServer)
    pub const UMN: DpiMode = DpiMode(2);
    /// `FORMAT_OPTIONS=dpi:` (GeoServer)
    pub const GEOSERVER: DpiMode = DpiMode(4);
    pub const ALL: DpiMode = DpiMode(7);

    pub fn contains(&self, other: DpiMode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl Default for DpiMode {
    fn default() -> Self {
        DpiMode::ALL
    }
}

/// Credentials and headers sent with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WmsAuthorization {
    pub username: String,
    pub password: String,
    pub authcfg: Option<String>,
    pub referer: String,
}

impl WmsAuthorization {
    /// Basic auth credentials, if a user name is set.
    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }
}

/// Decoded `key=value` pairs of a data source URI.
#[derive(Debug, Clone, Default)]
pub struct UriParams {
    pairs: Vec<(String, String)>,
}

impl UriParams {
    pub fn parse(uri: &str) -> WmsResult<Self> {
        let mut pairs = Vec::new();
        for part in uri.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            pairs.push((decode(k)?, decode(v)?));
        }
        Ok(Self { pairs })
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// First value of `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a repeated key, in order.
    pub fn params(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn int(&self, key: &str) -> i64 {
        self.param(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

fn decode(s: &str) -> WmsResult<String> {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .map_err(|e| WmsError::InvalidUri(format!("{}: {}", s, e)))
}

/// Settings of one provider instance.
#[derive(Debug, Clone, Default)]
pub struct WmsSettings {
    /// The `url` parameter as given.
    pub http_uri: String,
    /// `http_uri` ready for appending query parameters.
    pub base_url: String,

    pub tiled: bool,
    pub xyz: bool,
    pub xyz_zoom: (u32, u32),
    pub tile_matrix_set_id: String,
    /// WMTS dimension values; `None` when only the name was given.
    pub tile_dimension_values: BTreeMap<String, Option<String>>,

    /// Pseudo-tiling of plain WMS when both are non-zero.
    pub max_width: u32,
    pub max_height: u32,

    pub ignore_get_map_url: bool,
    pub ignore_get_feature_info_url: bool,
    pub smooth_pixmap_transform: bool,
    pub parser_settings: ParserSettings,
    pub dpi_mode: DpiMode,

    pub active_sub_layers: Vec<String>,
    pub active_sub_styles: Vec<String>,
    pub active_sub_layer_visibility: HashMap<String, bool>,

    pub image_mime_type: String,
    pub crs_id: String,
    pub enable_contextual_legend: bool,
    pub feature_count: u32,

    pub auth: WmsAuthorization,
}

impl WmsSettings {
    /// Parse a data source URI.
    pub fn parse_uri(uri: &str) -> WmsResult<Self> {
        let params = UriParams::parse(uri)?;

        let mut settings = WmsSettings {
            auth: WmsAuthorization {
                username: params.param("username").unwrap_or_default().to_string(),
                password: params.param("password").unwrap_or_default().to_string(),
                authcfg: params.param("authcfg").map(str::to_string),
                referer: params.param("referer").unwrap_or_default().to_string(),
            },
            http_uri: params.param("url").unwrap_or_default().to_string(),
            ..Default::default()
        };

        if settings.http_uri.is_empty() {
            return Err(WmsError::InvalidUri("missing url parameter".to_string()));
        }

        if params.param("type") == Some("xyz") {
            let zmin = params
                .param("zmin")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_XYZ_ZOOM.0);
            let zmax = params
                .param("zmax")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_XYZ_ZOOM.1);

            settings.tiled = true;
            settings.xyz = true;
            settings.xyz_zoom = (zmin, zmax);
            settings.tile_matrix_set_id = "tms0".to_string();
            settings.base_url = settings.http_uri.clone();
            settings.smooth_pixmap_transform = true;
            settings.dpi_mode = DpiMode::NONE;
            settings.active_sub_layers = vec!["xyz".to_string()];
            settings.active_sub_styles = vec!["xyz".to_string()];
            settings.crs_id = "EPSG:3857".to_string();
            return Ok(settings);
        }

        settings.base_url = prepare_uri(&settings.http_uri);
        settings.ignore_get_map_url = params.has_param("IgnoreGetMapUrl");
        settings.ignore_get_feature_info_url = params.has_param("IgnoreGetFeatureInfoUrl");
        settings.smooth_pixmap_transform = params.has_param("SmoothPixmapTransform");

        let mut policy = match params.param("axisOrientation") {
            Some(name) => AxisOrientationPolicy::from_name(name).ok_or_else(|| {
                WmsError::InvalidUri(format!("unknown axis orientation policy: {}", name))
            })?,
            None => AxisOrientationPolicy::default(),
        };
        if params.has_param("IgnoreAxisOrientation") {
            policy = AxisOrientationPolicy::Ignore;
        }
        settings.parser_settings = ParserSettings {
            axis_policy: policy,
            invert_axis_orientation: params.has_param("InvertAxisOrientation"),
        };

        settings.dpi_mode = if params.has_param("dpiMode") {
            DpiMode(params.int("dpiMode").clamp(0, 7) as u8)
        } else {
            DpiMode::ALL
        };

        settings.active_sub_layers = params.params("layers");
        settings.active_sub_styles = params.params("styles");
        settings.image_mime_type = params.param("format").unwrap_or_default().to_string();

        if params.has_param("maxWidth") && params.has_param("maxHeight") {
            settings.max_width = params.int("maxWidth").max(0) as u32;
            settings.max_height = params.int("maxHeight").max(0) as u32;
        }

        if let Some(id) = params.param("tileMatrixSet") {
            // An empty set id selects the WMS-C tile set of the layer.
            settings.tiled = true;
            settings.tile_matrix_set_id = id.to_string();
        }

        if let Some(dims) = params.param("tileDimensions") {
            settings.tiled = true;
            for item in dims.split(';') {
                let kv: Vec<&str> = item.split('=').collect();
                match kv.as_slice() {
                    [k] => {
                        settings.tile_dimension_values.insert(k.to_string(), None);
                    }
                    [k, v] => {
                        settings
                            .tile_dimension_values
                            .insert(k.to_string(), Some(v.to_string()));
                    }
                    _ => tracing::debug!(dimension = %item, "skipped tile dimension"),
                }
            }
        }

        settings.crs_id = params.param("crs").unwrap_or_default().to_string();
        settings.enable_contextual_legend = params.int("contextualWMSLegend") != 0;
        settings.feature_count = params.int("featureCount").max(0) as u32;

        Ok(settings)
    }

    /// Visibility of an active sublayer; layers default to visible.
    pub fn is_visible(&self, layer: &str) -> bool {
        self.active_sub_layer_visibility
            .get(layer)
            .copied()
            .unwrap_or(true)
    }

    /// Pseudo-tiled plain WMS.
    pub fn is_pseudo_tiled(&self) -> bool {
        !self.tiled && self.max_width != 0 && self.max_height != 0
    }
}

/// Make a URL ready for appending query parameters by ensuring it ends
/// in `?` or `&`. WMTS capability URLs are returned unchanged.
pub fn prepare_uri(uri: &str) -> String {
    if uri.contains("SERVICE=WMTS") || uri.contains("/WMTSCapabilities.xml") {
        return uri.to_string();
    }

    let mut out = uri.to_string();
    if !out.contains('?') {
        out.push('?');
    } else if !out.ends_with('?') && !out.ends_with('&') {
        out.push('&');
    }
    out
}
