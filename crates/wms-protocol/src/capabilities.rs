//! WMS / WMTS capabilities model and parser.
//!
//! Handles WMS 1.1.1 (`WMT_MS_Capabilities`), WMS 1.3.0 (`WMS_Capabilities`),
//! WMTS 1.0.0 (`Capabilities`) and WMS-C tile sets advertised through
//! `VendorSpecificCapabilities`.

use crate::exceptions;
use crate::getfeatureinfo::{IdentifyFormat, ProviderCapabilities};
use crate::xml::XmlElement;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use wms_common::tile::TileMatrixSet;
use wms_common::{
    AxisOrientationPolicy, BoundingBox, Crs, CrsTransformer, TileMatrix, TileMatrixLimits,
    WmsError, WmsResult,
};

/// The CRS of geographic bounding boxes.
pub const DEFAULT_LATLON_CRS: &str = "CRS:84";

/// How axis order is decided while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserSettings {
    pub axis_policy: AxisOrientationPolicy,
    /// Flip whatever the policy decided.
    pub invert_axis_orientation: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceProperty {
    pub title: String,
    pub abstract_: String,
    pub keywords: Vec<String>,
    pub online_resource: String,
    pub fees: String,
    pub access_constraints: String,
    pub layer_limit: u32,
    pub max_width: u32,
    pub max_height: u32,
}

/// One request type with its formats and endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationType {
    pub formats: Vec<String>,
    /// DCP HTTP GET hrefs.
    pub get_urls: Vec<String>,
    /// WMTS encodings, e.g. "KVP" or "RESTful".
    pub allowed_encodings: Vec<String>,
}

impl OperationType {
    /// First advertised GET endpoint.
    pub fn get_url(&self) -> Option<&str> {
        self.get_urls
            .iter()
            .map(String::as_str)
            .find(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestProperty {
    pub get_map: OperationType,
    pub get_feature_info: OperationType,
    pub get_tile: OperationType,
    pub get_legend_graphic: OperationType,
}

/// Bounding box in a named CRS, axis order already normalised to x/y.
#[derive(Debug, Clone, PartialEq)]
pub struct CrsBoundingBox {
    pub crs: String,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegendUrl {
    pub format: String,
    pub href: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleProperty {
    pub name: String,
    pub title: String,
    pub abstract_: String,
    pub legend_urls: Vec<LegendUrl>,
}

/// A node of the WMS layer tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerProperty {
    pub order_id: usize,
    pub name: String,
    pub title: String,
    pub abstract_: String,
    pub keywords: Vec<String>,
    pub crs: Vec<String>,
    pub geographic_bbox: Option<BoundingBox>,
    pub bounding_boxes: Vec<CrsBoundingBox>,
    pub styles: Vec<StyleProperty>,
    pub queryable: bool,
    pub cascaded: u32,
    pub opaque: bool,
    pub no_subsets: bool,
    pub fixed_width: u32,
    pub fixed_height: u32,
    pub layers: Vec<LayerProperty>,
}

impl LayerProperty {
    /// Find `name` in this layer or its descendants.
    pub fn find(&self, name: &str) -> Option<&LayerProperty> {
        if self.name == name {
            return Some(self);
        }
        self.layers.iter().find_map(|l| l.find(name))
    }

    pub fn style(&self, name: &str) -> Option<&StyleProperty> {
        self.styles.iter().find(|s| s.name == name)
    }
}

/// How tiles of a tile layer are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMode {
    Wmts,
    Wmsc,
    Xyz,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WmtsLegendUrl {
    pub format: String,
    pub min_scale: f64,
    pub max_scale: f64,
    pub href: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileStyle {
    pub identifier: String,
    pub title: String,
    pub abstract_: String,
    pub keywords: Vec<String>,
    pub legend_urls: Vec<WmtsLegendUrl>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dimension {
    pub identifier: String,
    pub title: String,
    pub abstract_: String,
    pub keywords: Vec<String>,
    pub uom: String,
    pub unit_symbol: String,
    pub default_value: String,
    pub current: bool,
    pub values: Vec<String>,
}

/// A tile matrix set usable by a layer, with optional per matrix limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileMatrixSetLink {
    pub tile_matrix_set: String,
    pub limits: BTreeMap<String, TileMatrixLimits>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileLayer {
    pub tile_mode: TileMode,
    pub identifier: String,
    pub title: String,
    pub abstract_: String,
    pub keywords: Vec<String>,
    pub bounding_boxes: Vec<CrsBoundingBox>,
    pub formats: Vec<String>,
    pub info_formats: Vec<String>,
    pub default_style: String,
    pub dimensions: BTreeMap<String, Dimension>,
    pub styles: BTreeMap<String, TileStyle>,
    /// Links in document order; the first one is the preferred set.
    pub set_links: Vec<TileMatrixSetLink>,
    /// REST tile templates by format.
    pub get_tile_urls: BTreeMap<String, String>,
    /// REST feature info templates by format.
    pub get_feature_info_urls: BTreeMap<String, String>,
}

impl TileLayer {
    pub fn new(tile_mode: TileMode, identifier: impl Into<String>) -> Self {
        Self {
            tile_mode,
            identifier: identifier.into(),
            title: String::new(),
            abstract_: String::new(),
            keywords: Vec::new(),
            bounding_boxes: Vec::new(),
            formats: Vec::new(),
            info_formats: Vec::new(),
            default_style: String::new(),
            dimensions: BTreeMap::new(),
            styles: BTreeMap::new(),
            set_links: Vec::new(),
            get_tile_urls: BTreeMap::new(),
            get_feature_info_urls: BTreeMap::new(),
        }
    }

    pub fn set_link(&self, tile_matrix_set: &str) -> Option<&TileMatrixSetLink> {
        self.set_links
            .iter()
            .find(|l| l.tile_matrix_set == tile_matrix_set)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WmtsTheme {
    pub identifier: String,
    pub title: String,
    pub abstract_: String,
    pub keywords: Vec<String>,
    pub sub_theme: Option<Box<WmtsTheme>>,
    pub layer_refs: Vec<String>,
}

/// Parsed server capabilities.
#[derive(Debug, Clone, Default)]
pub struct WmsCapabilities {
    pub version: String,
    pub service: ServiceProperty,
    pub request: RequestProperty,
    /// Top level layers of the WMS layer tree.
    pub layers: Vec<LayerProperty>,
    /// Every named layer, in document order.
    pub layers_supported: Vec<LayerProperty>,
    pub queryable_for_layer: HashMap<String, bool>,
    /// Parent order id by child order id.
    pub layer_parents: HashMap<usize, usize>,
    pub tile_layers: Vec<TileLayer>,
    pub tile_matrix_sets: BTreeMap<String, TileMatrixSet>,
    pub themes: Vec<WmtsTheme>,
    /// Server format string for each supported identify kind.
    pub identify_formats: BTreeMap<IdentifyFormat, String>,
    pub parser_settings: ParserSettings,
    pub(crate) layer_count: usize,
}

impl WmsCapabilities {
    /// Parse a GetCapabilities response body.
    pub fn parse_response(response: &[u8], settings: ParserSettings) -> WmsResult<Self> {
        if response.is_empty() {
            return Err(WmsError::capabilities(
                "WMS provider error",
                "empty capabilities document",
            ));
        }

        if response.starts_with(b"<html>") || response.starts_with(b"<HTML>") {
            return Err(WmsError::Capabilities {
                title: "WMS provider error".to_string(),
                format: "text/html".to_string(),
                text: String::from_utf8_lossy(response).into_owned(),
            });
        }

        let mut caps = WmsCapabilities {
            parser_settings: settings,
            ..Default::default()
        };
        caps.parse_capabilities_dom(response)?;

        let formats = caps.request.get_feature_info.formats.clone();
        for f in formats {
            debug!(format = %f, "supported identify format");
            caps.identify_formats
                .insert(IdentifyFormat::from_info_format(&f), f);
        }

        Ok(caps)
    }

    fn parse_capabilities_dom(&mut self, xml: &[u8]) -> WmsResult<()> {
        let text = String::from_utf8_lossy(xml);
        let root = XmlElement::parse(&text).map_err(|e| {
            WmsError::capabilities(
                "Dom Exception",
                format!(
                    "Could not get WMS capabilities: {} at line {} column {}\n\
                     This is probably due to an incorrect WMS Server URL.\nResponse was:\n\n{}",
                    e.message, e.line, e.column, text
                ),
            )
        })?;

        if exceptions::is_exception_report(&root) {
            if let Some(e) = exceptions::exceptions_of(&root).pop() {
                return Err(e.into_error());
            }
        }

        if !matches!(
            root.tag(),
            "WMS_Capabilities" | "WMT_MS_Capabilities" | "Capabilities"
        ) {
            return Err(WmsError::capabilities(
                "Dom Exception",
                format!(
                    "Could not get WMS capabilities in the expected format (DTD): no WMS_Capabilities \
                     or WMT_MS_Capabilities found.\nThis might be due to an incorrect WMS Server URL.\n\
                     Tag:{}\nResponse was:\n{}",
                    root.tag(),
                    text
                ),
            ));
        }

        self.version = root.attr("version").unwrap_or_default().to_string();

        for e in &root.children {
            match e.tag() {
                "Service" | "ows:ServiceProvider" | "ows:ServiceIdentification" => {
                    self.parse_service(e)
                }
                "Capability" | "ows:OperationsMetadata" => self.parse_capability(e),
                "Contents" => self.parse_wmts_contents(e),
                _ => {}
            }
        }

        Ok(())
    }

    fn parse_service(&mut self, e: &XmlElement) {
        for e1 in &e.children {
            let tag = e1.tag();
            let tag = tag.strip_prefix("ows:").unwrap_or(tag);
            let s = &mut self.service;
            match tag {
                "Title" => s.title = e1.text().to_string(),
                "Abstract" => s.abstract_ = e1.text().to_string(),
                "KeywordList" | "Keywords" => s.keywords.extend(
                    e1.children
                        .iter()
                        .filter(|k| k.local_name() == "Keyword")
                        .map(|k| k.text().to_string()),
                ),
                "OnlineResource" => {
                    s.online_resource = e1.attr("xlink:href").unwrap_or_default().to_string()
                }
                "Fees" => s.fees = e1.text().to_string(),
                "AccessConstraints" => s.access_constraints = e1.text().to_string(),
                "LayerLimit" => s.layer_limit = e1.text().parse().unwrap_or(0),
                "MaxWidth" => s.max_width = e1.text().parse().unwrap_or(0),
                "MaxHeight" => s.max_height = e1.text().parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    fn parse_capability(&mut self, e: &XmlElement) {
        for e1 in &e.children {
            match e1.tag() {
                "Request" => self.parse_request(e1),
                "Layer" => {
                    let mut layer = LayerProperty::default();
                    self.parse_layer(e1, &mut layer, None);
                    self.layers.push(layer);
                }
                "VendorSpecificCapabilities" => {
                    for e2 in e1.children_named("TileSet") {
                        self.parse_tile_set_profile(e2);
                    }
                }
                "ows:Operation" => self.parse_ows_operation(e1),
                _ => {}
            }
        }
    }

    fn parse_ows_operation(&mut self, e: &XmlElement) {
        let name = e.attr("name").unwrap_or_default();
        let Some(get) = e.path(&["ows:DCP", "ows:HTTP", "ows:Get"]) else {
            debug!(operation = %name, "http get missing from ows:Operation");
            return;
        };
        let Some(href) = get.attr("xlink:href") else {
            debug!(operation = %name, "http get missing from ows:Operation");
            return;
        };

        let op = match name {
            "GetTile" => &mut self.request.get_tile,
            "GetFeatureInfo" => &mut self.request.get_feature_info,
            "GetLegendGraphic" | "sld:GetLegendGraphic" => &mut self.request.get_legend_graphic,
            _ => {
                debug!(operation = %name, "ows:Operation ignored");
                return;
            }
        };

        op.get_urls.push(href.to_string());
        op.allowed_encodings = get
            .path(&["ows:Constraint", "ows:AllowedValues"])
            .map(|v| {
                v.children_named("ows:Value")
                    .map(|x| x.text().to_string())
                    .collect()
            })
            .unwrap_or_default();
    }

    fn parse_request(&mut self, e: &XmlElement) {
        for e1 in &e.children {
            let operation = if e1.name == "Operation" {
                e1.attr("name").unwrap_or_default()
            } else {
                e1.name.as_str()
            };
            let op = match operation {
                "GetMap" => &mut self.request.get_map,
                "GetFeatureInfo" => &mut self.request.get_feature_info,
                "GetLegendGraphic" | "sld:GetLegendGraphic" => &mut self.request.get_legend_graphic,
                _ => continue,
            };
            parse_operation_type(e1, op);
        }
    }

    fn parse_layer(
        &mut self,
        e: &XmlElement,
        layer: &mut LayerProperty,
        parent_order_id: Option<usize>,
    ) {
        self.layer_count += 1;
        layer.order_id = self.layer_count;
        layer.queryable = attr_uint(e, "queryable") != 0;
        layer.cascaded = attr_uint(e, "cascaded");
        layer.opaque = attr_uint(e, "opaque") != 0;
        layer.no_subsets = attr_uint(e, "noSubsets") != 0;
        layer.fixed_width = attr_uint(e, "fixedWidth");
        layer.fixed_height = attr_uint(e, "fixedHeight");

        for e1 in &e.children {
            match e1.tag() {
                "Layer" => {
                    // Inheritance of layer properties
                    let mut sub = LayerProperty {
                        styles: layer.styles.clone(),
                        crs: layer.crs.clone(),
                        bounding_boxes: layer.bounding_boxes.clone(),
                        geographic_bbox: layer.geographic_bbox,
                        ..Default::default()
                    };
                    self.parse_layer(e1, &mut sub, Some(layer.order_id));
                    layer.layers.push(sub);
                }
                "Name" => layer.name = e1.text().to_string(),
                "Title" => layer.title = e1.text().to_string(),
                "Abstract" => layer.abstract_ = e1.text().to_string(),
                "KeywordList" => layer.keywords.extend(
                    e1.children_named("Keyword")
                        .map(|k| k.text().to_string()),
                ),
                "SRS" | "CRS" => {
                    layer
                        .crs
                        .extend(e1.text().split_whitespace().map(str::to_string));
                }
                "LatLonBoundingBox" => {
                    let bbox = attr_bbox(e1);
                    layer.geographic_bbox = Some(match e1.attr("SRS") {
                        Some(srs) if srs != DEFAULT_LATLON_CRS => {
                            transform_to_latlon(srs, &bbox).unwrap_or(bbox)
                        }
                        _ => bbox,
                    });
                }
                "EX_GeographicBoundingBox" => {
                    let bound = |name: &str| e1.child(name).and_then(|c| c.text().parse::<f64>().ok());
                    if let (Some(w), Some(east), Some(s), Some(n)) = (
                        bound("westBoundLongitude"),
                        bound("eastBoundLongitude"),
                        bound("southBoundLatitude"),
                        bound("northBoundLatitude"),
                    ) {
                        layer.geographic_bbox = Some(BoundingBox::new(w, s, east, n));
                    }
                }
                "BoundingBox" => {
                    let crs = e1.attr("CRS").or_else(|| e1.attr("SRS"));
                    if let Some(crs) = crs {
                        let mut bbox = attr_bbox(e1);
                        if self.should_invert_axis_orientation(crs) {
                            bbox = bbox.inverted();
                        }
                        layer.bounding_boxes.push(CrsBoundingBox {
                            crs: crs.to_string(),
                            bbox,
                        });
                    }
                }
                "Style" => {
                    let style = parse_style(e1);
                    // Servers repeat inherited style names to override them.
                    layer.styles.retain(|s| s.name != style.name);
                    layer.styles.push(style);
                }
                _ => {}
            }
        }

        if let Some(parent) = parent_order_id {
            self.layer_parents.insert(layer.order_id, parent);
        }

        if !layer.name.is_empty() {
            self.queryable_for_layer
                .insert(layer.name.clone(), layer.queryable);
            self.layers_supported.push(layer.clone());
        }
    }

    fn parse_tile_set_profile(&mut self, e: &XmlElement) {
        let mut layers = Vec::new();
        let mut styles = Vec::new();
        let mut resolutions: Vec<f64> = Vec::new();
        let mut tile_size = (0u32, 0u32);
        let mut crs = String::new();
        let mut l = TileLayer::new(TileMode::Wmsc, "");

        for e1 in &e.children {
            match e1.tag() {
                "Layers" => layers.push(e1.text().to_string()),
                "Styles" => styles.push(e1.text().to_string()),
                "Width" => tile_size.0 = e1.text().parse().unwrap_or(0),
                "Height" => tile_size.1 = e1.text().parse().unwrap_or(0),
                "SRS" => crs = e1.text().to_string(),
                "Format" => l.formats.push(e1.text().to_string()),
                "BoundingBox" => {
                    let bb_crs = ["SRS", "srs", "CRS", "crs"]
                        .iter()
                        .find_map(|a| e1.attr(a));
                    if let Some(bb_crs) = bb_crs {
                        let authid = Crs::from_ogc(bb_crs)
                            .map(|c| c.authid)
                            .unwrap_or_else(|_| bb_crs.to_string());
                        l.bounding_boxes.push(CrsBoundingBox {
                            crs: authid,
                            bbox: attr_bbox(e1),
                        });
                    }
                }
                "Resolutions" => {
                    resolutions = e1
                        .text()
                        .split(' ')
                        .filter(|r| !r.is_empty())
                        .filter_map(|r| r.parse().ok())
                        .collect();
                }
                _ => {}
            }
        }

        let mut set = TileMatrixSet::new(
            format!("{}-wmsc-{}", layers.join("_"), self.tile_layers.len()),
            crs,
        );

        l.identifier = layers.join(",");
        let style = styles.join(",");
        l.styles.insert(
            style.clone(),
            TileStyle {
                identifier: style.clone(),
                ..Default::default()
            },
        );
        l.default_style = style;
        l.set_links.push(TileMatrixSetLink {
            tile_matrix_set: set.identifier.clone(),
            limits: BTreeMap::new(),
        });

        if let Some(extent) = l.bounding_boxes.first().map(|b| b.bbox) {
            if tile_size.0 > 0 && tile_size.1 > 0 {
                for (i, r) in resolutions.iter().copied().filter(|r| *r > 0.0).enumerate() {
                    let mw = (extent.width() / tile_size.0 as f64 / r).ceil();
                    let mh = (extent.height() / tile_size.1 as f64 / r).ceil();
                    set.insert(TileMatrix {
                        identifier: i.to_string(),
                        scale_denominator: 0.0,
                        top_left_corner: (extent.min_x, extent.min_y + mh * tile_size.1 as f64 * r),
                        tile_width: tile_size.0,
                        tile_height: tile_size.1,
                        matrix_width: mw as u32,
                        matrix_height: mh as u32,
                        tres: r,
                    });
                }
            }
        }

        self.tile_layers.push(l);
        self.tile_matrix_sets.insert(set.identifier.clone(), set);
    }

    fn parse_wmts_contents(&mut self, e: &XmlElement) {
        self.tile_matrix_sets.clear();
        for e0 in e.children_named("TileMatrixSet") {
            let supported_crs = e0.child_text("ows:SupportedCRS");
            let crs = Crs::from_ogc(supported_crs).ok();

            let mut s = TileMatrixSet::new(
                e0.child_text("ows:Identifier"),
                crs.as_ref()
                    .map(|c| c.authid.clone())
                    .unwrap_or_else(|| supported_crs.to_string()),
            );
            s.title = e0.child_text("ows:Title").to_string();
            s.abstract_ = e0.child_text("ows:Abstract").to_string();
            s.keywords = parse_keywords(e0);
            let wk = e0.child_text("WellKnownScaleSet");
            s.well_known_scale_set = (!wk.is_empty()).then(|| wk.to_string());

            let meters_per_unit = crs.as_ref().map(Crs::meters_per_unit).unwrap_or(1.0);
            let invert = self.invert_for_crs(crs.as_ref());

            debug!(
                set = %s.identifier,
                supported_crs = %supported_crs,
                meters_per_unit,
                invert,
                "tile matrix set"
            );

            for e1 in e0.children_named("TileMatrix") {
                let top_left: Vec<&str> = e1.child_text("TopLeftCorner").split(' ').collect();
                let [a, b] = top_left.as_slice() else {
                    continue;
                };
                let (a, b) = (a.parse().unwrap_or(0.0), b.parse().unwrap_or(0.0));
                let top_left = if invert { (b, a) } else { (a, b) };

                let m = TileMatrix::from_scale(
                    e1.child_text("ows:Identifier"),
                    e1.child_text("ScaleDenominator").parse().unwrap_or(0.0),
                    top_left,
                    (
                        e1.child_text("TileWidth").parse().unwrap_or(0),
                        e1.child_text("TileHeight").parse().unwrap_or(0),
                    ),
                    (
                        e1.child_text("MatrixWidth").parse().unwrap_or(0),
                        e1.child_text("MatrixHeight").parse().unwrap_or(0),
                    ),
                    meters_per_unit,
                );
                s.insert(m);
            }

            self.tile_matrix_sets.insert(s.identifier.clone(), s);
        }

        self.tile_layers.clear();
        for e0 in e.children_named("Layer") {
            let layer = self.parse_wmts_layer(e0);
            self.tile_layers.push(layer);
        }

        self.themes = e
            .child("Themes")
            .map(|t| t.children_named("Theme").map(parse_theme).collect())
            .unwrap_or_default();

        let mut layers = std::mem::take(&mut self.tile_layers);
        for l in layers.iter_mut().filter(|l| l.bounding_boxes.is_empty()) {
            match self.detect_tile_layer_bounding_box(l) {
                Some(bb) => l.bounding_boxes.push(bb),
                None => l.bounding_boxes.push(CrsBoundingBox {
                    crs: DEFAULT_LATLON_CRS.to_string(),
                    bbox: BoundingBox::new(-180.0, -90.0, 180.0, 90.0),
                }),
            }
        }
        self.tile_layers = layers;
    }

    fn parse_wmts_layer(&mut self, e0: &XmlElement) -> TileLayer {
        let mut l = TileLayer::new(TileMode::Wmts, e0.child_text("ows:Identifier"));
        l.title = e0.child_text("ows:Title").to_string();
        l.abstract_ = e0.child_text("ows:Abstract").to_string();
        l.keywords = parse_keywords(e0);

        if let Some(bbox) = e0
            .child("ows:WGS84BoundingBox")
            .and_then(corner_bbox)
        {
            l.bounding_boxes.push(CrsBoundingBox {
                crs: DEFAULT_LATLON_CRS.to_string(),
                bbox,
            });
        }

        for e1 in e0.children_named("ows:BoundingBox") {
            let Some(mut bbox) = corner_bbox(e1) else {
                continue;
            };
            let Some(crs) = ["SRS", "srs", "CRS", "crs"].iter().find_map(|a| e1.attr(a)) else {
                continue;
            };
            let Ok(crs) = Crs::from_ogc(crs) else {
                continue;
            };
            if self.invert_for_crs(Some(&crs)) {
                bbox = bbox.inverted();
            }
            l.bounding_boxes.push(CrsBoundingBox {
                crs: crs.authid,
                bbox,
            });
        }

        for e1 in e0.children_named("Style") {
            let s = TileStyle {
                identifier: e1.child_text("ows:Identifier").to_string(),
                title: e1.child_text("ows:Title").to_string(),
                abstract_: e1.child_text("ows:Abstract").to_string(),
                keywords: parse_keywords(e1),
                legend_urls: e1
                    .children_named("ows:legendURL")
                    .map(|u| WmtsLegendUrl {
                        format: u.child_text("format").to_string(),
                        min_scale: u.child_text("minScale").parse().unwrap_or(0.0),
                        max_scale: u.child_text("maxScale").parse().unwrap_or(0.0),
                        href: u.child_text("href").to_string(),
                        width: u.child_text("width").parse().unwrap_or(0),
                        height: u.child_text("height").parse().unwrap_or(0),
                    })
                    .collect(),
                is_default: e1.attr("isDefault") == Some("true"),
            };
            if s.is_default {
                l.default_style = s.identifier.clone();
            }
            l.styles.insert(s.identifier.clone(), s);
        }

        if l.styles.is_empty() {
            l.styles.insert(
                "default".to_string(),
                TileStyle {
                    identifier: "default".to_string(),
                    title: "Generated default style".to_string(),
                    abstract_: "Style was missing in capabilities".to_string(),
                    ..Default::default()
                },
            );
        }

        l.formats = e0
            .children_named("Format")
            .map(|f| f.text().to_string())
            .collect();

        for e1 in e0.children_named("InfoFormat") {
            let format = e1.text().to_string();
            l.info_formats.push(format.clone());
            let kind = IdentifyFormat::from_info_format(&format);
            if kind != IdentifyFormat::Undefined {
                self.identify_formats.insert(kind, format);
            }
        }

        for e1 in e0.children_named("Dimension") {
            let identifier = e1.child_text("ows:Identifier");
            if identifier.is_empty() {
                continue;
            }
            let d = Dimension {
                identifier: identifier.to_string(),
                title: e1.child_text("ows:Title").to_string(),
                abstract_: e1.child_text("ows:Abstract").to_string(),
                keywords: parse_keywords(e1),
                uom: e1.child_text("UOM").to_string(),
                unit_symbol: e1.child_text("unitSymbol").to_string(),
                default_value: e1.child_text("Default").to_string(),
                current: e1.child_text("current") == "true",
                values: e1
                    .children_named("Value")
                    .map(|v| v.text().to_string())
                    .collect(),
            };
            l.dimensions.insert(d.identifier.clone(), d);
        }

        for e1 in e0.children_named("TileMatrixSetLink") {
            let set_id = e1.child_text("TileMatrixSet");
            let Some(tms) = self.tile_matrix_sets.get(set_id) else {
                debug!(layer = %l.identifier, set = %set_id, "linked tile matrix set not found");
                continue;
            };

            let mut link = TileMatrixSetLink {
                tile_matrix_set: set_id.to_string(),
                limits: BTreeMap::new(),
            };

            for e3 in e1
                .children_named("TileMatrixSetLimits")
                .flat_map(|e2| e2.children_named("TileMatrixLimits"))
            {
                let id = e3.child_text("TileMatrix");
                let limit = TileMatrixLimits {
                    tile_matrix: id.to_string(),
                    min_tile_row: e3.child_text("MinTileRow").parse().unwrap_or(0),
                    max_tile_row: e3.child_text("MaxTileRow").parse().unwrap_or(0),
                    min_tile_col: e3.child_text("MinTileCol").parse().unwrap_or(0),
                    max_tile_col: e3.child_text("MaxTileCol").parse().unwrap_or(0),
                };
                let valid = tms
                    .get_matrix(id)
                    .map(|m| limit.is_valid_for(m))
                    .unwrap_or(false);
                debug!(
                    matrix = %id,
                    min_row = limit.min_tile_row,
                    max_row = limit.max_tile_row,
                    min_col = limit.min_tile_col,
                    max_col = limit.max_tile_col,
                    valid,
                    "tile matrix limits"
                );
                if valid {
                    link.limits.insert(id.to_string(), limit);
                }
            }

            l.set_links.push(link);
        }

        for e1 in e0.children_named("ResourceURL") {
            let format = e1.attr_ignore_case("format").unwrap_or_default();
            let resource_type = e1.attr_ignore_case("resourceType").unwrap_or_default();
            let template = e1.attr_ignore_case("template").unwrap_or_default();

            if format.is_empty() || resource_type.is_empty() || template.is_empty() {
                debug!(%format, %resource_type, %template, "ResourceURL incomplete");
                continue;
            }

            match resource_type {
                "tile" => {
                    l.get_tile_urls
                        .insert(format.to_string(), template.to_string());
                }
                "FeatureInfo" => {
                    l.get_feature_info_urls
                        .insert(format.to_string(), template.to_string());
                    let kind = IdentifyFormat::from_info_format(format);
                    if kind != IdentifyFormat::Undefined {
                        self.identify_formats.insert(kind, format.to_string());
                    }
                }
                _ => debug!(%format, %resource_type, %template, "ResourceURL ignored"),
            }
        }

        l
    }

    /// Extent of a tile layer derived from the coarsest matrix of its first
    /// linked tile matrix set.
    fn detect_tile_layer_bounding_box(&self, l: &TileLayer) -> Option<CrsBoundingBox> {
        let link = l.set_links.first()?;
        let tms = self.tile_matrix_sets.get(&link.tile_matrix_set)?;
        let crs = Crs::from_ogc(&tms.crs).ok()?;
        let tm = tms.coarsest()?;

        let extent = tm.extent();
        debug!(set = %tms.identifier, matrix = %tm.identifier, "detected tile layer extent");

        Some(CrsBoundingBox {
            crs: crs.authid,
            bbox: extent,
        })
    }

    fn invert_for_crs(&self, crs: Option<&Crs>) -> bool {
        let invert = crs
            .map(|c| self.parser_settings.axis_policy.is_inverted(c))
            .unwrap_or(false);
        invert != self.parser_settings.invert_axis_orientation
    }

    /// Whether BBOX values for `crs` are exchanged northing first.
    ///
    /// Only WMS 1.3 honours the CRS axis order.
    pub fn should_invert_axis_orientation(&self, crs: &str) -> bool {
        let mut change_xy = false;
        if self.parser_settings.axis_policy != AxisOrientationPolicy::Ignore
            && (self.version == "1.3.0" || self.version == "1.3")
        {
            change_xy = Crs::from_ogc(crs)
                .map(|c| self.parser_settings.axis_policy.is_inverted(&c))
                .unwrap_or(false);
        }
        change_xy != self.parser_settings.invert_axis_orientation
    }

    /// Find a layer anywhere in the layer tree.
    pub fn find_layer(&self, name: &str) -> Option<&LayerProperty> {
        self.layers.iter().find_map(|l| l.find(name))
    }

    pub fn is_queryable(&self, name: &str) -> bool {
        self.queryable_for_layer.get(name).copied().unwrap_or(false)
    }

    pub fn tile_layer(&self, identifier: &str) -> Option<&TileLayer> {
        self.tile_layers.iter().find(|l| l.identifier == identifier)
    }

    /// Extent of a WMS layer in `crs`.
    ///
    /// Prefers a bounding box given for `crs`, otherwise reprojects the
    /// geographic bounding box.
    pub fn extent_for_non_tiled_layer(
        &self,
        name: &str,
        crs: &str,
        transformer: &dyn CrsTransformer,
    ) -> Option<BoundingBox> {
        let layer = self.find_layer(name)?;

        if let Some(bb) = layer.bounding_boxes.iter().find(|b| b.crs == crs) {
            return Some(bb.bbox);
        }

        let mut latlon = layer
            .bounding_boxes
            .iter()
            .filter(|b| b.crs == DEFAULT_LATLON_CRS)
            .map(|b| b.bbox);
        let extent = match layer.geographic_bbox {
            // A CRS:84 box enclosing the geographic one is inherited and less specific.
            Some(geographic) => latlon
                .find(|bbox| !bbox.contains(&geographic))
                .unwrap_or(geographic),
            None => latlon.next()?,
        };

        let dst = Crs::from_ogc(crs).ok()?;
        let extent = transformer
            .transform_bbox(&Crs::crs84(), &dst, &extent)
            .ok()?;
        extent.is_finite().then_some(extent)
    }

    /// Identify capability bits for the advertised info formats.
    pub fn identify_capabilities(&self) -> ProviderCapabilities {
        self.identify_formats
            .keys()
            .fold(ProviderCapabilities::NONE, |acc, f| acc | f.capability())
    }
}

fn parse_operation_type(e: &XmlElement, op: &mut OperationType) {
    for e1 in &e.children {
        match e1.tag() {
            "Format" => op.formats.push(e1.text().to_string()),
            "DCPType" => {
                for http in e1.children.iter().filter(|c| c.name == "HTTP") {
                    if let Some(href) = http
                        .child("Get")
                        .and_then(|g| g.child("OnlineResource"))
                        .and_then(|r| r.attr("xlink:href"))
                    {
                        op.get_urls.push(href.to_string());
                    }
                }
            }
            _ => {}
        }
    }
}

fn parse_style(e: &XmlElement) -> StyleProperty {
    let mut style = StyleProperty::default();
    for e1 in &e.children {
        match e1.tag() {
            "Name" => style.name = e1.text().to_string(),
            "Title" => style.title = e1.text().to_string(),
            "Abstract" => style.abstract_ = e1.text().to_string(),
            "LegendURL" => style.legend_urls.push(LegendUrl {
                format: e1.child_text("Format").to_string(),
                href: e1
                    .child("OnlineResource")
                    .and_then(|r| r.attr("xlink:href"))
                    .unwrap_or_default()
                    .to_string(),
                width: attr_uint(e1, "width"),
                height: attr_uint(e1, "height"),
            }),
            _ => {}
        }
    }
    style
}

fn parse_keywords(e: &XmlElement) -> Vec<String> {
    e.child("ows:Keywords")
        .map(|k| {
            k.children_named("ows:Keyword")
                .map(|x| x.text().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_theme(e: &XmlElement) -> WmtsTheme {
    WmtsTheme {
        identifier: e.child_text("ows:Identifier").to_string(),
        title: e.child_text("ows:Title").to_string(),
        abstract_: e.child_text("ows:Abstract").to_string(),
        keywords: parse_keywords(e),
        sub_theme: e.child("ows:Theme").map(|t| Box::new(parse_theme(t))),
        layer_refs: e
            .children_named("ows:LayerRef")
            .map(|r| r.text().to_string())
            .collect(),
    }
}

fn attr_uint(e: &XmlElement, name: &str) -> u32 {
    e.attr(name).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

fn attr_f64(e: &XmlElement, name: &str) -> f64 {
    e.attr(name).and_then(|v| v.trim().parse().ok()).unwrap_or(0.0)
}

fn attr_bbox(e: &XmlElement) -> BoundingBox {
    BoundingBox::new(
        attr_f64(e, "minx"),
        attr_f64(e, "miny"),
        attr_f64(e, "maxx"),
        attr_f64(e, "maxy"),
    )
}

/// `ows:LowerCorner` / `ows:UpperCorner` pair.
fn corner_bbox(e: &XmlElement) -> Option<BoundingBox> {
    let corner = |tag: &str| -> Option<(f64, f64)> {
        let parts: Vec<&str> = e.child_text(tag).split(' ').collect();
        match parts.as_slice() {
            [x, y] => Some((x.parse().unwrap_or(0.0), y.parse().unwrap_or(0.0))),
            _ => None,
        }
    };
    let (x1, y1) = corner("ows:LowerCorner")?;
    let (x2, y2) = corner("ows:UpperCorner")?;
    Some(BoundingBox::from_corners(x1, y1, x2, y2))
}

fn transform_to_latlon(srs: &str, bbox: &BoundingBox) -> Option<BoundingBox> {
    let src = Crs::from_ogc(srs).ok()?;
    wms_common::BuiltinTransformer
        .transform_bbox(&src, &Crs::crs84(), bbox)
        .ok()
}
