//! WMS GetFeatureInfo handling
//!
//! Identify formats, response demultiplexing and decoding of feature
//! responses (GML with or without an XSD schema, GeoJSON) into feature
//! stores.

use crate::xml::XmlElement;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use tracing::debug;
use wms_common::{Crs, CrsTransformer, WmsError, WmsResult};

/// Kind of identify result a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifyFormat {
    Undefined,
    Value,
    Text,
    Html,
    Feature,
}

impl IdentifyFormat {
    /// Map a server INFO_FORMAT string to an identify kind.
    ///
    /// WMS 1.0 uses "MIME" and "GML.n"; UMN MapServer advertises OGR
    /// output formats such as "OGRGML".
    pub fn from_info_format(format: &str) -> Self {
        match format {
            "MIME" | "text/plain" => IdentifyFormat::Text,
            "text/html" => IdentifyFormat::Html,
            "application/vnd.ogc.gml" | "application/json" => IdentifyFormat::Feature,
            f if f.starts_with("GML.") => IdentifyFormat::Feature,
            f if f.to_ascii_lowercase().contains("gml") => IdentifyFormat::Feature,
            _ => IdentifyFormat::Undefined,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "value" => Some(IdentifyFormat::Value),
            "text" => Some(IdentifyFormat::Text),
            "html" => Some(IdentifyFormat::Html),
            "feature" => Some(IdentifyFormat::Feature),
            _ => None,
        }
    }

    /// Capability bit announcing support for this kind.
    pub fn capability(&self) -> ProviderCapabilities {
        match self {
            IdentifyFormat::Undefined => ProviderCapabilities::NONE,
            IdentifyFormat::Value => ProviderCapabilities::IDENTIFY_VALUE,
            IdentifyFormat::Text => ProviderCapabilities::IDENTIFY_TEXT,
            IdentifyFormat::Html => ProviderCapabilities::IDENTIFY_HTML,
            IdentifyFormat::Feature => ProviderCapabilities::IDENTIFY_FEATURE,
        }
    }
}

/// Provider capability bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ProviderCapabilities(pub u32);

impl ProviderCapabilities {
    pub const NONE: Self = Self(0);
    pub const IDENTIFY: Self = Self(1 << 1);
    pub const IDENTIFY_VALUE: Self = Self(1 << 2);
    pub const IDENTIFY_TEXT: Self = Self(1 << 3);
    pub const IDENTIFY_HTML: Self = Self(1 << 4);
    pub const IDENTIFY_FEATURE: Self = Self(1 << 5);
    pub const SIZE: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ProviderCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProviderCapabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One body of a (possibly multipart) response with its headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponsePart {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponsePart {
    /// Header value by case-insensitive name, empty if absent.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }
}

/// Split a response body into parts.
///
/// A non-multipart response is one part carrying the response content type.
pub fn split_response(content_type: &str, body: &[u8]) -> WmsResult<Vec<ResponsePart>> {
    if !content_type.to_ascii_lowercase().starts_with("multipart/") {
        return Ok(vec![ResponsePart {
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.to_vec(),
        }]);
    }

    let boundary = content_type
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| WmsError::FeatureDecode("multipart boundary missing".to_string()))?;

    let delimiter = format!("--{}", boundary).into_bytes();
    let mut pos = find(body, &delimiter, 0)
        .ok_or_else(|| WmsError::FeatureDecode("multipart boundary not found".to_string()))?;

    let mut parts = Vec::new();
    loop {
        let start = pos + delimiter.len();
        if body[start..].starts_with(b"--") {
            break;
        }
        let next = find(body, &delimiter, start)
            .ok_or_else(|| WmsError::FeatureDecode("multipart closing boundary missing".to_string()))?;

        let raw = strip_line_break_suffix(strip_line_break_prefix(&body[start..next]));
        parts.push(parse_part(raw));
        pos = next;
    }

    debug!(parts = parts.len(), "multipart response");
    Ok(parts)
}

fn parse_part(raw: &[u8]) -> ResponsePart {
    // An empty header section leaves the part starting with a blank line.
    if let Some(rest) = strip_line_break(raw) {
        return ResponsePart {
            headers: Vec::new(),
            body: rest.to_vec(),
        };
    }

    let (head, body) = match find(raw, b"\r\n\r\n", 0) {
        Some(i) => (&raw[..i], &raw[i + 4..]),
        None => match find(raw, b"\n\n", 0) {
            Some(i) => (&raw[..i], &raw[i + 2..]),
            None => (raw, &raw[raw.len()..]),
        },
    };

    let headers = String::from_utf8_lossy(head)
        .lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    ResponsePart {
        headers,
        body: body.to_vec(),
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn strip_line_break(b: &[u8]) -> Option<&[u8]> {
    b.strip_prefix(b"\r\n").or_else(|| b.strip_prefix(b"\n"))
}

fn strip_line_break_prefix(b: &[u8]) -> &[u8] {
    strip_line_break(b).unwrap_or(b)
}

fn strip_line_break_suffix(b: &[u8]) -> &[u8] {
    b.strip_suffix(b"\r\n")
        .or_else(|| b.strip_suffix(b"\n"))
        .unwrap_or(b)
}

/// Indexes of the parts a feature response is decoded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartSelection {
    pub gml: Option<usize>,
    pub xsd: Option<usize>,
    pub json: Option<usize>,
}

/// Pick GML, XSD and JSON parts.
///
/// UMN MapServer names multipart bodies "*.xsd" and "*.dat". Without any
/// hint a single part is GML and two parts are GML followed by XSD.
pub fn select_parts(parts: &[ResponsePart]) -> PartSelection {
    let mut sel = PartSelection::default();
    for (i, p) in parts.iter().enumerate() {
        if sel.xsd.is_none() && p.header("Content-Disposition").contains(".xsd") {
            sel.xsd = Some(i);
        } else if sel.gml.is_none() && p.header("Content-Disposition").contains(".dat") {
            sel.gml = Some(i);
        } else if sel.json.is_none() && p.header("Content-Type").contains("json") {
            sel.json = Some(i);
        }
    }

    if sel == PartSelection::default() {
        match parts.len() {
            1 => sel.gml = Some(0),
            2 => {
                sel.gml = Some(0);
                sel.xsd = Some(1);
            }
            _ => {}
        }
    }
    sel
}

const WRAPPED_XML_PREFIX: &[u8] = b"Content-Type: text/xml\r\n\r\n";

/// Body of a single part response that may be a service exception report.
///
/// MapServer's OGR output wraps such reports in an "ogr/gml" reply.
pub fn exception_candidate(parts: &[ResponsePart]) -> Option<&[u8]> {
    let [part] = parts else {
        return None;
    };
    let content_type = part.header("Content-Type");
    if content_type.eq_ignore_ascii_case("text/xml") {
        return Some(&part.body);
    }
    if content_type.eq_ignore_ascii_case("ogr/gml") {
        return part.body.strip_prefix(WRAPPED_XML_PREFIX);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Double,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

pub type Point = (f64, f64);

/// Feature geometry in easting/northing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    Polygon(Vec<Vec<Point>>),
    MultiPoint(Vec<Point>),
    MultiLineString(Vec<Vec<Point>>),
    MultiPolygon(Vec<Vec<Vec<Point>>>),
}

impl Geometry {
    /// Parse a GeoJSON geometry object.
    pub fn from_geojson(v: &Value) -> Option<Geometry> {
        fn point(v: &Value) -> Option<Point> {
            let a = v.as_array()?;
            Some((a.first()?.as_f64()?, a.get(1)?.as_f64()?))
        }
        fn line(v: &Value) -> Option<Vec<Point>> {
            v.as_array()?.iter().map(point).collect()
        }
        fn rings(v: &Value) -> Option<Vec<Vec<Point>>> {
            v.as_array()?.iter().map(line).collect()
        }

        let coords = v.get("coordinates")?;
        match v.get("type")?.as_str()? {
            "Point" => point(coords).map(Geometry::Point),
            "LineString" => line(coords).map(Geometry::LineString),
            "Polygon" => rings(coords).map(Geometry::Polygon),
            "MultiPoint" => line(coords).map(Geometry::MultiPoint),
            "MultiLineString" => rings(coords).map(Geometry::MultiLineString),
            "MultiPolygon" => coords
                .as_array()?
                .iter()
                .map(rings)
                .collect::<Option<Vec<_>>>()
                .map(Geometry::MultiPolygon),
            _ => None,
        }
    }

    /// Parse a GML 2/3 geometry element.
    pub fn from_gml(e: &XmlElement) -> Option<Geometry> {
        match e.local_name() {
            "Point" => gml_points(e)?.first().copied().map(Geometry::Point),
            "LineString" | "LinearRing" => gml_points(e).map(Geometry::LineString),
            "Polygon" => gml_polygon(e).map(Geometry::Polygon),
            "MultiPoint" => {
                let pts = gml_members(e, &["pointMember", "pointMembers"])
                    .filter_map(|p| gml_points(p)?.first().copied())
                    .collect::<Vec<_>>();
                Some(Geometry::MultiPoint(pts))
            }
            "MultiLineString" | "MultiCurve" => {
                let lines = gml_members(e, &["lineStringMember", "curveMember", "curveMembers"])
                    .filter_map(gml_points)
                    .collect::<Vec<_>>();
                Some(Geometry::MultiLineString(lines))
            }
            "MultiPolygon" | "MultiSurface" => {
                let polys = gml_members(e, &["polygonMember", "surfaceMember", "surfaceMembers"])
                    .filter_map(gml_polygon)
                    .collect::<Vec<_>>();
                Some(Geometry::MultiPolygon(polys))
            }
            _ => None,
        }
    }

    /// Apply `f` to every vertex.
    pub fn try_map_points<E>(&mut self, f: &mut impl FnMut(Point) -> Result<Point, E>) -> Result<(), E> {
        fn all<E>(pts: &mut [Point], f: &mut impl FnMut(Point) -> Result<Point, E>) -> Result<(), E> {
            for p in pts.iter_mut() {
                *p = f(*p)?;
            }
            Ok(())
        }
        match self {
            Geometry::Point(p) => {
                *p = f(*p)?;
                Ok(())
            }
            Geometry::LineString(l) | Geometry::MultiPoint(l) => all(l, &mut *f),
            Geometry::Polygon(r) | Geometry::MultiLineString(r) => {
                r.iter_mut().try_for_each(|l| all(l, &mut *f))
            }
            Geometry::MultiPolygon(p) => p
                .iter_mut()
                .flat_map(|r| r.iter_mut())
                .try_for_each(|l| all(l, &mut *f)),
        }
    }

    /// Reproject in place.
    pub fn transform(
        &mut self,
        src: &Crs,
        dst: &Crs,
        transformer: &dyn CrsTransformer,
    ) -> Result<(), wms_common::crs::TransformError> {
        if src == dst {
            return Ok(());
        }
        self.try_map_points(&mut |(x, y)| transformer.transform_point(src, dst, x, y))
    }
}

/// Children of `e` (possibly wrapped in member elements) that are geometries.
fn gml_members<'a>(e: &'a XmlElement, members: &'a [&str]) -> impl Iterator<Item = &'a XmlElement> {
    e.children
        .iter()
        .filter(move |c| members.contains(&c.local_name()))
        .flat_map(|c| c.children.iter())
}

fn gml_polygon(e: &XmlElement) -> Option<Vec<Vec<Point>>> {
    let mut rings = Vec::new();
    for boundary in &e.children {
        match boundary.local_name() {
            "outerBoundaryIs" | "exterior" | "innerBoundaryIs" | "interior" => {
                for ring in &boundary.children {
                    rings.push(gml_points(ring)?);
                }
            }
            _ => {}
        }
    }
    (!rings.is_empty()).then_some(rings)
}

/// Vertices from gml:coordinates, gml:pos, gml:posList or gml:coord.
fn gml_points(e: &XmlElement) -> Option<Vec<Point>> {
    let mut pts = Vec::new();
    for c in &e.children {
        match c.local_name() {
            "coordinates" => {
                let decimal = c.attr("decimal").unwrap_or(".");
                let cs = c.attr("cs").unwrap_or(",");
                for tuple in c.text().split_whitespace() {
                    let mut it = tuple.split(cs).map(|v| v.replace(decimal, ".").parse::<f64>());
                    match (it.next(), it.next()) {
                        (Some(Ok(x)), Some(Ok(y))) => pts.push((x, y)),
                        _ => return None,
                    }
                }
            }
            "pos" => {
                let v: Vec<f64> = c.text().split_whitespace().filter_map(|v| v.parse().ok()).collect();
                if v.len() < 2 {
                    return None;
                }
                pts.push((v[0], v[1]));
            }
            "posList" => {
                let dim: usize = c
                    .attr("srsDimension")
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(2)
                    .max(2);
                let v: Vec<f64> = c.text().split_whitespace().filter_map(|v| v.parse().ok()).collect();
                pts.extend(v.chunks_exact(dim).map(|c| (c[0], c[1])));
            }
            "coord" => {
                let x = c.child("gml:X").or_else(|| c.child("X"))?.text().parse().ok()?;
                let y = c.child("gml:Y").or_else(|| c.child("Y"))?.text().parse().ok()?;
                pts.push((x, y));
            }
            _ => {}
        }
    }
    (!pts.is_empty()).then_some(pts)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Option<String>,
    /// Values in field order; `Null` where the feature has no value.
    pub attributes: Vec<Value>,
    pub geometry: Option<Geometry>,
}

/// Features of one type with the fields they share.
///
/// `params` records provenance: `sublayer`, `featureType` and
/// `getFeatureInfoUrl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStore {
    pub fields: Vec<Field>,
    pub crs: String,
    pub features: Vec<Feature>,
    pub params: BTreeMap<String, String>,
}

impl FeatureStore {
    pub fn set_provenance(&mut self, sublayer: &str, feature_type: &str, url: &str) {
        self.params.insert("sublayer".to_string(), sublayer.to_string());
        self.params
            .insert("featureType".to_string(), feature_type.to_string());
        self.params
            .insert("getFeatureInfoUrl".to_string(), url.to_string());
    }

    pub fn attribute(&self, feature: usize, field: &str) -> Option<&Value> {
        let idx = self.fields.iter().position(|f| f.name == field)?;
        self.features.get(feature)?.attributes.get(idx)
    }
}

/// Feature type description from an XSD or guessed from a GML body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureType {
    pub name: String,
    pub geometry_attribute: Option<String>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GmlSchema {
    pub types: Vec<FeatureType>,
}

impl GmlSchema {
    pub fn type_names(&self) -> Vec<&str> {
        self.types.iter().map(|t| t.name.as_str()).collect()
    }

    fn feature_type(&self, name: &str) -> Option<&FeatureType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Read feature types from an OGR/MapServer style application schema.
    pub fn parse_xsd(xsd: &[u8]) -> WmsResult<Self> {
        let text = String::from_utf8_lossy(xsd);
        let root = XmlElement::parse(&text)
            .map_err(|e| WmsError::FeatureDecode(format!("Cannot parse XSD: {}", e)))?;

        let complex_types: BTreeMap<&str, &XmlElement> = root
            .children
            .iter()
            .filter(|c| c.local_name() == "complexType")
            .filter_map(|c| Some((c.attr("name")?, c)))
            .collect();

        let mut schema = GmlSchema::default();
        for element in root.children.iter().filter(|c| c.local_name() == "element") {
            let is_feature = element
                .attr("substitutionGroup")
                .map(|g| g.ends_with("_Feature") || g.ends_with("AbstractFeature"))
                .unwrap_or(false);
            let (Some(name), Some(type_ref), true) =
                (element.attr("name"), element.attr("type"), is_feature)
            else {
                continue;
            };
            let type_name = type_ref.rsplit(':').next().unwrap_or(type_ref);
            let Some(complex) = complex_types.get(type_name) else {
                debug!(feature_type = %name, %type_name, "complex type not found in schema");
                continue;
            };

            let mut ft = FeatureType {
                name: name.to_string(),
                ..Default::default()
            };
            for e in complex
                .descendants()
                .into_iter()
                .filter(|e| e.local_name() == "element")
            {
                let Some(field_name) = e.attr("name") else {
                    continue;
                };
                let xsd_type = e
                    .attr("type")
                    .or_else(|| {
                        e.descendants()
                            .into_iter()
                            .find(|r| r.local_name() == "restriction")
                            .and_then(|r| r.attr("base"))
                    })
                    .unwrap_or("string");

                if xsd_type.starts_with("gml:") && xsd_type.ends_with("PropertyType") {
                    if ft.geometry_attribute.is_none() {
                        ft.geometry_attribute = Some(field_name.to_string());
                    }
                    continue;
                }

                let local = xsd_type.rsplit(':').next().unwrap_or(xsd_type);
                let field_type = match local {
                    "int" | "integer" | "long" | "short" | "byte" | "nonNegativeInteger"
                    | "positiveInteger" => FieldType::Integer,
                    "decimal" | "double" | "float" => FieldType::Double,
                    _ => FieldType::String,
                };
                ft.fields.push(Field::new(field_name, field_type));
            }
            schema.types.push(ft);
        }

        Ok(schema)
    }

    /// Infer feature types by scanning a GML document.
    pub fn guess(gml: &XmlElement) -> Self {
        let mut schema = GmlSchema::default();
        let mut values: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();

        for feature in feature_elements(gml) {
            let type_name = feature_type_name(feature);
            if schema.feature_type(&type_name).is_none() {
                schema.types.push(FeatureType {
                    name: type_name.clone(),
                    ..Default::default()
                });
            }
            let Some(ft) = schema.types.iter_mut().find(|t| t.name == type_name) else {
                continue;
            };

            for prop in feature.children.iter().filter(|c| !c.name.starts_with("gml:")) {
                let name = prop.local_name().to_string();
                if prop.children.iter().any(|c| Geometry::from_gml(c).is_some()) {
                    if ft.geometry_attribute.is_none() {
                        ft.geometry_attribute = Some(name);
                    }
                    continue;
                }
                if !prop.children.is_empty() {
                    continue;
                }
                if !ft.fields.iter().any(|f| f.name == name) {
                    ft.fields.push(Field::new(name.clone(), FieldType::String));
                }
                values
                    .entry((type_name.clone(), name))
                    .or_default()
                    .push(prop.text().to_string());
            }
        }

        for ft in &mut schema.types {
            for field in &mut ft.fields {
                let vals = values
                    .get(&(ft.name.clone(), field.name.clone()))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let present = vals.iter().filter(|v| !v.is_empty());
                field.field_type = if present.clone().all(|v| v.parse::<i64>().is_ok()) {
                    FieldType::Integer
                } else if present.clone().all(|v| v.parse::<f64>().is_ok()) {
                    FieldType::Double
                } else {
                    FieldType::String
                };
                if vals.iter().all(|v| v.is_empty()) {
                    field.field_type = FieldType::String;
                }
            }
        }

        schema
    }
}

/// Feature elements of a GML document: children of feature member
/// wrappers and MapServer "*_feature" elements.
fn feature_elements(root: &XmlElement) -> Vec<&XmlElement> {
    fn walk<'a>(e: &'a XmlElement, out: &mut Vec<&'a XmlElement>) {
        let member = matches!(e.local_name(), "featureMember" | "featureMembers" | "member");
        for c in &e.children {
            if member || c.local_name().ends_with("_feature") {
                out.push(c);
            } else {
                walk(c, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, &mut out);
    out
}

fn feature_type_name(e: &XmlElement) -> String {
    let name = e.local_name();
    name.strip_suffix("_feature").unwrap_or(name).to_string()
}

fn typed_value(raw: &str, field_type: FieldType) -> Value {
    match field_type {
        FieldType::Integer => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        FieldType::Double => raw
            .parse::<f64>()
            .ok()
            .and_then(|v| serde_json::Number::from_f64(v).map(Value::Number))
            .unwrap_or_else(|| Value::String(raw.to_string())),
        FieldType::String => Value::String(raw.to_string()),
    }
}

/// First srsName declared in a feature or document.
fn srs_name(e: &XmlElement) -> Option<&str> {
    e.descendants().into_iter().find_map(|d| d.attr("srsName"))
}

/// Decode a GML feature response into one store per feature type.
///
/// Geometries declared in another CRS are reprojected into `target`.
pub fn decode_gml(
    gml: &[u8],
    xsd: Option<&[u8]>,
    target: &Crs,
    transformer: &dyn CrsTransformer,
) -> WmsResult<Vec<FeatureStore>> {
    let text = String::from_utf8_lossy(gml);
    let root = XmlElement::parse(&text)
        .map_err(|e| WmsError::FeatureDecode(format!("Cannot identify: {}", e)))?;

    let guessed = xsd.is_none();
    let schema = match xsd {
        Some(xsd) => GmlSchema::parse_xsd(xsd)?,
        None => GmlSchema::guess(&root),
    };
    debug!(types = ?schema.type_names(), guessed, "gml feature types");

    let document_crs = srs_name(&root).and_then(|s| Crs::from_ogc(s).ok());
    let features = feature_elements(&root);

    let mut stores = Vec::new();
    for ft in &schema.types {
        let mut store = FeatureStore {
            fields: ft.fields.clone(),
            crs: target.authid.clone(),
            ..Default::default()
        };

        for e in features.iter().filter(|e| feature_type_name(e) == ft.name) {
            let attributes = ft
                .fields
                .iter()
                .map(|f| {
                    e.children
                        .iter()
                        .find(|c| c.local_name() == f.name)
                        .map(|c| typed_value(c.text(), f.field_type))
                        .unwrap_or(Value::Null)
                })
                .collect();

            let mut geometry = ft.geometry_attribute.as_deref().and_then(|g| {
                e.children
                    .iter()
                    .find(|c| c.local_name() == g)
                    .and_then(|p| p.children.iter().find_map(Geometry::from_gml))
            });

            let feature_crs = srs_name(e)
                .and_then(|s| Crs::from_ogc(s).ok())
                .or_else(|| document_crs.clone());
            if let (Some(g), Some(src)) = (geometry.as_mut(), feature_crs.as_ref()) {
                if let Err(err) = g.transform(src, target, transformer) {
                    debug!(error = %err, "gml geometry not reprojected");
                }
            }

            let id = e
                .attr("fid")
                .or_else(|| e.attr("gml:id"))
                .map(str::to_string);
            store.features.push(Feature {
                id,
                attributes,
                geometry,
            });
        }

        store
            .params
            .insert("featureType".to_string(), ft.name.clone());
        stores.push(store);
    }

    let parsed: usize = stores.iter().map(|s| s.features.len()).sum();
    if guessed && !schema.types.is_empty() && parsed == 0 {
        return Err(WmsError::FeatureDecode(format!(
            "Cannot identify. Result parsing failed. {} feature types were guessed from gml ({}) but no features were parsed.",
            schema.types.len(),
            schema.type_names().join(",")
        )));
    }

    Ok(stores)
}

/// Decode a GeoJSON FeatureCollection, one store per feature.
///
/// Attributes are kept as strings. Errors are reported as text because a
/// failed JSON decode is returned to the caller as a result entry.
pub fn decode_geojson(
    body: &[u8],
    target: &Crs,
    transformer: &dyn CrsTransformer,
) -> Result<Vec<FeatureStore>, String> {
    let result: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;

    if !result.is_object() {
        return Err("object expected".to_string());
    }

    let kind = result.get("type").and_then(Value::as_str).unwrap_or("");
    if kind != "FeatureCollection" {
        return Err(format!("type FeatureCollection expected: {}", kind));
    }

    let mut features_crs = None;
    if let Some(crs) = result.get("crs").filter(|c| !c.is_null()) {
        let props = crs.get("properties");
        let crs_text = match crs.get("type").and_then(Value::as_str) {
            Some("name") => props
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            Some("EPSG") => {
                let code = props.and_then(|p| p.get("code"));
                let code = match code {
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => String::new(),
                };
                format!("EPSG:{}", code)
            }
            _ => {
                debug!(crs = %crs, "crs not supported");
                String::new()
            }
        };
        let parsed = Crs::from_ogc(&crs_text).map_err(|_| format!("CRS {} invalid", crs_text))?;
        features_crs = Some(parsed);
    }

    let features = result
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| "FeatureCollection array expected".to_string())?;

    let mut stores = Vec::new();
    for (i, f) in features.iter().enumerate() {
        let Some(props) = f.get("properties").and_then(Value::as_object) else {
            debug!(feature = i, "no properties found");
            continue;
        };

        let fields = props
            .keys()
            .map(|k| Field::new(k.as_str(), FieldType::String))
            .collect();
        let attributes = props
            .values()
            .map(|v| match v {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            })
            .collect();

        let mut geometry = f.get("geometry").and_then(Geometry::from_geojson);
        if let (Some(g), Some(src)) = (geometry.as_mut(), features_crs.as_ref()) {
            g.transform(src, target, transformer)
                .map_err(|e| e.to_string())?;
        }

        let mut store = FeatureStore {
            fields,
            crs: target.authid.clone(),
            ..Default::default()
        };
        store.features.push(Feature {
            id: f.get("id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            attributes,
            geometry,
        });
        stores.push(store);
    }

    Ok(stores)
}
