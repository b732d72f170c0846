//! OGC WMS and WMTS protocol implementation.
//!
//! Supports:
//! - WMS 1.1.1 and WMS 1.3.0 capabilities, GetMap, GetFeatureInfo and GetLegendGraphic
//! - WMTS 1.0.0 (KVP and RESTful bindings) and WMS-C tile sets
//! - XYZ slippy map tile templates

pub mod capabilities;
pub mod exceptions;
pub mod getfeatureinfo;
pub mod request;
pub mod settings;
pub mod xml;

pub use capabilities::{
    LayerProperty, ParserSettings, TileLayer, TileMatrixSetLink, TileMode, WmsCapabilities,
};
pub use exceptions::{parse_service_exception_report, service_exception_error, ServiceException};
pub use getfeatureinfo::{FeatureStore, IdentifyFormat, ProviderCapabilities};
pub use request::{LegendContext, QueryUrl, RequestBuilder, TileRequest};
pub use settings::{prepare_uri, DpiMode, WmsSettings};
