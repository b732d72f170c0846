//! Raster data provider for OGC WMS, WMTS and WMS-C servers and XYZ tile
//! services.
//!
//! [`WmsProvider`] turns a data source URI into rendered map images,
//! GetFeatureInfo results and legend graphics. Tiles are shared between
//! providers through a [`storage::TileImageCache`].

pub mod canvas;
pub mod capabilities_download;
pub mod config;
pub mod feedback;
pub mod http;
pub mod identify;
pub mod legend;
pub mod provider;
pub mod single_image;
pub mod stats;
pub mod tiled;

pub use canvas::{Composition, MapCanvas};
pub use capabilities_download::{download_capabilities, CapabilitiesResponseCache};
pub use config::ProviderConfig;
pub use feedback::Feedback;
pub use http::{HttpClient, HttpResponse, ReqwestHttpClient, TransportError};
pub use identify::{IdentifyContext, IdentifyResult, IdentifyValue};
pub use legend::fetch_legend_graphic;
pub use provider::{ProviderContext, WmsProvider};
pub use stats::{ProviderStats, StatsRegistry};
