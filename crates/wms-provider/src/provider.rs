//! The WMS/WMTS/XYZ raster provider.
//!
//! A provider is built from a data source URI. Construction parses the URI,
//! fetches and parses the server capabilities (XYZ services get a synthetic
//! tile matrix set instead), selects the tile layer for the image CRS and
//! computes the layer extent. Any failure leaves an invalid provider that
//! reports the reason through [`WmsProvider::last_error`].

use image::RgbaImage;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use storage::{TileImageCache, TileMemoryCache};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};
use wms_common::tile::xyz_tile_matrix_set;
use wms_common::{
    BoundingBox, BuiltinTransformer, Crs, CrsTransformer, TileMatrix, TileMatrixSet, TilePosition,
    WmsError, WmsResult,
};
use wms_protocol::capabilities::{CrsBoundingBox, DEFAULT_LATLON_CRS};
use wms_protocol::{
    ProviderCapabilities, RequestBuilder, TileLayer, TileMatrixSetLink, TileMode, WmsCapabilities,
    WmsSettings,
};

use crate::canvas::{Composition, MapCanvas};
use crate::capabilities_download::{download_capabilities, CapabilitiesResponseCache};
use crate::config::ProviderConfig;
use crate::feedback::Feedback;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::single_image::ImageDownloadHandler;
use crate::stats::{ProviderStats, StatsRegistry};
use crate::tiled::{remove_covered, sort_by_center_distance, TileFetchContext, TiledImageDownloadHandler};

/// Resolution offsets searched for cached tiles by preview draws.
/// Positive offsets are coarser.
pub const PREVIEW_RESOLUTION_OFFSETS: [i32; 3] = [1, 2, -1];

/// Identifier of the synthetic tile matrix set of XYZ services.
const XYZ_TILE_MATRIX_SET: &str = "tms0";

/// Collaborators handed to a provider. Unset ones fall back to
/// process-wide defaults.
#[derive(Clone, Default)]
pub struct ProviderContext {
    pub config: ProviderConfig,
    pub client: Option<Arc<dyn HttpClient>>,
    pub tile_cache: Option<Arc<dyn TileImageCache>>,
    pub capabilities_cache: Option<Arc<CapabilitiesResponseCache>>,
    pub stats: Option<Arc<StatsRegistry>>,
    pub transformer: Option<Arc<dyn CrsTransformer>>,
    /// Receives the status messages of the provider.
    pub status: Option<UnboundedSender<String>>,
}

impl ProviderContext {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_tile_cache(mut self, cache: Arc<dyn TileImageCache>) -> Self {
        self.tile_cache = Some(cache);
        self
    }

    pub fn with_capabilities_cache(mut self, cache: Arc<CapabilitiesResponseCache>) -> Self {
        self.capabilities_cache = Some(cache);
        self
    }

    pub fn with_stats(mut self, registry: Arc<StatsRegistry>) -> Self {
        self.stats = Some(registry);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn CrsTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_status(mut self, status: UnboundedSender<String>) -> Self {
        self.status = Some(status);
        self
    }
}

/// Raster provider for one WMS, WMTS, WMS-C or XYZ data source.
pub struct WmsProvider {
    uri: String,
    pub(crate) settings: WmsSettings,
    pub(crate) caps: WmsCapabilities,
    pub(crate) config: ProviderConfig,
    pub(crate) transformer: Arc<dyn CrsTransformer>,
    client: Option<Arc<dyn HttpClient>>,
    tile_cache: Arc<dyn TileImageCache>,
    capabilities_cache: Arc<CapabilitiesResponseCache>,
    stats: Arc<ProviderStats>,
    status_tx: Option<UnboundedSender<String>>,
    /// Number of the most recent tiled draw.
    generation: Arc<AtomicU64>,
    /// Index of the selected layer in `caps.tile_layers`.
    tile_layer: Option<usize>,
    layer_extent: BoundingBox,
    dpi: Option<u32>,
    valid: bool,
    error: Mutex<Option<WmsError>>,
}

impl std::fmt::Debug for WmsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WmsProvider")
            .field("uri", &self.uri)
            .field("valid", &self.valid)
            .field("tiled", &self.settings.tiled)
            .field("crs", &self.settings.crs_id)
            .field("extent", &self.layer_extent)
            .finish()
    }
}

impl WmsProvider {
    /// Build a provider for `uri`, downloading the server capabilities.
    pub async fn new(uri: &str, ctx: ProviderContext) -> Self {
        Self::with_capabilities(uri, None, ctx).await
    }

    /// Build a provider reusing capabilities already parsed for the same
    /// server. Without them the document is downloaded.
    #[instrument(skip(caps, ctx))]
    pub async fn with_capabilities(
        uri: &str,
        caps: Option<WmsCapabilities>,
        ctx: ProviderContext,
    ) -> Self {
        let ProviderContext {
            config,
            client,
            tile_cache,
            capabilities_cache,
            stats,
            transformer,
            status,
        } = ctx;

        let tile_cache: Arc<dyn TileImageCache> = match tile_cache {
            Some(cache) => cache,
            None => TileMemoryCache::shared(),
        };
        let transformer: Arc<dyn CrsTransformer> = match transformer {
            Some(t) => t,
            None => Arc::new(BuiltinTransformer),
        };
        let stats = stats
            .map(|registry| registry.stat_for_uri(uri))
            .unwrap_or_default();

        let mut provider = WmsProvider {
            uri: uri.to_string(),
            settings: WmsSettings::default(),
            caps: WmsCapabilities::default(),
            config,
            transformer,
            client,
            tile_cache,
            capabilities_cache: capabilities_cache.unwrap_or_else(CapabilitiesResponseCache::shared),
            stats,
            status_tx: status,
            generation: Arc::new(AtomicU64::new(0)),
            tile_layer: None,
            layer_extent: BoundingBox::new(0.0, 0.0, 0.0, 0.0),
            dpi: None,
            valid: false,
            error: Mutex::new(None),
        };

        match provider.init(caps).await {
            Ok(()) => {
                provider.valid = true;
                info!(extent = ?provider.layer_extent, crs = %provider.settings.crs_id, "provider ready");
            }
            Err(err) => {
                warn!(error = %err, "provider is not valid");
                provider.set_error(err);
            }
        }
        provider
    }

    async fn init(&mut self, caps: Option<WmsCapabilities>) -> WmsResult<()> {
        self.settings = WmsSettings::parse_uri(&self.uri)?;
        self.add_layers()?;

        if self.client.is_none() {
            let client = ReqwestHttpClient::new(&self.config, &self.settings.auth)?;
            self.client = Some(Arc::new(client));
        }

        if self.settings.xyz {
            self.setup_xyz()?;
        } else {
            self.caps = match caps {
                Some(caps) => caps,
                None => self.retrieve_capabilities(false).await?,
            };
        }

        let crs = self.settings.crs_id.clone();
        self.set_image_crs(&crs)
    }

    fn add_layers(&mut self) -> WmsResult<()> {
        let settings = &mut self.settings;
        if settings.active_sub_layers.len() != settings.active_sub_styles.len() {
            debug!(
                layers = settings.active_sub_layers.len(),
                styles = settings.active_sub_styles.len(),
                "layer/style count mismatch"
            );
            return Err(WmsError::LayerStyleMismatch);
        }
        for layer in &settings.active_sub_layers {
            settings
                .active_sub_layer_visibility
                .insert(layer.clone(), true);
        }
        debug!(layers = ?settings.active_sub_layers, styles = ?settings.active_sub_styles, "added layers");
        Ok(())
    }

    /// Synthetic capabilities of an XYZ service: one tile layer covering the
    /// web mercator square, one matrix per zoom level.
    fn setup_xyz(&mut self) -> WmsResult<()> {
        let crs_id = self.settings.crs_id.clone();
        let dst = Crs::from_ogc(&crs_id).map_err(|e| WmsError::InvalidCrs(e.to_string()))?;
        let wgs84 = Crs::epsg(4326);
        let max_lat = std::f64::consts::PI.sinh().atan().to_degrees();

        let corner = |lon: f64, lat: f64| {
            self.transformer
                .transform_point(&wgs84, &dst, lon, lat)
                .map_err(|e| WmsError::InvalidCrs(e.to_string()))
        };
        let (x0, y0) = corner(-180.0, max_lat)?;
        let (x1, y1) = corner(180.0, -max_lat)?;
        let world = BoundingBox::from_corners(x0, y0, x1, y1);

        let mut layer = TileLayer::new(TileMode::Xyz, "xyz");
        layer.bounding_boxes.push(CrsBoundingBox {
            crs: crs_id.clone(),
            bbox: world,
        });
        layer.set_links.push(TileMatrixSetLink {
            tile_matrix_set: XYZ_TILE_MATRIX_SET.to_string(),
            limits: BTreeMap::new(),
        });

        let (zmin, zmax) = self.settings.xyz_zoom;
        let mut caps = WmsCapabilities::default();
        caps.tile_layers.push(layer);
        caps.tile_matrix_sets.insert(
            XYZ_TILE_MATRIX_SET.to_string(),
            xyz_tile_matrix_set(XYZ_TILE_MATRIX_SET, &crs_id, &world, zmin, zmax),
        );
        self.caps = caps;
        debug!(world = ?world, zmin, zmax, "xyz tile matrix set");
        Ok(())
    }

    async fn retrieve_capabilities(&self, force_refresh: bool) -> WmsResult<WmsCapabilities> {
        let client = self.client()?;
        let body = download_capabilities(
            client.as_ref(),
            &self.capabilities_cache,
            &self.settings.base_url,
            force_refresh,
            self.config.max_redirects,
        )
        .await?;
        WmsCapabilities::parse_response(&body, self.settings.parser_settings)
    }

    /// Download the capabilities again bypassing the response cache, then
    /// redo tile layer selection and the extent.
    pub async fn reload_capabilities(&mut self) -> WmsResult<()> {
        if self.settings.xyz {
            return Ok(());
        }
        let result = match self.retrieve_capabilities(true).await {
            Ok(caps) => {
                self.caps = caps;
                let crs = self.settings.crs_id.clone();
                self.set_image_crs(&crs)
            }
            Err(err) => Err(err),
        };
        self.valid = result.is_ok();
        if let Err(err) = &result {
            self.set_error(err.clone());
        }
        result
    }

    /// Switch the CRS images are requested in.
    ///
    /// Tiled sources re-select the tile layer and matrix set for the new CRS.
    /// The extent is recalculated.
    pub fn set_image_crs(&mut self, crs: &str) -> WmsResult<()> {
        if !crs.is_empty() && crs != self.settings.crs_id {
            debug!(from = %self.settings.crs_id, to = %crs, "image crs changed");
            self.settings.crs_id = crs.to_string();
        }
        if self.settings.crs_id.is_empty() {
            self.settings.crs_id = DEFAULT_LATLON_CRS.to_string();
        }

        self.tile_layer = None;
        let result = if self.settings.tiled {
            self.select_tile_layer()
        } else {
            Ok(())
        }
        .and_then(|()| self.calculate_extent());

        if let Err(err) = &result {
            self.set_error(err.clone());
        }
        result
    }

    fn select_tile_layer(&mut self) -> WmsResult<()> {
        if self.settings.active_sub_layers.len() != 1 {
            return Err(WmsError::TileLayerCount);
        }
        if self.caps.tile_layers.is_empty() {
            return Err(WmsError::TileLayerNotFound);
        }

        let wanted = &self.settings.active_sub_layers[0];
        let mut selected = None;
        for (idx, layer) in self.caps.tile_layers.iter().enumerate() {
            if &layer.identifier != wanted {
                continue;
            }

            if self.settings.tile_matrix_set_id.is_empty() && layer.set_links.len() == 1 {
                let tms = &layer.set_links[0].tile_matrix_set;
                match self.caps.tile_matrix_sets.get(tms) {
                    None => {
                        debug!("Tile matrix set '{}' not found.", tms);
                        continue;
                    }
                    Some(set) if set.crs != self.settings.crs_id => {
                        debug!(
                            "Tile matrix set '{}' has crs {} instead of {}.",
                            tms, set.crs, self.settings.crs_id
                        );
                        continue;
                    }
                    Some(_) => self.settings.tile_matrix_set_id = tms.clone(),
                }
            }

            selected = Some(idx);
            break;
        }

        let idx = selected.ok_or(WmsError::TileLayerNotFound)?;
        match self.caps.tile_matrix_sets.get(&self.settings.tile_matrix_set_id) {
            Some(set) if !set.is_empty() => {}
            _ => {
                debug!(
                    "Expected tile matrix set '{}' not found.",
                    self.settings.tile_matrix_set_id
                );
                return Err(WmsError::TileLayerNotFound);
            }
        }

        debug!(layer = idx, tms = %self.settings.tile_matrix_set_id, "tile layer selected");
        self.tile_layer = Some(idx);
        Ok(())
    }

    fn calculate_extent(&mut self) -> WmsResult<()> {
        let crs = self.settings.crs_id.as_str();

        let extent = if self.settings.tiled {
            let layer = self.tile_layer().ok_or(WmsError::TileLayerNotFound)?;
            match layer.bounding_boxes.iter().find(|b| b.crs == crs) {
                Some(b) => Some(b.bbox),
                None => Crs::from_ogc(crs).ok().and_then(|dst| {
                    layer.bounding_boxes.iter().find_map(|b| {
                        let src = Crs::from_ogc(&b.crs).ok()?;
                        self.transformer
                            .transform_bbox(&src, &dst, &b.bbox)
                            .ok()
                            .filter(BoundingBox::is_finite)
                    })
                }),
            }
        } else {
            self.settings
                .active_sub_layers
                .iter()
                .filter_map(|layer| {
                    let extent = self
                        .caps
                        .extent_for_non_tiled_layer(layer, crs, self.transformer.as_ref());
                    if extent.is_none() {
                        debug!(layer = %layer, "no extent for layer");
                    }
                    extent
                })
                .reduce(|a, b| a.combine(&b))
        };

        match extent {
            Some(extent) if !extent.is_empty() => {
                debug!(extent = ?extent, "layer extent");
                self.layer_extent = extent;
                Ok(())
            }
            _ => Err(WmsError::InvalidProvider("Cannot calculate extent".to_string())),
        }
    }

    /// Reorder the active sublayers; their styles follow.
    pub fn set_layer_order(&mut self, layers: &[String]) -> WmsResult<()> {
        if layers.len() != self.settings.active_sub_layers.len() {
            return Err(WmsError::InvalidLayerOrder(format!(
                "expected {} layers, got {}",
                self.settings.active_sub_layers.len(),
                layers.len()
            )));
        }

        let style_of: HashMap<&str, &str> = self
            .settings
            .active_sub_layers
            .iter()
            .map(String::as_str)
            .zip(self.settings.active_sub_styles.iter().map(String::as_str))
            .collect();
        let mut styles = Vec::with_capacity(layers.len());
        for layer in layers {
            match style_of.get(layer.as_str()) {
                Some(style) => styles.push(style.to_string()),
                None => {
                    return Err(WmsError::InvalidLayerOrder(format!(
                        "unknown layer {}",
                        layer
                    )))
                }
            }
        }

        self.settings.active_sub_layers = layers.to_vec();
        self.settings.active_sub_styles = styles;
        debug!(layers = ?self.settings.active_sub_layers, "layer order changed");
        Ok(())
    }

    pub fn set_sub_layer_visibility(&mut self, layer: &str, visible: bool) -> WmsResult<()> {
        match self.settings.active_sub_layer_visibility.get_mut(layer) {
            Some(v) => {
                *v = visible;
                Ok(())
            }
            None => Err(WmsError::LayerNotFound(layer.to_string())),
        }
    }

    /// Output DPI forwarded to servers through the vendor parameters.
    pub fn set_dpi(&mut self, dpi: Option<u32>) {
        self.dpi = dpi;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn settings(&self) -> &WmsSettings {
        &self.settings
    }

    pub fn wms_capabilities(&self) -> &WmsCapabilities {
        &self.caps
    }

    pub fn image_crs(&self) -> &str {
        &self.settings.crs_id
    }

    pub fn extent(&self) -> BoundingBox {
        self.layer_extent
    }

    pub fn stats(&self) -> &ProviderStats {
        &self.stats
    }

    /// Selected tile layer of a tiled source.
    pub fn tile_layer(&self) -> Option<&TileLayer> {
        self.tile_layer.and_then(|idx| self.caps.tile_layers.get(idx))
    }

    /// Tile matrix set in use by the selected tile layer.
    pub fn tile_matrix_set(&self) -> Option<&TileMatrixSet> {
        self.tile_layer?;
        self.caps
            .tile_matrix_sets
            .get(&self.settings.tile_matrix_set_id)
    }

    /// Native resolutions, finest first. Empty for non-tiled sources.
    pub fn resolutions(&self) -> Vec<f64> {
        self.tile_matrix_set()
            .map(|tms| tms.tile_matrices().iter().map(|m| m.tres).collect())
            .unwrap_or_default()
    }

    /// What this provider can do in its current state.
    pub fn capabilities(&self) -> ProviderCapabilities {
        if !self.valid {
            return ProviderCapabilities::NONE;
        }

        let can_identify = if self.settings.tiled {
            self.tile_layer().is_some_and(|layer| {
                !layer.get_feature_info_urls.is_empty() || self.has_feature_info_url()
            })
        } else {
            self.settings
                .active_sub_layers
                .iter()
                .any(|layer| self.settings.is_visible(layer) && self.caps.is_queryable(layer))
        };

        let mut capabilities = ProviderCapabilities::SIZE;
        if can_identify {
            let identify = self.caps.identify_capabilities();
            if !identify.is_empty() {
                capabilities |= identify | ProviderCapabilities::IDENTIFY;
            }
        }
        capabilities
    }

    pub fn last_error(&self) -> String {
        self.error()
            .map(|err| err.to_string())
            .unwrap_or_default()
    }

    pub fn last_error_title(&self) -> String {
        self.error()
            .map(|err| err.error_title().to_string())
            .unwrap_or_default()
    }

    pub fn last_error_format(&self) -> String {
        self.error()
            .map(|err| err.error_format().to_string())
            .unwrap_or_else(|| "text/plain".to_string())
    }

    pub fn error(&self) -> Option<WmsError> {
        self.error.lock().ok().and_then(|guard| guard.clone())
    }

    pub(crate) fn set_error(&self, err: WmsError) {
        if let Ok(mut guard) = self.error.lock() {
            *guard = Some(err);
        }
    }

    pub(crate) fn ensure_valid(&self) -> WmsResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(WmsError::InvalidProvider(self.last_error()))
        }
    }

    pub(crate) fn status(&self, message: &str) {
        debug!(status = %message, "status");
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(message.to_string());
        }
    }

    pub(crate) fn client(&self) -> WmsResult<&Arc<dyn HttpClient>> {
        self.client
            .as_ref()
            .ok_or_else(|| WmsError::InvalidProvider("no HTTP client".to_string()))
    }

    pub(crate) fn request_builder(&self) -> RequestBuilder<'_> {
        RequestBuilder::new(&self.settings, &self.caps)
    }

    pub(crate) fn has_feature_info_url(&self) -> bool {
        self.settings.ignore_get_feature_info_url
            || self.caps.request.get_feature_info.get_url().is_some()
    }

    /// Render `view` into a `width` x `height` image.
    ///
    /// Request failures leave the affected area transparent and are
    /// reported through [`WmsProvider::last_error`]. A preview feedback
    /// only composites what the tile cache already holds.
    #[instrument(skip(self, feedback), fields(uri = %self.uri))]
    pub async fn draw(
        &self,
        view: &BoundingBox,
        width: u32,
        height: u32,
        feedback: Option<&Feedback>,
    ) -> WmsResult<RgbaImage> {
        self.ensure_valid()?;

        let mut canvas = MapCanvas::new(*view, width, height);
        if width == 0 || height == 0 || view.is_empty() {
            return Ok(canvas.into_image());
        }

        if self.settings.tiled || self.settings.is_pseudo_tiled() {
            self.draw_tiles(&mut canvas, feedback).await;
        } else {
            self.draw_single(&mut canvas, feedback).await;
        }
        Ok(canvas.into_image())
    }

    async fn draw_single(&self, canvas: &mut MapCanvas, feedback: Option<&Feedback>) {
        self.status("Getting map via WMS.");
        let view = *canvas.view();
        let (width, height) = canvas.image().dimensions();
        let url = self.request_builder().get_map(&view, width, height, self.dpi);

        let Ok(client) = self.client() else { return };
        let handler = ImageDownloadHandler::new(client.clone(), self.stats.clone(), self.config.max_redirects);
        if let Err(err) = handler.download(&url, canvas, feedback).await {
            self.status(&err.to_string());
            self.set_error(err);
        }
    }

    async fn draw_tiles(&self, canvas: &mut MapCanvas, feedback: Option<&Feedback>) {
        let tile_req_no = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let view = *canvas.view();
        let (width, _) = canvas.image().dimensions();
        let vres = view.width() / width as f64;
        let tms_id = self.settings.tile_matrix_set_id.as_str();

        let pseudo;
        let (matrix, mode, limits) = if self.settings.tiled {
            let (Some(layer), Some(tms)) = (self.tile_layer(), self.tile_matrix_set()) else {
                warn!("no tile layer selected");
                return;
            };
            let Some(matrix) = tms.find_nearest_resolution(vres) else {
                return;
            };
            let limits = layer
                .set_link(tms_id)
                .and_then(|link| link.limits.get(&matrix.identifier));
            (matrix, layer.tile_mode, limits)
        } else {
            pseudo = TileMatrix::pseudo(
                &self.layer_extent,
                (self.settings.max_width, self.settings.max_height),
                vres,
            );
            (&pseudo, TileMode::Wmsc, None)
        };
        debug!(matrix = %matrix.identifier, tres = matrix.tres, vres, "tile matrix chosen");

        let range = matrix.view_extent_intersection(&view, limits);
        let needed = range.len();
        if needed > self.config.max_tiles_per_draw {
            let err = WmsError::TooManyTiles {
                needed,
                limit: self.config.max_tiles_per_draw,
            };
            warn!("{}", err);
            self.status(&err.to_string());
            return;
        }

        let tile_layer_urls = self.tile_layer().map(|layer| &layer.get_tile_urls);
        let requests = match self.request_builder().tile_requests(
            mode,
            tile_layer_urls,
            tms_id,
            matrix,
            &range.positions(),
            self.dpi,
        ) {
            Ok(requests) => requests,
            Err(err) => {
                self.status(&err.to_string());
                self.set_error(err);
                return;
            }
        };
        self.status("Getting tiles.");

        let mut cached = Vec::new();
        let mut missing_rects = Vec::new();
        let mut missing = Vec::new();
        for request in requests {
            match self.tile_cache.get(&request.url).await {
                Some(image) => {
                    self.stats.record_hit();
                    cached.push((request.rect, image));
                }
                None => {
                    self.stats.record_miss();
                    missing_rects.push(request.rect);
                    missing.push(request);
                }
            }
        }
        debug!(cached = cached.len(), missing = missing.len(), "tile cache lookup");

        let preview = feedback.is_some_and(Feedback::is_preview_only);
        let mut composition = Composition::SourceOver;
        if preview && !missing_rects.is_empty() {
            if let Some(tms) = self.tile_matrix_set() {
                self.draw_other_resolutions(canvas, mode, tms, matrix.tres, &mut missing_rects)
                    .await;
            }
            // Tiles of this resolution replace the other resolutions beneath.
            composition = Composition::Source;
        }

        for (rect, image) in &cached {
            canvas.draw_tile(rect, image, self.settings.smooth_pixmap_transform, composition);
        }

        if preview || missing.is_empty() {
            return;
        }

        if let Some(f) = feedback.filter(|f| f.render_partial_output()) {
            f.on_new_data();
        }

        sort_by_center_distance(&mut missing, &view);
        let Ok(client) = self.client() else { return };
        let ctx = TileFetchContext {
            client: client.clone(),
            cache: self.tile_cache.clone(),
            stats: self.stats.clone(),
            generation: self.generation.clone(),
            max_retry: self.config.max_retry,
            max_redirects: self.config.max_redirects,
            max_concurrent_requests: self.config.max_concurrent_requests,
            smooth: self.settings.smooth_pixmap_transform,
        };
        let summary = TiledImageDownloadHandler::new(ctx, tile_req_no)
            .download(missing, canvas, feedback)
            .await;
        debug!(
            drawn = summary.drawn,
            stale = summary.stale,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "tiled draw finished"
        );

        if let Some(err) = summary.errors.last() {
            self.status(&err.to_string());
            self.set_error(err.clone());
        }
    }

    /// Fill the missing area from cached tiles of neighbouring resolutions,
    /// coarsest first so finer tiles end up on top.
    async fn draw_other_resolutions(
        &self,
        canvas: &mut MapCanvas,
        mode: TileMode,
        tms: &TileMatrixSet,
        tres: f64,
        missing_rects: &mut Vec<BoundingBox>,
    ) {
        let builder = self.request_builder();
        let tile_layer_urls = self.tile_layer().map(|layer| &layer.get_tile_urls);
        let mut found = Vec::new();

        for offset in PREVIEW_RESOLUTION_OFFSETS {
            let Some(other) = tms.find_other_resolution(tres, offset) else {
                continue;
            };

            let positions: BTreeSet<TilePosition> = missing_rects
                .iter()
                .flat_map(|rect| other.view_extent_intersection(rect, None).positions())
                .collect();
            let positions: Vec<TilePosition> = positions.into_iter().collect();
            let Ok(requests) = builder.tile_requests(
                mode,
                tile_layer_urls,
                &tms.identifier,
                other,
                &positions,
                self.dpi,
            ) else {
                continue;
            };

            let mut hits = Vec::new();
            for request in requests {
                if let Some(image) = self.tile_cache.get(&request.url).await {
                    hits.push((request.rect, image));
                }
            }

            let covering: Vec<BoundingBox> = hits.iter().map(|(rect, _)| *rect).collect();
            let before = missing_rects.len();
            remove_covered(missing_rects, &covering);
            debug!(
                "Other resolution tiles: offset {}, res {}, missing rects {}, remaining rects {}, added tiles {}",
                offset,
                other.tres,
                before,
                missing_rects.len(),
                hits.len()
            );
            found.push((offset, hits));
        }

        found.sort_by_key(|(offset, _)| std::cmp::Reverse(*offset));
        for (_, hits) in &found {
            for (rect, image) in hits {
                canvas.draw_tile(rect, image, false, Composition::Source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::{png_bytes, MockHttpClient};
    use crate::http::HttpResponse;
    use crate::identify::{IdentifyContext, IdentifyValue};
    use wms_protocol::IdentifyFormat;

    const WMS_130: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<WMS_Capabilities version="1.3.0" xmlns="http://www.opengis.net/wms" xmlns:xlink="http://www.w3.org/1999/xlink">
  <Service><Name>WMS</Name><Title>Demo server</Title></Service>
  <Capability>
    <Request>
      <GetMap>
        <Format>image/png</Format>
        <DCPType><HTTP><Get><OnlineResource xlink:href="http://maps.example.com/getmap?"/></Get></HTTP></DCPType>
      </GetMap>
      <GetFeatureInfo>
        <Format>text/plain</Format>
        <Format>text/html</Format>
        <Format>application/vnd.ogc.gml</Format>
        <DCPType><HTTP><Get><OnlineResource xlink:href="http://maps.example.com/info?"/></Get></HTTP></DCPType>
      </GetFeatureInfo>
    </Request>
    <Layer>
      <Title>Root</Title>
      <CRS>EPSG:4326 EPSG:3857</CRS>
      <EX_GeographicBoundingBox>
        <westBoundLongitude>-10</westBoundLongitude>
        <eastBoundLongitude>20</eastBoundLongitude>
        <southBoundLatitude>35</southBoundLatitude>
        <northBoundLatitude>60</northBoundLatitude>
      </EX_GeographicBoundingBox>
      <Layer queryable="1">
        <Name>roads</Name>
        <Title>Roads</Title>
        <BoundingBox CRS="EPSG:3857" minx="-1113194" miny="4163881" maxx="2226389" maxy="8399737"/>
      </Layer>
      <Layer queryable="0">
        <Name>background</Name>
        <Title>Background</Title>
      </Layer>
    </Layer>
  </Capability>
</WMS_Capabilities>"#;

    const WMSC: &str = r#"<?xml version="1.0"?>
<WMT_MS_Capabilities version="1.1.1">
  <Capability>
    <VendorSpecificCapabilities>
      <TileSet>
        <SRS>EPSG:900913</SRS>
        <BoundingBox SRS="EPSG:900913" minx="0" miny="0" maxx="1000" maxy="500"/>
        <Resolutions>10 5 </Resolutions>
        <Width>50</Width><Height>50</Height>
        <Format>image/png</Format>
        <Layers>base</Layers>
        <Styles></Styles>
      </TileSet>
    </VendorSpecificCapabilities>
  </Capability>
</WMT_MS_Capabilities>"#;

    const WMTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Capabilities xmlns="http://www.opengis.net/wmts/1.0" xmlns:ows="http://www.opengis.net/ows/1.1" xmlns:xlink="http://www.w3.org/1999/xlink" version="1.0.0">
  <Contents>
    <Layer>
      <ows:Identifier>ortho</ows:Identifier>
      <Style isDefault="true"><ows:Identifier>normal</ows:Identifier></Style>
      <Format>image/jpeg</Format>
      <InfoFormat>text/html</InfoFormat>
      <TileMatrixSetLink><TileMatrixSet>grid</TileMatrixSet></TileMatrixSetLink>
      <ResourceURL format="image/jpeg" resourceType="tile" template="http://tiles.example.com/{Layer}/{Style}/{TileMatrixSet}/{TileMatrix}/{TileRow}/{TileCol}.jpg"/>
      <ResourceURL format="text/html" resourceType="FeatureInfo" template="http://tiles.example.com/info/{TileMatrix}/{TileRow}/{TileCol}/{J}/{I}.html"/>
    </Layer>
    <TileMatrixSet>
      <ows:Identifier>grid</ows:Identifier>
      <ows:SupportedCRS>urn:ogc:def:crs:EPSG::4326</ows:SupportedCRS>
      <TileMatrix>
        <ows:Identifier>0</ows:Identifier>
        <ScaleDenominator>279541132.0143589</ScaleDenominator>
        <TopLeftCorner>90 -180</TopLeftCorner>
        <TileWidth>256</TileWidth><TileHeight>256</TileHeight>
        <MatrixWidth>2</MatrixWidth><MatrixHeight>1</MatrixHeight>
      </TileMatrix>
      <TileMatrix>
        <ows:Identifier>1</ows:Identifier>
        <ScaleDenominator>139770566.00717944</ScaleDenominator>
        <TopLeftCorner>90 -180</TopLeftCorner>
        <TileWidth>256</TileWidth><TileHeight>256</TileHeight>
        <MatrixWidth>4</MatrixWidth><MatrixHeight>2</MatrixHeight>
      </TileMatrix>
    </TileMatrixSet>
  </Contents>
</Capabilities>"#;

    const RED: [u8; 4] = [255, 0, 0, 255];

    const WMS_URI: &str = "url=http://a.example/wms&layers=roads&layers=background\
                           &styles=&styles=&format=image/png&crs=EPSG:3857";
    const WMSC_URI: &str =
        "url=http://a.example/wmsc&layers=base&styles=&format=image/png&crs=EPSG:900913&tileMatrixSet=";
    const WMTS_URI: &str = "url=http://tiles.example.com/1.0.0/WMTSCapabilities.xml&layers=ortho\
                            &styles=normal&format=image/jpeg&crs=EPSG:4326&tileMatrixSet=grid";

    /// Serves `doc` for capabilities requests, `text` for feature info
    /// requests and a red PNG for everything else.
    fn server(doc: &'static str, text: &'static str) -> Arc<MockHttpClient> {
        Arc::new(MockHttpClient::new(move |url| {
            if url.contains("GetCapabilities") || url.ends_with("WMTSCapabilities.xml") {
                Ok(HttpResponse::ok(url, "text/xml", doc))
            } else if url.contains("GetFeatureInfo") || url.contains("/info/") {
                Ok(HttpResponse::ok(url, "text/plain", text))
            } else {
                Ok(HttpResponse::ok(url, "image/png", png_bytes(50, 50, RED)))
            }
        }))
    }

    fn context(client: Arc<MockHttpClient>) -> ProviderContext {
        ProviderContext::new(ProviderConfig::default())
            .with_client(client)
            .with_tile_cache(Arc::new(TileMemoryCache::new(16)))
            .with_capabilities_cache(Arc::new(CapabilitiesResponseCache::new(60)))
    }

    async fn provider(uri: &str, client: &Arc<MockHttpClient>) -> WmsProvider {
        WmsProvider::new(uri, context(client.clone())).await
    }

    #[tokio::test]
    async fn test_invalid_uris() {
        let client = server(WMS_130, "");

        let p = provider("layers=roads&styles=", &client).await;
        assert!(!p.is_valid());
        assert!(p.last_error().contains("url"));
        assert!(matches!(
            p.draw(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), 4, 4, None).await,
            Err(WmsError::InvalidProvider(_))
        ));

        let p = provider("url=http://a.example/wms&layers=a&layers=b&styles=", &client).await;
        assert!(!p.is_valid());
        assert_eq!(p.error(), Some(WmsError::LayerStyleMismatch));
        assert_eq!(p.capabilities(), ProviderCapabilities::NONE);
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_capabilities_http_error() {
        let client = Arc::new(MockHttpClient::new(|url| {
            Ok(HttpResponse::with_status(url, 404, "Not Found"))
        }));
        let p = provider(WMS_URI, &client).await;
        assert!(!p.is_valid());
        assert_eq!(p.last_error_title(), "Network error");
        assert!(p.last_error().contains("404"));
    }

    #[tokio::test]
    async fn test_wms_extent_and_capabilities() {
        let client = server(WMS_130, "");
        let mut p = provider(WMS_URI, &client).await;
        assert!(p.is_valid(), "{}", p.last_error());

        let extent = p.extent();
        assert!((extent.min_x + 1_113_194.0).abs() < 1.0);
        assert!((extent.max_y - 8_399_737.0).abs() < 1.0);
        assert!(p.resolutions().is_empty());

        let caps = p.capabilities();
        assert!(caps.contains(ProviderCapabilities::SIZE));
        assert!(caps.contains(ProviderCapabilities::IDENTIFY));
        assert!(caps.contains(ProviderCapabilities::IDENTIFY_TEXT));

        p.set_sub_layer_visibility("roads", false).unwrap();
        assert!(!p.capabilities().contains(ProviderCapabilities::IDENTIFY));
        assert_eq!(
            p.set_sub_layer_visibility("rivers", true),
            Err(WmsError::LayerNotFound("rivers".to_string()))
        );
    }

    #[tokio::test]
    async fn test_layer_order() {
        let client = server(WMS_130, "");
        let uri = "url=http://a.example/wms&layers=roads&layers=background\
                   &styles=thin&styles=&format=image/png&crs=EPSG:3857";
        let mut p = provider(uri, &client).await;

        p.set_layer_order(&["background".to_string(), "roads".to_string()])
            .unwrap();
        assert_eq!(p.settings().active_sub_layers, vec!["background", "roads"]);
        assert_eq!(p.settings().active_sub_styles, vec!["", "thin"]);

        assert!(matches!(
            p.set_layer_order(&["roads".to_string()]),
            Err(WmsError::InvalidLayerOrder(_))
        ));
        assert!(matches!(
            p.set_layer_order(&["roads".to_string(), "rivers".to_string()]),
            Err(WmsError::InvalidLayerOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_non_tiled_draw() {
        let client = server(WMS_130, "");
        let p = provider(WMS_URI, &client).await;

        let img = p.draw(&p.extent(), 50, 50, None).await.unwrap();
        assert_eq!(img.dimensions(), (50, 50));
        assert_eq!(img.get_pixel(25, 25).0, RED);

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with("http://maps.example.com/getmap?SERVICE=WMS"));
        assert!(requests[1].contains("REQUEST=GetMap"));
        assert!(requests[1].contains("WIDTH=50"));
    }

    #[tokio::test]
    async fn test_wmsc_draw_uses_nearest_resolution_and_cache() {
        let client = server(WMSC, "");
        let p = provider(WMSC_URI, &client).await;
        assert!(p.is_valid(), "{}", p.last_error());
        assert_eq!(p.extent(), BoundingBox::new(0.0, 0.0, 1000.0, 500.0));
        assert_eq!(p.resolutions(), vec![5.0, 10.0]);

        let view = BoundingBox::new(0.0, 0.0, 1000.0, 500.0);
        let img = p.draw(&view, 100, 50, None).await.unwrap();
        assert_eq!(img.get_pixel(0, 0).0, RED);
        assert_eq!(img.get_pixel(99, 49).0, RED);

        let tiles: Vec<String> = client.requests().into_iter().skip(1).collect();
        assert_eq!(tiles.len(), 2);
        assert!(tiles.iter().all(|u| u.contains("WIDTH=50") && u.contains("TILED=true")));
        assert!(tiles.iter().any(|u| u.ends_with("BBOX=0,0,500,500")));
        assert_eq!(p.stats().cache_misses(), 2);

        p.draw(&view, 100, 50, None).await.unwrap();
        assert_eq!(client.request_count(), 3);
        assert_eq!(p.stats().cache_hits(), 2);
    }

    #[tokio::test]
    async fn test_evicted_tiles_are_fetched_again() {
        let client = server(WMSC, "");
        let cache = Arc::new(TileMemoryCache::new(16));
        let p = WmsProvider::new(WMSC_URI, context(client.clone()).with_tile_cache(cache.clone())).await;
        let view = BoundingBox::new(0.0, 0.0, 1000.0, 500.0);

        p.draw(&view, 100, 50, None).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.clear().await;

        let img = p.draw(&view, 100, 50, None).await.unwrap();
        assert_eq!(client.request_count(), 5);
        assert_eq!(img.get_pixel(0, 0).0, RED);
        assert_eq!(img.get_pixel(99, 49).0, RED);
        assert!(p.last_error().is_empty());
        assert_eq!(p.stats().cache_misses(), 4);
    }

    #[tokio::test]
    async fn test_preview_uses_cached_coarser_tiles() {
        let client = server(WMSC, "");
        let p = provider(WMSC_URI, &client).await;
        let view = BoundingBox::new(0.0, 0.0, 1000.0, 500.0);

        p.draw(&view, 100, 50, None).await.unwrap();
        let before = client.request_count();

        // Twice the pixels selects the finer matrix, which is not cached.
        let preview = Feedback::preview();
        let img = p.draw(&view, 200, 100, Some(&preview)).await.unwrap();
        assert_eq!(client.request_count(), before);
        assert_eq!(img.get_pixel(10, 10).0, RED);
        assert_eq!(img.get_pixel(190, 90).0, RED);
    }

    #[tokio::test]
    async fn test_preview_tile_replaces_coarser_tile() {
        let client = server(WMSC, "");
        let cache = Arc::new(TileMemoryCache::new(16));
        let p = WmsProvider::new(WMSC_URI, context(client.clone()).with_tile_cache(cache.clone())).await;
        let view = BoundingBox::new(0.0, 0.0, 1000.0, 500.0);

        p.draw(&view, 100, 50, None).await.unwrap();
        let coarse = client
            .requests()
            .into_iter()
            .find(|u| u.ends_with("BBOX=0,0,500,500"))
            .unwrap();
        let fine = coarse.replace("BBOX=0,0,500,500", "BBOX=0,0,250,250");
        cache
            .insert(&fine, Arc::new(RgbaImage::from_pixel(50, 50, image::Rgba([0, 0, 0, 0]))))
            .await;
        let before = client.request_count();

        let preview = Feedback::preview();
        let img = p.draw(&view, 200, 100, Some(&preview)).await.unwrap();
        assert_eq!(client.request_count(), before);
        assert_eq!(img.get_pixel(10, 90).0, [0, 0, 0, 0]);
        assert_eq!(img.get_pixel(10, 10).0, RED);
        assert_eq!(img.get_pixel(190, 90).0, RED);
    }

    #[tokio::test]
    async fn test_preview_without_cache_is_blank() {
        let client = server(WMSC, "");
        let p = provider(WMSC_URI, &client).await;

        let preview = Feedback::preview();
        let img = p
            .draw(&BoundingBox::new(0.0, 0.0, 1000.0, 500.0), 100, 50, Some(&preview))
            .await
            .unwrap();
        assert_eq!(client.request_count(), 1);
        assert_eq!(img.get_pixel(50, 25).0, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_tile_limit() {
        let client = server(WMSC, "");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let config = ProviderConfig {
            max_tiles_per_draw: 1,
            ..ProviderConfig::default()
        };
        let ctx = ProviderContext {
            config,
            ..context(client.clone())
        }
        .with_status(tx);
        let p = WmsProvider::new(WMSC_URI, ctx).await;

        let img = p
            .draw(&BoundingBox::new(0.0, 0.0, 1000.0, 500.0), 100, 50, None)
            .await
            .unwrap();
        assert_eq!(client.request_count(), 1);
        assert_eq!(img.get_pixel(50, 25).0, [0, 0, 0, 0]);

        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        assert!(messages.contains(
            &"current view would need 2 tiles. tile request per draw limited to 1.".to_string()
        ));
    }

    #[tokio::test]
    async fn test_tiled_requires_single_layer() {
        let client = server(WMSC, "");
        let p = provider(
            "url=http://a.example/wmsc&layers=base&layers=other&styles=&styles=&crs=EPSG:900913&tileMatrixSet=",
            &client,
        )
        .await;
        assert_eq!(p.error(), Some(WmsError::TileLayerCount));

        let p = provider(
            "url=http://a.example/wmsc&layers=nope&styles=&crs=EPSG:900913&tileMatrixSet=",
            &client,
        )
        .await;
        assert_eq!(p.error(), Some(WmsError::TileLayerNotFound));
    }

    #[tokio::test]
    async fn test_xyz_source() {
        let client = server(WMS_130, "");
        let p = provider("type=xyz&url=http://t.example/{z}/{x}/{y}.png&zmax=2", &client).await;
        assert!(p.is_valid(), "{}", p.last_error());
        assert_eq!(client.request_count(), 0);
        assert_eq!(p.image_crs(), "EPSG:3857");
        assert!((p.extent().max_x - 20037508.34).abs() < 1.0);
        assert_eq!(p.resolutions().len(), 3);
        assert_eq!(p.capabilities(), ProviderCapabilities::SIZE);

        let extent = p.extent();
        p.draw(&extent, 256, 256, None).await.unwrap();
        assert_eq!(client.requests(), vec!["http://t.example/0/0/0.png".to_string()]);

        assert_eq!(
            p.identify((0.0, 0.0), IdentifyFormat::Text, None).await,
            Err(WmsError::UnsupportedFormat)
        );
    }

    #[tokio::test]
    async fn test_identify_skips_non_queryable_layers() {
        let client = server(WMS_130, "hello");
        let p = provider(WMS_URI, &client).await;

        let result = p
            .identify((0.0, 5_000_000.0), IdentifyFormat::Text, None)
            .await
            .unwrap();
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.results[&0], IdentifyValue::Text("hello".to_string()));
        assert_eq!(result.results[&1], IdentifyValue::NotQueried);

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with("http://maps.example.com/info?"));
        assert!(requests[1].contains("QUERY_LAYERS=roads"));
        assert!(requests[1].contains("WIDTH=2"));
    }

    #[tokio::test]
    async fn test_identify_edge_cases() {
        let client = server(WMS_130, "hello");
        let p = provider(WMS_URI, &client).await;

        let outside = p
            .identify((0.0, 0.0), IdentifyFormat::Html, None)
            .await
            .unwrap();
        assert_eq!(outside.results[&1], IdentifyValue::Text(String::new()));
        assert_eq!(client.request_count(), 1);

        let no_size = IdentifyContext {
            extent: p.extent(),
            width: 0,
            height: 10,
        };
        assert_eq!(
            p.identify((0.0, 5_000_000.0), IdentifyFormat::Text, Some(no_size))
                .await,
            Err(WmsError::ContextNotSpecified)
        );
        assert_eq!(
            p.identify((0.0, 5_000_000.0), IdentifyFormat::Value, None)
                .await,
            Err(WmsError::UnsupportedFormat)
        );
    }

    fn exception_server(content_type: &'static str, body: &'static str) -> Arc<MockHttpClient> {
        Arc::new(MockHttpClient::new(move |url| {
            if url.contains("GetCapabilities") {
                Ok(HttpResponse::ok(url, "text/xml", WMS_130))
            } else {
                Ok(HttpResponse::ok(url, content_type, body))
            }
        }))
    }

    #[tokio::test]
    async fn test_identify_service_exception_is_skipped() {
        const REPORT: &str = r#"<ServiceExceptionReport><ServiceException code="LayerNotQueryable">no</ServiceException></ServiceExceptionReport>"#;
        const WRAPPED: &str = "Content-Type: text/xml\r\n\r\n<ServiceExceptionReport><ServiceException code=\"LayerNotQueryable\">no</ServiceException></ServiceExceptionReport>";

        for (content_type, body) in [("text/xml", REPORT), ("ogr/gml", WRAPPED)] {
            let client = exception_server(content_type, body);
            let p = provider(WMS_URI, &client).await;
            assert!(p.is_valid(), "{}", p.last_error());

            let result = p
                .identify((0.0, 5_000_000.0), IdentifyFormat::Text, None)
                .await
                .unwrap();
            assert_eq!(client.request_count(), 2, "{content_type}");
            assert_eq!(result.results.len(), 1, "{content_type}");
            assert_eq!(result.results[&0], IdentifyValue::NotQueried);
            assert!(!result.results.contains_key(&1));
            assert_eq!(p.last_error_title(), "Service Exception");
            assert!(p.last_error().contains("not declared queryable"));
        }

        // The same report served as plain text is a text result.
        let client = exception_server("text/plain", REPORT);
        let p = provider(WMS_URI, &client).await;
        let result = p
            .identify((0.0, 5_000_000.0), IdentifyFormat::Text, None)
            .await
            .unwrap();
        assert_eq!(result.results[&0], IdentifyValue::Text(REPORT.to_string()));
        assert_eq!(result.results[&1], IdentifyValue::NotQueried);
    }

    #[tokio::test]
    async fn test_wmts_draw_and_identify() {
        let client = server(WMTS, "<p>ortho</p>");
        let p = provider(WMTS_URI, &client).await;
        assert!(p.is_valid(), "{}", p.last_error());
        assert!((p.extent().max_x - 180.0).abs() < 1e-6);
        assert!(p.capabilities().contains(ProviderCapabilities::IDENTIFY_HTML));

        let world = BoundingBox::new(-180.0, -90.0, 180.0, 90.0);
        p.draw(&world, 512, 256, None).await.unwrap();
        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.contains(&"http://tiles.example.com/ortho/normal/grid/0/0/0.jpg".to_string()));
        assert!(requests.contains(&"http://tiles.example.com/ortho/normal/grid/0/0/1.jpg".to_string()));

        let ctx = IdentifyContext {
            extent: world,
            width: 512,
            height: 256,
        };
        let result = p
            .identify((10.0, 10.0), IdentifyFormat::Html, Some(ctx))
            .await
            .unwrap();
        assert_eq!(result.results[&0], IdentifyValue::Text("<p>ortho</p>".to_string()));
        assert_eq!(
            client.requests().last().map(String::as_str),
            Some("http://tiles.example.com/info/0/0/1/113/14.html")
        );
    }

    #[tokio::test]
    async fn test_legend_graphic_through_provider() {
        let client = server(WMS_130, "");
        let p = provider(WMS_URI, &client).await;

        let legend = p.legend_graphic(1000.0, None, None).await.unwrap();
        assert_eq!(legend.dimensions(), (50, 50));
        let url = client.requests().pop().unwrap_or_default();
        assert!(url.starts_with("http://a.example/wms?"));
        assert!(url.contains("REQUEST=GetLegendGraphic"));
    }
}
