//! Concurrent tile download for one draw.
//!
//! Every missing tile is fetched by its own task. Results are composited
//! into the canvas as they arrive, cached by request URL, and dropped when a
//! newer draw has started in the meantime. Transport failures and flawed
//! images are retried immediately up to the configured bound.

use futures::stream::{FuturesUnordered, StreamExt};
use image::RgbaImage;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use storage::TileImageCache;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};
use wms_common::{BoundingBox, WmsError};
use wms_protocol::exceptions::service_exception_error;
use wms_protocol::TileRequest;

use crate::canvas::{Composition, MapCanvas};
use crate::feedback::Feedback;
use crate::http::{get_following_redirects, HttpClient, HttpResponse};
use crate::stats::ProviderStats;

/// Collaborators and limits shared by the tile tasks of a provider.
#[derive(Clone)]
pub struct TileFetchContext {
    pub client: Arc<dyn HttpClient>,
    pub cache: Arc<dyn TileImageCache>,
    pub stats: Arc<ProviderStats>,
    /// Number of the most recent draw of the provider.
    pub generation: Arc<AtomicU64>,
    pub max_retry: u32,
    pub max_redirects: u32,
    pub max_concurrent_requests: usize,
    pub smooth: bool,
}

/// What happened to the tiles of one download.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TiledDownloadSummary {
    pub drawn: usize,
    pub stale: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Errors worth surfacing to the caller, in arrival order.
    pub errors: Vec<WmsError>,
}

enum TileOutcome {
    Image(Arc<RgbaImage>),
    Stale,
    Failed(WmsError),
    Cancelled,
}

struct TileFetched {
    request: TileRequest,
    outcome: TileOutcome,
}

/// Spawned tile fetch, aborted when dropped unfinished.
struct TileTask(JoinHandle<TileFetched>);

impl Future for TileTask {
    type Output = Result<TileFetched, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl Drop for TileTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Downloads the tiles of one draw into a canvas.
pub struct TiledImageDownloadHandler {
    ctx: TileFetchContext,
    tile_req_no: u64,
}

impl TiledImageDownloadHandler {
    pub fn new(ctx: TileFetchContext, tile_req_no: u64) -> Self {
        Self { ctx, tile_req_no }
    }

    fn is_current(&self) -> bool {
        self.ctx.generation.load(Ordering::SeqCst) == self.tile_req_no
    }

    /// Fetch `requests` and composite them into `canvas`.
    ///
    /// Returns once every request finished or `feedback` was cancelled; in
    /// the latter case outstanding requests are aborted.
    #[instrument(skip_all, fields(tile_req_no = self.tile_req_no, tiles = requests.len()))]
    pub async fn download(
        &self,
        requests: Vec<TileRequest>,
        canvas: &mut MapCanvas,
        feedback: Option<&Feedback>,
    ) -> TiledDownloadSummary {
        let mut summary = TiledDownloadSummary::default();
        if feedback.is_some_and(Feedback::is_canceled) {
            summary.cancelled = true;
            return summary;
        }

        let permits = Arc::new(Semaphore::new(self.ctx.max_concurrent_requests.max(1)));
        let mut in_flight = FuturesUnordered::new();
        for request in requests {
            in_flight.push(TileTask(tokio::spawn(fetch_tile(
                self.ctx.clone(),
                permits.clone(),
                request,
                self.tile_req_no,
            ))));
        }

        let cancelled = async {
            match feedback {
                Some(f) => f.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancelled => {
                    for task in in_flight.iter() {
                        task.0.abort();
                    }
                    debug!(outstanding = in_flight.len(), "tile requests aborted");
                    summary.cancelled = true;
                    break;
                }
                next = in_flight.next() => match next {
                    None => break,
                    Some(Ok(fetched)) => self.handle_fetched(fetched, canvas, feedback, &mut summary).await,
                    Some(Err(err)) => debug!(error = %err, "tile task ended"),
                },
            }
        }

        info!(
            drawn = summary.drawn,
            stale = summary.stale,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "tile download finished"
        );
        summary
    }

    async fn handle_fetched(
        &self,
        fetched: TileFetched,
        canvas: &mut MapCanvas,
        feedback: Option<&Feedback>,
        summary: &mut TiledDownloadSummary,
    ) {
        let TileFetched { request, outcome } = fetched;
        match outcome {
            TileOutcome::Image(image) => {
                if !self.is_current() {
                    debug!(tile = request.index, "Reply too late");
                    summary.stale += 1;
                    return;
                }
                canvas.draw_tile(&request.rect, &image, self.ctx.smooth, Composition::SourceOver);
                self.ctx.cache.insert(&request.url, image).await;
                summary.drawn += 1;
                if let Some(f) = feedback {
                    f.on_new_data();
                }
            }
            TileOutcome::Stale => summary.stale += 1,
            TileOutcome::Failed(err) => {
                summary.failed += 1;
                summary.errors.push(err);
            }
            TileOutcome::Cancelled => {}
        }
    }
}

/// Error of a non-image tile response.
fn unexpected_content(response: &HttpResponse, url: &str) -> WmsError {
    let content_type = response.content_type();
    if content_type.to_ascii_lowercase().starts_with("text/xml") {
        if let Some(err) = service_exception_error(&response.body) {
            warn!(
                "Tile request error (Title:{}; Error:{}; URL: {})",
                err.error_title(),
                err,
                url
            );
            return err;
        }
    }
    warn!(
        "Tile request error (Status:{}; Content-Type:{}; Length:{}; URL: {})",
        response.status,
        content_type,
        response.body.len(),
        url
    );
    WmsError::UnexpectedContent {
        content_type: content_type.to_string(),
        url: url.to_string(),
    }
}

fn is_image_content(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("image/") || lower == "application/octet-stream"
}

async fn fetch_tile(
    ctx: TileFetchContext,
    permits: Arc<Semaphore>,
    request: TileRequest,
    tile_req_no: u64,
) -> TileFetched {
    let outcome = match permits.acquire_owned().await {
        Ok(_permit) => fetch_with_retry(&ctx, &request, tile_req_no).await,
        Err(_) => TileOutcome::Cancelled,
    };
    TileFetched { request, outcome }
}

async fn fetch_with_retry(ctx: &TileFetchContext, request: &TileRequest, tile_req_no: u64) -> TileOutcome {
    let url = request.url.as_str();
    let mut retry = 0u32;

    loop {
        let last_error = match get_following_redirects(ctx.client.as_ref(), url, ctx.max_redirects).await {
            Ok(response) => {
                if response.is_error() {
                    warn!(
                        "Tile request error (Status: {}; Reason phrase: {}; URL: {})",
                        response.status, response.reason, url
                    );
                    return TileOutcome::Failed(WmsError::HttpStatus {
                        status: response.status,
                        reason: response.reason.clone(),
                    });
                }

                if !is_image_content(response.content_type()) {
                    return TileOutcome::Failed(unexpected_content(&response, url));
                }

                if ctx.generation.load(Ordering::SeqCst) != tile_req_no {
                    debug!(tile = request.index, tile_req_no, "Reply too late");
                    return TileOutcome::Stale;
                }

                match image::load_from_memory(&response.body) {
                    Ok(decoded) => return TileOutcome::Image(Arc::new(decoded.to_rgba8())),
                    Err(err) => {
                        let flawed = WmsError::ImageDecode {
                            content_type: response.content_type().to_string(),
                            url: url.to_string(),
                        };
                        warn!(error = %err, "{}", flawed);
                        flawed
                    }
                }
            }
            Err(WmsError::Cancelled) => return TileOutcome::Cancelled,
            Err(err) if err.is_retryable() => {
                if ctx.stats.record_error() {
                    warn!(
                        "Tile request failed [error:{} url:{}]",
                        err, url
                    );
                }
                err
            }
            Err(err) => {
                warn!(error = %err, url = %url, "tile request failed");
                return TileOutcome::Failed(err);
            }
        };

        retry += 1;
        if retry > ctx.max_retry {
            if ctx.stats.logging_errors() {
                warn!(
                    "Tile request max retry error. Failed {} requests for tile {} of tileRequest {} (url: {})",
                    ctx.max_retry, request.index, tile_req_no, url
                );
            }
            return TileOutcome::Failed(last_error);
        }

        if ctx.generation.load(Ordering::SeqCst) != tile_req_no {
            return TileOutcome::Stale;
        }

        debug!("repeat tileRequest {} tile {}(retry {})", tile_req_no, request.index, retry);
    }
}

/// Order requests by Chebyshev distance of the tile center from the view
/// center, nearest first.
pub fn sort_by_center_distance(requests: &mut [TileRequest], view: &BoundingBox) {
    let (cx, cy) = view.center();
    let distance = |r: &TileRequest| {
        let (tx, ty) = r.rect.center();
        (tx - cx).abs().max((ty - cy).abs())
    };
    requests.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
}

/// Drop every rectangle of `missing` covered by one of `covering`.
pub fn remove_covered(missing: &mut Vec<BoundingBox>, covering: &[BoundingBox]) {
    missing.retain(|m| !covering.iter().any(|c| c.fuzzy_contains(m)));
}
