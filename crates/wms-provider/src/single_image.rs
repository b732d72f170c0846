//! Single GetMap request for non-tiled draws.

use std::sync::Arc;
use tracing::{debug, instrument, warn};
use wms_common::{WmsError, WmsResult};
use wms_protocol::exceptions::service_exception_error;

use crate::canvas::MapCanvas;
use crate::feedback::Feedback;
use crate::http::{get_following_redirects, HttpClient};
use crate::stats::ProviderStats;

pub struct ImageDownloadHandler {
    client: Arc<dyn HttpClient>,
    stats: Arc<ProviderStats>,
    max_redirects: u32,
}

impl ImageDownloadHandler {
    pub fn new(client: Arc<dyn HttpClient>, stats: Arc<ProviderStats>, max_redirects: u32) -> Self {
        Self {
            client,
            stats,
            max_redirects,
        }
    }

    /// Fetch `url` and draw the returned image at the canvas origin.
    ///
    /// Cancellation drops the request and is not an error.
    #[instrument(skip(self, canvas, feedback), fields(url = %url))]
    pub async fn download(
        &self,
        url: &str,
        canvas: &mut MapCanvas,
        feedback: Option<&Feedback>,
    ) -> WmsResult<()> {
        let fetch = get_following_redirects(self.client.as_ref(), url, self.max_redirects);

        let result = match feedback {
            Some(f) => {
                if f.is_canceled() {
                    return Ok(());
                }
                tokio::select! {
                    biased;
                    _ = f.cancelled() => {
                        debug!("map request cancelled");
                        return Ok(());
                    }
                    r = fetch => r,
                }
            }
            None => fetch.await,
        };

        let response = match result {
            Ok(response) => response,
            Err(WmsError::Cancelled) => return Ok(()),
            Err(err @ WmsError::RedirectLoop(_)) => {
                warn!(error = %err, "map request failed");
                return Err(err);
            }
            Err(err) => {
                if self.stats.record_error() {
                    warn!("Map request failed [error:{} url:{}]", err, url);
                }
                return Err(err);
            }
        };

        if response.is_error() {
            warn!(
                "Map request error (Status: {}; Reason phrase: {}; URL:{})",
                response.status, response.reason, response.url
            );
            return Err(WmsError::HttpStatus {
                status: response.status,
                reason: response.reason,
            });
        }

        let content_type = response.content_type().to_string();
        if let Ok(decoded) = image::load_from_memory(&response.body) {
            canvas.draw_image(&decoded.to_rgba8());
            return Ok(());
        }

        let lower = content_type.to_ascii_lowercase();
        if lower.starts_with("image/") || lower == "application/octet-stream" {
            let err = WmsError::ImageDecode {
                content_type,
                url: response.url,
            };
            warn!("{}", err);
            return Err(err);
        }

        if lower == "text/xml" {
            if let Some(err) = service_exception_error(&response.body) {
                warn!(
                    "Map request error (Title:{}; Error:{}; URL: {})",
                    err.error_title(),
                    err,
                    response.url
                );
                return Err(err);
            }
        }

        warn!(
            "Map request error (Status: {}; Response: {}; Content-Type: {}; URL:{})",
            response.status,
            String::from_utf8_lossy(&response.body),
            content_type,
            response.url
        );
        Err(WmsError::UnexpectedContent {
            content_type,
            url: response.url,
        })
    }
}
