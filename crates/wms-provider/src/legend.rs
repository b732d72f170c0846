//! GetLegendGraphic download.

use image::RgbaImage;
use tracing::{debug, instrument, warn};
use wms_common::{WmsError, WmsResult};
use wms_protocol::{service_exception_error, LegendContext};

use crate::http::{get_following_redirects, HttpClient};
use crate::provider::WmsProvider;

/// Download and decode the legend image at `url`.
#[instrument(skip(client), fields(url = %url))]
pub async fn fetch_legend_graphic(
    client: &dyn HttpClient,
    url: &str,
    max_redirects: u32,
) -> WmsResult<RgbaImage> {
    let response = get_following_redirects(client, url, max_redirects).await?;

    if response.is_error() {
        return Err(WmsError::HttpStatus {
            status: response.status,
            reason: response.reason,
        });
    }

    if let Some(err) = service_exception_error(&response.body) {
        warn!(
            "GetLegendGraphic request error (Title:{}; Error:{}; URL: {})",
            err.error_title(),
            err,
            response.url
        );
        return Err(err);
    }

    match image::load_from_memory(&response.body) {
        Ok(img) => {
            debug!(width = img.width(), height = img.height(), "legend decoded");
            Ok(img.to_rgba8())
        }
        Err(err) => {
            debug!(error = %err, "legend not decodable");
            Err(WmsError::ImageDecode {
                content_type: response.content_type().to_string(),
                url: response.url,
            })
        }
    }
}

impl WmsProvider {
    /// Legend image of the first active sublayer at map `scale`.
    ///
    /// `context` is only sent when contextual legends are enabled.
    pub async fn legend_graphic(
        &self,
        scale: f64,
        legend_dpi: Option<u32>,
        context: Option<&LegendContext>,
    ) -> WmsResult<RgbaImage> {
        self.ensure_valid()?;
        let url = self
            .request_builder()
            .get_legend_graphic(scale, legend_dpi, context);
        let client = self.client()?;

        fetch_legend_graphic(client.as_ref(), &url, self.config.max_redirects)
            .await
            .map_err(|err| {
                self.set_error(err.clone());
                err
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::{png_bytes, MockHttpClient};
    use crate::http::HttpResponse;

    #[tokio::test]
    async fn test_legend_decoded() {
        let client = MockHttpClient::new(|url| {
            Ok(HttpResponse::ok(url, "image/png", png_bytes(20, 10, [9, 9, 9, 255])))
        });
        let img = fetch_legend_graphic(&client, "http://a.example/legend.png", 5)
            .await
            .unwrap();
        assert_eq!(img.dimensions(), (20, 10));
    }

    #[tokio::test]
    async fn test_legend_errors() {
        let client = MockHttpClient::new(|url| {
            Ok(HttpResponse::ok(
                url,
                "application/vnd.ogc.se_xml",
                r#"<ServiceExceptionReport><ServiceException code="StyleNotDefined">bad</ServiceException></ServiceExceptionReport>"#,
            ))
        });
        let err = fetch_legend_graphic(&client, "http://a.example/legend", 5)
            .await
            .unwrap_err();
        assert_eq!(err.error_title(), "Service Exception");

        let client = MockHttpClient::new(|url| Ok(HttpResponse::with_status(url, 500, "Server Error")));
        let err = fetch_legend_graphic(&client, "http://a.example/legend", 5)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP status 500: Server Error");
    }
}
