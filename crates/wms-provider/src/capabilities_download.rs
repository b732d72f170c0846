//! GetCapabilities download with a TTL response cache.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use wms_common::{WmsError, WmsResult};

use crate::http::{get_following_redirects, HttpClient};

/// Capabilities response lifetime when the caller does not configure one.
pub const DEFAULT_CAPABILITIES_EXPIRY_SECS: u64 = 24 * 60 * 60;

struct CachedResponse {
    body: Bytes,
    fetched_at: Instant,
}

/// Capabilities response bodies by request URL.
pub struct CapabilitiesResponseCache {
    responses: RwLock<HashMap<String, CachedResponse>>,
    ttl: Duration,
}

impl CapabilitiesResponseCache {
    pub fn new(ttl_secs: u64) -> Self {
        info!(ttl_secs = ttl_secs, "Initializing capabilities response cache");
        Self {
            responses: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Process-wide cache shared by providers that are not given one.
    pub fn shared() -> Arc<CapabilitiesResponseCache> {
        static SHARED: OnceLock<Arc<CapabilitiesResponseCache>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(CapabilitiesResponseCache::new(DEFAULT_CAPABILITIES_EXPIRY_SECS)))
            .clone()
    }

    /// Cached body of `url` if still valid.
    pub async fn get(&self, url: &str) -> Option<Bytes> {
        let guard = self.responses.read().await;
        if let Some(cached) = guard.get(url) {
            if cached.fetched_at.elapsed() < self.ttl {
                debug!(url = %url, "capabilities cache hit");
                return Some(cached.body.clone());
            }
            debug!(url = %url, "capabilities cache expired");
        }
        None
    }

    pub async fn insert(&self, url: &str, body: Bytes) {
        let mut guard = self.responses.write().await;
        guard.insert(
            url.to_string(),
            CachedResponse {
                body,
                fetched_at: Instant::now(),
            },
        );
        debug!(url = %url, "capabilities cached");
    }

    pub async fn invalidate(&self) {
        self.responses.write().await.clear();
        debug!("Capabilities cache invalidated");
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }
}

/// GetCapabilities URL for a prepared base URL.
///
/// WMTS capabilities URLs are used unchanged.
pub fn capabilities_url(base_url: &str) -> String {
    let lower = base_url.to_ascii_lowercase();
    if lower.contains("service=wmts") || lower.contains("/wmtscapabilities.xml") {
        return base_url.to_string();
    }
    format!("{}SERVICE=WMS&REQUEST=GetCapabilities", base_url)
}

fn download_failed(reason: impl std::fmt::Display) -> WmsError {
    WmsError::capabilities(
        "Network error",
        format!("Download of capabilities failed: {}", reason),
    )
}

/// Fetch the capabilities document of `base_url`.
///
/// A cached response is used unless `force_refresh` is set.
#[instrument(skip(client, cache), fields(url = %base_url))]
pub async fn download_capabilities(
    client: &dyn HttpClient,
    cache: &CapabilitiesResponseCache,
    base_url: &str,
    force_refresh: bool,
    max_redirects: u32,
) -> WmsResult<Bytes> {
    let url = capabilities_url(base_url);

    if !force_refresh {
        if let Some(body) = cache.get(&url).await {
            return Ok(body);
        }
    }

    let response = match get_following_redirects(client, &url, max_redirects).await {
        Ok(response) => response,
        Err(err @ WmsError::RedirectLoop(_)) => {
            warn!(error = %err, "capabilities download failed");
            return Err(err);
        }
        Err(err) => {
            let err = download_failed(err);
            warn!(error = %err, "capabilities download failed");
            return Err(err);
        }
    };

    if response.is_error() {
        let err = download_failed(format!(
            "HTTP status {}: {}",
            response.status, response.reason
        ));
        warn!(error = %err, "capabilities download failed");
        return Err(err);
    }

    if response.body.is_empty() {
        return Err(WmsError::capabilities(
            "Network error",
            "empty of capabilities: no data received",
        ));
    }

    info!(bytes = response.body.len(), "capabilities downloaded");
    cache.insert(&url, response.body.clone()).await;
    Ok(response.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::MockHttpClient;
    use crate::http::{HttpResponse, TransportError};

    #[test]
    fn test_capabilities_url() {
        assert_eq!(
            capabilities_url("http://example.com/wms?"),
            "http://example.com/wms?SERVICE=WMS&REQUEST=GetCapabilities"
        );
        assert_eq!(
            capabilities_url("http://example.com/1.0.0/WMTSCapabilities.xml"),
            "http://example.com/1.0.0/WMTSCapabilities.xml"
        );
        assert_eq!(
            capabilities_url("http://example.com/wmts?service=WMTS&request=GetCapabilities"),
            "http://example.com/wmts?service=WMTS&request=GetCapabilities"
        );
    }

    #[tokio::test]
    async fn test_download_uses_cache() {
        let client = MockHttpClient::new(|url| Ok(HttpResponse::ok(url, "text/xml", "<WMS_Capabilities/>")));
        let cache = CapabilitiesResponseCache::new(60);

        let first = download_capabilities(&client, &cache, "http://example.com/wms?", false, 5)
            .await
            .unwrap();
        let second = download_capabilities(&client, &cache, "http://example.com/wms?", false, 5)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(client.request_count(), 1);

        download_capabilities(&client, &cache, "http://example.com/wms?", true, 5)
            .await
            .unwrap();
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cache = CapabilitiesResponseCache::new(0);
        cache.insert("u", Bytes::from_static(b"x")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("u").await.is_none());

        let cache = CapabilitiesResponseCache::new(60);
        cache.insert("u", Bytes::from_static(b"x")).await;
        cache.invalidate().await;
        assert!(cache.get("u").await.is_none());
    }

    #[tokio::test]
    async fn test_download_errors() {
        let cache = CapabilitiesResponseCache::new(60);

        let failing = MockHttpClient::new(|_| Err(TransportError::Connect("refused".into())));
        let err = download_capabilities(&failing, &cache, "http://a.example/wms?", false, 5)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Download of capabilities failed: Connection failed: refused"
        );

        let missing = MockHttpClient::new(|url| Ok(HttpResponse::with_status(url, 404, "Not Found")));
        let err = download_capabilities(&missing, &cache, "http://b.example/wms?", false, 5)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Download of capabilities failed: HTTP status 404: Not Found"
        );

        let looping = MockHttpClient::new(|url| Ok(HttpResponse::redirect(url, url)));
        let err = download_capabilities(&looping, &cache, "http://c.example/wms?", false, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, WmsError::RedirectLoop(_)));

        let empty = MockHttpClient::new(|url| Ok(HttpResponse::ok(url, "text/xml", "")));
        assert!(download_capabilities(&empty, &cache, "http://d.example/wms?", false, 5)
            .await
            .is_err());
    }
}
