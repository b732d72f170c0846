//! HTTP access used by the provider.
//!
//! Every request goes through the [`HttpClient`] trait so the download
//! handlers can be driven by a scripted client in tests. Automatic
//! redirects are disabled in the reqwest client; the handlers re-issue
//! redirected requests themselves.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, redirect, Client, Url};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, instrument};
use wms_common::{WmsError, WmsResult};
use wms_protocol::settings::WmsAuthorization;

use crate::config::ProviderConfig;

/// Transport level failure of a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Operation canceled")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for WmsError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => WmsError::Timeout,
            TransportError::Aborted => WmsError::Cancelled,
            other => WmsError::Transport(other.to_string()),
        }
    }
}

/// A received HTTP response, body fully read.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// URL the response was received from.
    pub url: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// `200 OK` response with a content type.
    pub fn ok(url: &str, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    /// Bodyless response with the given status.
    pub fn with_status(url: &str, status: u16, reason: &str) -> Self {
        Self {
            url: url.to_string(),
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// `302 Found` pointing at `location`.
    pub fn redirect(url: &str, location: &str) -> Self {
        let mut response = Self::with_status(url, 302, "Found");
        response
            .headers
            .push(("Location".to_string(), location.to_string()));
        response
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content type, empty when the server sent none.
    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or("")
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Absolute redirect target of a 3xx response.
    pub fn redirect_target(&self) -> Option<String> {
        if !(300..400).contains(&self.status) {
            return None;
        }
        let location = self.header("Location")?;
        match Url::parse(&self.url).and_then(|base| base.join(location)) {
            Ok(url) => Some(url.to_string()),
            Err(_) => Some(location.to_string()),
        }
    }
}

/// Issues GET requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch `url` without following redirects.
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// Production client backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
    auth: WmsAuthorization,
}

impl ReqwestHttpClient {
    pub fn new(config: &ProviderConfig, auth: &WmsAuthorization) -> WmsResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .user_agent(config.user_agent.clone())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| WmsError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            auth: auth.clone(),
        })
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[instrument(skip(self), fields(url = %url))]
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some((user, password)) = self.auth.basic_credentials() {
            request = request.basic_auth(user, Some(password));
        }
        if !self.auth.referer.is_empty() {
            request = request.header(header::REFERER, &self.auth.referer);
        }

        let response = request.send().await.map_err(Self::classify)?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let final_url = response.url().to_string();
        let body = response.bytes().await.map_err(Self::classify)?;

        debug!(status = status.as_u16(), bytes = body.len(), "response received");

        Ok(HttpResponse {
            url: final_url,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

/// Fetch `url`, re-issuing redirects until a non-redirect response arrives.
///
/// A redirect back to an already visited URL, or more than `max_redirects`
/// hops, fails with [`WmsError::RedirectLoop`].
pub async fn get_following_redirects(
    client: &dyn HttpClient,
    url: &str,
    max_redirects: u32,
) -> WmsResult<HttpResponse> {
    let mut visited = HashSet::new();
    let mut current = url.to_string();

    loop {
        visited.insert(current.clone());
        let response = client.get(&current).await?;

        let Some(target) = response.redirect_target() else {
            return Ok(response);
        };

        debug!(from = %current, to = %target, "request redirected");
        if visited.contains(&target) || visited.len() > max_redirects as usize {
            return Err(WmsError::RedirectLoop(target));
        }
        current = target;
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted client for handler tests.

    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    type Handler = dyn Fn(&str) -> Result<HttpResponse, TransportError> + Send + Sync;

    pub(crate) struct MockHttpClient {
        handler: Box<Handler>,
        requests: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl MockHttpClient {
        pub(crate) fn new(
            handler: impl Fn(&str) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(url.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(url)
        }
    }

    /// PNG encoded image filled with one color.
    pub(crate) fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageOutputFormat::Png)
            .unwrap();
        buf.into_inner()
    }
}
