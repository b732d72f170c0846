//! Provider tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration shared by the provider's network paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Times a failed tile request is issued again.
    pub max_retry: u32,
    /// Upper bound on tiles requested by one draw.
    pub max_tiles_per_draw: usize,
    /// Whole request timeout in seconds.
    pub request_timeout: u64,
    /// Connect timeout in seconds.
    pub connect_timeout: u64,
    /// Lifetime of cached capabilities responses.
    pub capabilities_expiry_secs: u64,
    /// Size of the tile image cache in megabytes.
    pub tile_cache_mb: usize,
    pub user_agent: String,
    /// Tile requests in flight at once per draw.
    pub max_concurrent_requests: usize,
    /// Redirects followed before a request is given up.
    pub max_redirects: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            max_tiles_per_draw: 256,
            request_timeout: 60,
            connect_timeout: 20,
            capabilities_expiry_secs: 24 * 60 * 60,
            tile_cache_mb: storage::DEFAULT_CACHE_MB,
            user_agent: concat!("wms-provider/", env!("CARGO_PKG_VERSION")).to_string(),
            max_concurrent_requests: 16,
            max_redirects: 10,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn capabilities_expiry(&self) -> Duration {
        Duration::from_secs(self.capabilities_expiry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.max_tiles_per_draw, 256);
        assert_eq!(config.capabilities_expiry(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ProviderConfig =
            serde_json::from_str(r#"{"max_retry": 5, "request_timeout": 10}"#).unwrap();
        assert_eq!(config.max_retry, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_tiles_per_draw, 256);
    }
}
