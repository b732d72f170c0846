//! Client configuration.
//!
//! Loaded from an optional YAML file, then overridden by command line flags
//! (which fall back to environment variables).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};
use wms_provider::ProviderConfig;

/// Root of the YAML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub provider: ProviderConfig,
    /// Write the provider statistics after each command.
    pub print_stats: bool,
}

/// Flags overriding single values of the configuration file.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Times a failed tile request is issued again
    #[arg(long, env = "WMS_MAX_RETRY")]
    pub max_retry: Option<u32>,

    /// Whole request timeout in seconds
    #[arg(long, env = "WMS_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Upper bound on tiles requested by one draw
    #[arg(long, env = "WMS_MAX_TILES")]
    pub max_tiles_per_draw: Option<usize>,

    /// Tile cache size in megabytes
    #[arg(long, env = "WMS_TILE_CACHE_MB")]
    pub tile_cache_mb: Option<usize>,

    /// User-Agent header sent to servers
    #[arg(long, env = "WMS_USER_AGENT")]
    pub user_agent: Option<String>,
}

impl ClientConfig {
    /// Load the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ClientConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded client configuration");
        Ok(config)
    }

    /// Configuration from `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                debug!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let provider = &mut self.provider;
        if let Some(v) = overrides.max_retry {
            provider.max_retry = v;
        }
        if let Some(v) = overrides.request_timeout {
            provider.request_timeout = v;
        }
        if let Some(v) = overrides.max_tiles_per_draw {
            provider.max_tiles_per_draw = v;
        }
        if let Some(v) = overrides.tile_cache_mb {
            provider.tile_cache_mb = v;
        }
        if let Some(v) = &overrides.user_agent {
            provider.user_agent = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "provider:\n  max_retry: 7\n  max_tiles_per_draw: 64\nprint_stats: true"
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.provider.max_retry, 7);
        assert_eq!(config.provider.max_tiles_per_draw, 64);
        assert_eq!(config.provider.request_timeout, ProviderConfig::default().request_timeout);
        assert!(config.print_stats);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "provider: [1, 2").unwrap();
        let err = ClientConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));

        assert_eq!(ClientConfig::load_or_default(None).unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_overrides() {
        let mut config = ClientConfig::default();
        config.apply_overrides(&ConfigOverrides {
            max_retry: Some(0),
            user_agent: Some("probe/1".to_string()),
            ..Default::default()
        });
        assert_eq!(config.provider.max_retry, 0);
        assert_eq!(config.provider.user_agent, "probe/1");
        assert_eq!(config.provider.max_tiles_per_draw, 256);
    }
}
