//! Per provider URI request statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Request errors logged per provider before logging stops.
pub const MAX_LOGGED_ERRORS: u64 = 100;

/// Counters of one provider URI.
#[derive(Debug, Default)]
pub struct ProviderStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub errors: AtomicU64,
}

impl ProviderStats {
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request error and report whether it should be logged.
    ///
    /// Reaching the cap emits a single notice; later errors are counted
    /// silently.
    pub fn record_error(&self) -> bool {
        let count = self.errors.fetch_add(1, Ordering::Relaxed) + 1;
        if count == MAX_LOGGED_ERRORS {
            warn!("Not logging more than 100 request errors.");
        }
        count < MAX_LOGGED_ERRORS
    }

    /// Whether errors are still logged, without counting one.
    pub fn logging_errors(&self) -> bool {
        self.errors() < MAX_LOGGED_ERRORS
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Statistics records keyed by provider URI.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    stats: Mutex<HashMap<String, Arc<ProviderStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record of `uri`, created on first use.
    pub fn stat_for_uri(&self, uri: &str) -> Arc<ProviderStats> {
        match self.stats.lock() {
            Ok(mut stats) => stats.entry(uri.to_string()).or_default().clone(),
            Err(_) => Arc::new(ProviderStats::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.stats.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
