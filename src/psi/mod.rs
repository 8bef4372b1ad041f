//! PageSpeed Insights metrics client.
//!
//! [`MetricsClient::check`] answers "how does this URL perform on this
//! device profile" from the result cache when it can, and from the remote
//! API otherwise. Only successful, fully normalized results are cached.

pub mod client;
pub mod parse;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::ResultCache;

pub use self::client::{HttpPageSpeedApi, PageSpeedApi};

/// Namespace tag for cache keys. Bump when the cached shape changes.
pub const CACHE_NAMESPACE: &str = "psi_v3";

/// Placeholder for any value that could not be measured.
pub const NOT_AVAILABLE: &str = "N/A";

/// Device emulation mode of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    Mobile,
    Desktop,
}

impl Strategy {
    pub const BOTH: [Strategy; 2] = [Strategy::Mobile, Strategy::Desktop];

    /// Wire token expected by the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Mobile => "MOBILE",
            Strategy::Desktop => "DESKTOP",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single (url, strategy) check produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    /// The request never got a usable response.
    #[error("{0}")]
    Transport(String),

    /// The API answered with a non-success status.
    #[error("{0}")]
    Remote(String),

    /// The response did not have the expected shape.
    #[error("{0}")]
    Parse(String),
}

/// Normalized outcome of one profile check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileResult {
    /// Performance score 0-100, `None` when the API did not report one.
    pub performance: Option<u32>,
    pub fcp: String,
    pub si: String,
    pub lcp: String,
    pub tbt: String,
    pub cls: String,
    /// Ranked opportunity list, one per line.
    pub top_issues: String,
}

impl ProfileResult {
    pub fn performance_display(&self) -> String {
        self.performance
            .map(|p| p.to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string())
    }

    /// Score followed by the five metric display values, in column order.
    pub fn metric_fields(&self) -> [String; 6] {
        [
            self.performance_display(),
            self.fcp.clone(),
            self.si.clone(),
            self.lcp.clone(),
            self.tbt.clone(),
            self.cls.clone(),
        ]
    }
}

/// Cache key for a (strategy, url) pair. The URL is used verbatim.
pub fn cache_key(strategy: Strategy, url: &str) -> String {
    format!("{}_{}_{}", CACHE_NAMESPACE, strategy.as_str(), url)
}

/// Cache-fronted access to the PageSpeed API.
#[derive(Clone)]
pub struct MetricsClient {
    api: Arc<dyn PageSpeedApi>,
    cache: Arc<dyn ResultCache>,
    ttl: Duration,
}

impl MetricsClient {
    pub fn new(api: Arc<dyn PageSpeedApi>, cache: Arc<dyn ResultCache>, ttl: Duration) -> Self {
        Self { api, cache, ttl }
    }

    /// Check one URL for one strategy.
    pub async fn check(&self, url: &str, strategy: Strategy) -> Result<ProfileResult, CheckError> {
        let key = cache_key(strategy, url);

        match self.cache.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<ProfileResult>(&raw) {
                Ok(result) => {
                    debug!(%url, %strategy, "Cache hit");
                    return Ok(result);
                }
                Err(e) => warn!(%url, %strategy, error = %e, "Discarding undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(%url, %strategy, error = %e, "Cache read failed, fetching fresh"),
        }

        let response = self.api.fetch(url, strategy).await?;
        let result = parse::normalize(&response)?;

        match serde_json::to_string(&result) {
            Ok(json) => {
                if let Err(e) = self.cache.put(&key, &json, self.ttl) {
                    warn!(%url, %strategy, error = %e, "Failed to cache result");
                }
            }
            Err(e) => warn!(%url, %strategy, error = %e, "Failed to serialize result for cache"),
        }

        Ok(result)
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) -> anyhow::Result<usize> {
        self.cache.clear()
    }
}
