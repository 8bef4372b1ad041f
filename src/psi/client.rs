//! HTTP transport for the PageSpeed Insights v5 `runPagespeed` endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

use super::{CheckError, Strategy};
use crate::config::ApiConfig;

/// Raw access to the remote performance API.
#[async_trait::async_trait]
pub trait PageSpeedApi: Send + Sync {
    /// Run one audit and return the decoded response body.
    async fn fetch(&self, url: &str, strategy: Strategy) -> Result<Value, CheckError>;
}

/// [`PageSpeedApi`] over reqwest.
pub struct HttpPageSpeedApi {
    client: Client,
    endpoint: String,
    key: Option<String>,
    category: String,
}

impl HttpPageSpeedApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            key: config.key.clone().filter(|k| !k.is_empty()),
            category: config.category.clone(),
        })
    }
}

#[async_trait::async_trait]
impl PageSpeedApi for HttpPageSpeedApi {
    async fn fetch(&self, url: &str, strategy: Strategy) -> Result<Value, CheckError> {
        let mut query = vec![
            ("url", url),
            ("strategy", strategy.as_str()),
            ("category", self.category.as_str()),
        ];
        if let Some(key) = &self.key {
            query.push(("key", key.as_str()));
        }

        let transport = |e: reqwest::Error| {
            warn!(%url, %strategy, error = %e, "Fetch error");
            CheckError::Transport(format!(
                "Failed to fetch. Check URL or network. Details: {}",
                e
            ))
        };

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| CheckError::Parse(format!("Could not parse API response. {}", e)));
        }

        // Error bodies look like {"error": {"code": 429, "message": "..."}}
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| format!("API returned status {}", status.as_u16()));

        warn!(%url, %strategy, status = status.as_u16(), %message, "API error");
        Err(CheckError::Remote(message))
    }
}
