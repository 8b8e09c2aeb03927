//! proxycheck.io v2 provider.
//!
//! The response is keyed by the queried address:
//!
//! ```json
//! {
//!   "status": "ok",
//!   "203.0.113.9": {
//!     "asn": "AS64500",
//!     "provider": "Example Hosting",
//!     "country": "Netherlands",
//!     "city": "Amsterdam",
//!     "proxy": "yes",
//!     "type": "VPN"
//!   }
//! }
//! ```

use super::{http_client, IpInfo, ProviderError, ReputationProvider, ReputationResult};
use crate::config::ProxyCheckConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Per-IP entry of a proxycheck.io response.
#[derive(Debug, Deserialize)]
struct ProxyCheckEntry {
    #[serde(default)]
    proxy: Option<String>,

    #[serde(rename = "type", default)]
    kind: Option<String>,

    #[serde(default)]
    country: Option<String>,

    #[serde(default)]
    city: Option<String>,

    #[serde(default)]
    asn: Option<String>,

    #[serde(default)]
    provider: Option<String>,
}

impl ProxyCheckEntry {
    fn is_proxy(&self) -> bool {
        self.proxy
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("yes"))
    }
}

/// proxycheck.io reputation provider.
pub struct ProxyCheckProvider {
    config: ProxyCheckConfig,
    client: Client,
}

impl ProxyCheckProvider {
    /// Create a new proxycheck.io provider.
    pub fn new(config: ProxyCheckConfig) -> Result<Self, ProviderError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }

    async fn query(&self, ip: &IpAddr) -> Result<ProxyCheckEntry, ProviderError> {
        if !self.config.enabled {
            return Err(ProviderError::Disabled);
        }

        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), ip);

        debug!(ip = %ip, "Querying proxycheck.io");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("vpn", "1"),
                ("asn", "1"),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("proxycheck.io rate limit exceeded");
            return Err(ProviderError::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        debug!(ip = %ip, response = %body, "proxycheck.io response");

        parse_entry(ip, body)
    }
}

/// Extract the entry for `ip` from a response body.
fn parse_entry(ip: &IpAddr, mut body: Value) -> Result<ProxyCheckEntry, ProviderError> {
    match body.get("status").and_then(Value::as_str) {
        Some("error") | Some("denied") => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string();
            return Err(ProviderError::Denied(message));
        }
        _ => {}
    }

    let entry = body
        .get_mut(ip.to_string())
        .map(Value::take)
        .ok_or_else(|| {
            ProviderError::InvalidResponse(format!("response has no entry for {}", ip))
        })?;

    serde_json::from_value(entry)
        .map_err(|e| ProviderError::InvalidResponse(format!("Malformed entry for {}: {}", ip, e)))
}

#[async_trait]
impl ReputationProvider for ProxyCheckProvider {
    async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError> {
        let entry = self.query(ip).await?;

        let mut result = if entry.is_proxy() {
            ReputationResult::proxy(self.name())
        } else {
            ReputationResult::clean(self.name())
        };
        if let Some(kind) = entry.kind {
            result = result.with_kind(kind);
        }

        Ok(result)
    }

    async fn ip_info(&self, ip: &IpAddr) -> Result<Option<IpInfo>, ProviderError> {
        let entry = self.query(ip).await?;

        Ok(Some(IpInfo {
            ip: Some(*ip),
            is_proxy: entry.is_proxy(),
            kind: entry.kind,
            country: entry.country,
            city: entry.city,
            asn: entry.asn,
            provider: entry.provider,
        }))
    }

    fn name(&self) -> &str {
        "proxycheck"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
