//! Primary reputation provider: a generic JSON endpoint answering with a
//! single `proxy` field.

use super::{http_client, ProviderError, ReputationProvider, ReputationResult};
use crate::config::JsonApiConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Provider backed by `GET <api_url>?key=..&ip=..&format=json`.
pub struct JsonApiProvider {
    config: JsonApiConfig,
    client: Client,
}

impl JsonApiProvider {
    /// Create a new provider.
    pub fn new(config: JsonApiConfig) -> Result<Self, ProviderError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }

    /// Interpret a response body.
    fn interpret(&self, body: &Value) -> Result<ReputationResult, ProviderError> {
        let Some(object) = body.as_object() else {
            return Err(ProviderError::InvalidResponse(
                "expected a JSON object".to_string(),
            ));
        };

        if is_truthy(object.get("proxy")) {
            Ok(ReputationResult::proxy(self.name()))
        } else {
            Ok(ReputationResult::clean(self.name()))
        }
    }
}

/// Loose truthiness of the `proxy` field: booleans, non-zero numbers and
/// "yes"/"true"/"1" strings.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "yes" | "true" | "1")
        }
        _ => false,
    }
}

#[async_trait]
impl ReputationProvider for JsonApiProvider {
    async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError> {
        if !self.config.enabled {
            return Err(ProviderError::Disabled);
        }

        debug!(ip = %ip, "Querying primary provider");

        let ip_param = ip.to_string();
        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("ip", ip_param.as_str()),
                ("format", "json"),
            ])
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("Primary provider rate limit exceeded");
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

        debug!(ip = %ip, response = %body, "Primary provider response");

        self.interpret(&body)
    }

    fn name(&self) -> &str {
        "primary"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
