//! Remote proxy/VPN reputation providers.

pub mod json_api;
pub mod proxycheck;

use async_trait::async_trait;
use std::net::IpAddr;

/// Result of a single provider lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationResult {
    /// Which provider returned this result.
    pub provider: String,

    /// Whether the provider affirmatively reported a proxy or VPN.
    pub is_proxy: bool,

    /// Connection type reported by the provider (e.g. "VPN"), if any.
    pub kind: Option<String>,
}

impl ReputationResult {
    /// Create a "not a proxy" result.
    pub fn clean(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            is_proxy: false,
            kind: None,
        }
    }

    /// Create a "proxy" result.
    pub fn proxy(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            is_proxy: true,
            kind: None,
        }
    }

    /// Set the connection type.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Informational metadata about an IP address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Option<IpAddr>,
    pub is_proxy: bool,
    pub kind: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<String>,
    pub provider: Option<String>,
}

impl std::fmt::Display for IpInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        write!(
            f,
            "proxy: {}, type: {}, country: {}, city: {}, ASN: {}, provider: {}",
            if self.is_proxy { "yes" } else { "no" },
            field(&self.kind),
            field(&self.country),
            field(&self.city),
            field(&self.asn),
            field(&self.provider),
        )
    }
}

/// Error from a reputation provider.
#[derive(Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    Http(reqwest::Error),
    /// Timeout.
    Timeout,
    /// Rate limited.
    RateLimited,
    /// Invalid response.
    InvalidResponse(String),
    /// The provider refused the query (bad key, quota).
    Denied(String),
    /// Provider is disabled in configuration.
    Disabled,
    /// Other error.
    Other(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Http(e) => write!(f, "HTTP error: {}", e),
            ProviderError::Timeout => write!(f, "Request timed out"),
            ProviderError::RateLimited => write!(f, "Rate limited"),
            ProviderError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            ProviderError::Denied(msg) => write!(f, "Query denied: {}", msg),
            ProviderError::Disabled => write!(f, "Provider disabled"),
            ProviderError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(e)
        }
    }
}

/// Trait for proxy reputation providers.
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    /// Check whether an IP address is a proxy or VPN.
    async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError>;

    /// Fetch descriptive metadata for an IP. Providers without a metadata
    /// payload return `Ok(None)`.
    async fn ip_info(&self, _ip: &IpAddr) -> Result<Option<IpInfo>, ProviderError> {
        Ok(None)
    }

    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Whether this provider is enabled.
    fn is_enabled(&self) -> bool;
}

/// Build the shared HTTP client used by a provider.
pub(crate) fn http_client(timeout_ms: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .user_agent(concat!("hopm-proxy-checker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Other(format!("Failed to create HTTP client: {}", e)))
}
