//! Configuration types for the proxy checker.

use crate::exemptions::DnsPattern;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted cache freshness window (ten years).
pub const MAX_CACHE_EXPIRY_SECONDS: u64 = 10 * 365 * 86_400;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Primary provider (generic JSON endpoint).
    #[serde(default)]
    pub primary: Option<JsonApiConfig>,

    /// Secondary provider (proxycheck.io).
    #[serde(default)]
    pub proxycheck: Option<ProxyCheckConfig>,

    /// Source identities allowed to issue admin commands.
    #[serde(default)]
    pub admins: Vec<String>,

    /// DNS patterns seeded into the exemption store at startup.
    #[serde(default)]
    pub dns_exemptions: Vec<String>,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// SQLite database holding the verdict cache and exemptions.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long a cached verdict is trusted.
    #[serde(default = "default_cache_expiry")]
    pub cache_expiry_seconds: u64,

    /// Channel that receives scan and command replies.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Announce clean scans in the channel.
    #[serde(default = "default_true")]
    pub announce_clean: bool,

    /// Duration token passed with each ban.
    #[serde(default = "default_ban_duration")]
    pub ban_duration: String,

    /// Reason attached to each ban.
    #[serde(default = "default_ban_reason")]
    pub ban_reason: String,

    /// Maximum number of events handled concurrently.
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            cache_expiry_seconds: default_cache_expiry(),
            channel: default_channel(),
            announce_clean: true,
            ban_duration: default_ban_duration(),
            ban_reason: default_ban_reason(),
            max_concurrent_events: default_max_concurrent_events(),
        }
    }
}

impl Settings {
    /// Cache freshness window.
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_seconds)
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("proxy_cache.db")
}

fn default_cache_expiry() -> u64 {
    86_400
}

fn default_channel() -> String {
    "#hopm".to_string()
}

fn default_ban_duration() -> String {
    "1d".to_string()
}

fn default_ban_reason() -> String {
    "Proxy detected, Z-lined by HOPM.".to_string()
}

fn default_max_concurrent_events() -> usize {
    16
}

/// Primary provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonApiConfig {
    /// Enable lookups against this provider.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Query endpoint. Receives `key`, `ip` and `format=json` parameters.
    pub api_url: String,

    /// API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

/// proxycheck.io provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyCheckConfig {
    /// Enable lookups against this provider.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API base URL; the IP is appended as a path segment.
    #[serde(default = "default_proxycheck_url")]
    pub api_url: String,

    /// API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_proxycheck_url() -> String {
    "https://proxycheck.io/v2".to_string()
}

fn default_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.settings.cache_expiry_seconds == 0 {
            anyhow::bail!("cache_expiry_seconds must be greater than 0");
        }

        if self.settings.cache_expiry_seconds > MAX_CACHE_EXPIRY_SECONDS {
            anyhow::bail!(
                "cache_expiry_seconds must be at most {}",
                MAX_CACHE_EXPIRY_SECONDS
            );
        }

        if self.settings.max_concurrent_events == 0 {
            anyhow::bail!("max_concurrent_events must be greater than 0");
        }

        if self.settings.ban_duration.trim().is_empty() {
            anyhow::bail!("ban_duration must not be empty");
        }

        if let Some(ref primary) = self.primary {
            if primary.enabled {
                validate_endpoint("primary", &primary.api_url, &primary.api_key)?;
            }
        }

        if let Some(ref proxycheck) = self.proxycheck {
            if proxycheck.enabled {
                validate_endpoint("proxycheck", &proxycheck.api_url, &proxycheck.api_key)?;
            }
        }

        for pattern in &self.dns_exemptions {
            if pattern.trim().is_empty() {
                anyhow::bail!("DNS exemption patterns must not be empty");
            }
            if let Err(e) = DnsPattern::new(pattern) {
                anyhow::bail!("Invalid DNS exemption pattern '{}': {}", pattern, e);
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r##"# HOPM proxy checker configuration

settings:
  database_path: "proxy_cache.db"
  cache_expiry_seconds: 86400    # Trust cached verdicts for one day
  channel: "#hopm"
  announce_clean: true           # Report clean scans in the channel
  ban_duration: "1d"
  ban_reason: "Proxy detected, Z-lined by HOPM."
  max_concurrent_events: 16

# Primary provider: GET <api_url>?key=<api_key>&ip=<ip>&format=json
# Expects a JSON object with a boolean "proxy" field.
primary:
  enabled: true
  api_url: "https://proxy-api.example.net/check"
  api_key: "${PROXY_API_KEY}"
  timeout_ms: 5000

# Secondary provider: proxycheck.io v2
proxycheck:
  enabled: true
  api_url: "https://proxycheck.io/v2"
  api_key: "${PROXYCHECK_API_KEY}"
  timeout_ms: 5000

# Sources (nick!user@host) allowed to issue !hopm and >info commands
admins:
  - "oper!oper@staff.example.net"

# DNS patterns exempted from checks; added to the database at startup
dns_exemptions:
  - "*.staff.example.net"
"##
        .to_string()
    }
}

fn validate_endpoint(name: &str, url: &str, api_key: &str) -> anyhow::Result<()> {
    if api_key.is_empty() {
        anyhow::bail!("{} provider is enabled but api_key is empty", name);
    }
    if let Err(e) = reqwest::Url::parse(url) {
        anyhow::bail!("{} provider api_url '{}' is invalid: {}", name, url, e);
    }
    Ok(())
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    static ENV_VAR: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());

    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
