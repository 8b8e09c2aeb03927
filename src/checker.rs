//! Proxy decision orchestration.
//!
//! The decision for one IP runs in this order:
//!
//! 1. Per-IP exemptions, then the verdict cache.
//! 2. Reverse-DNS exemption patterns.
//! 3. Both remote providers, queried concurrently. The IP is a proxy iff at
//!    least one provider affirmatively says so; a failed provider counts as a
//!    negative vote.
//!
//! Backend verdicts, positive or negative, are written back to the cache.

use crate::cache::ReputationCache;
use crate::config::Config;
use crate::dns::{DnsExemption, DnsExemptionResolver, HickoryReverseResolver, ReverseResolver};
use crate::exemptions::ExemptionStore;
use crate::providers::json_api::JsonApiProvider;
use crate::providers::proxycheck::ProxyCheckProvider;
use crate::providers::{IpInfo, ProviderError, ReputationProvider, ReputationResult};
use crate::store::{blocking, Store, StoreError};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on a single backend call, on top of the HTTP client timeout.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a verdict came from. Used for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictSource {
    /// The IP carries an operator exemption.
    IpExemption,
    /// Fresh verdict served from the cache.
    Cache,
    /// Reverse DNS matched an exemption pattern.
    DnsExemption(DnsExemption),
    /// Fresh provider lookups.
    Backends {
        /// Providers that reported a proxy.
        flagged_by: Vec<String>,
        /// Providers that failed or were unavailable.
        failed: Vec<String>,
    },
}

/// Outcome of a proxy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub is_proxy: bool,
    pub source: VerdictSource,
}

/// Combines the cache, exemptions and both providers into one decision.
pub struct ProxyChecker {
    cache: ReputationCache,
    exemptions: ExemptionStore,
    dns: DnsExemptionResolver,
    primary: Option<Arc<dyn ReputationProvider>>,
    secondary: Option<Arc<dyn ReputationProvider>>,
    backend_timeout: Duration,
}

impl ProxyChecker {
    /// Assemble a checker from its parts.
    pub fn new(
        cache: ReputationCache,
        exemptions: ExemptionStore,
        resolver: Arc<dyn ReverseResolver>,
        primary: Option<Arc<dyn ReputationProvider>>,
        secondary: Option<Arc<dyn ReputationProvider>>,
    ) -> Self {
        let dns = DnsExemptionResolver::new(resolver, exemptions.clone());
        Self {
            cache,
            exemptions,
            dns,
            primary,
            secondary,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    /// Override the per-backend timeout.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Build a checker from configuration: open the database, seed DNS
    /// exemptions and create the configured providers.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = Store::open(&config.settings.database_path)?;
        let cache = ReputationCache::new(store.clone(), config.settings.cache_expiry());
        let exemptions = ExemptionStore::new(store);

        for pattern in &config.dns_exemptions {
            if exemptions.add_dns_pattern(pattern)? {
                info!(pattern = %pattern, "Seeded DNS exemption");
            }
        }

        let primary: Option<Arc<dyn ReputationProvider>> = match config.primary {
            Some(ref c) if c.enabled => {
                info!(url = %c.api_url, "Primary provider enabled");
                Some(Arc::new(JsonApiProvider::new(c.clone())?))
            }
            _ => None,
        };

        let secondary: Option<Arc<dyn ReputationProvider>> = match config.proxycheck {
            Some(ref c) if c.enabled => {
                info!(url = %c.api_url, "proxycheck.io provider enabled");
                Some(Arc::new(ProxyCheckProvider::new(c.clone())?))
            }
            _ => None,
        };

        if primary.is_none() && secondary.is_none() {
            warn!("No reputation providers configured; every uncached IP will pass");
        }

        Ok(Self::new(
            cache,
            exemptions,
            Arc::new(HickoryReverseResolver::new()),
            primary,
            secondary,
        ))
    }

    /// Decide whether `ip` is a proxy.
    pub async fn is_proxy(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        Ok(self.check(ip).await?.is_proxy)
    }

    /// Decide whether `ip` is a proxy, reporting where the answer came from.
    pub async fn check(&self, ip: &IpAddr) -> Result<Verdict, StoreError> {
        let cache = self.cache.clone();
        let addr = *ip;
        let cached = blocking(move || {
            if cache.is_exempt(&addr)? {
                return Ok(Some(Verdict {
                    is_proxy: false,
                    source: VerdictSource::IpExemption,
                }));
            }
            Ok(cache.lookup(&addr)?.map(|is_proxy| Verdict {
                is_proxy,
                source: VerdictSource::Cache,
            }))
        })
        .await?;

        if let Some(verdict) = cached {
            debug!(ip = %ip, is_proxy = verdict.is_proxy, source = ?verdict.source, "Cache hit");
            return Ok(verdict);
        }

        if let Some(exemption) = self.dns.find_exemption(ip).await? {
            debug!(
                ip = %ip,
                hostname = %exemption.hostname,
                pattern = %exemption.pattern,
                "IP is DNS exempt"
            );
            return Ok(Verdict {
                is_proxy: false,
                source: VerdictSource::DnsExemption(exemption),
            });
        }

        let (primary, secondary) = tokio::join!(
            self.query_backend(self.primary.as_deref(), "primary", ip),
            self.query_backend(self.secondary.as_deref(), "secondary", ip),
        );

        let verdict = fold_results([("primary", primary), ("secondary", secondary)]);

        let cache = self.cache.clone();
        let is_proxy = verdict.is_proxy;
        blocking(move || cache.record(&addr, is_proxy)).await?;

        debug!(ip = %ip, verdict = ?verdict, "Backend verdict recorded");
        Ok(verdict)
    }

    async fn query_backend(
        &self,
        provider: Option<&dyn ReputationProvider>,
        slot: &str,
        ip: &IpAddr,
    ) -> Result<ReputationResult, ProviderError> {
        let Some(provider) = provider else {
            debug!(slot = slot, "No provider configured");
            return Err(ProviderError::Disabled);
        };

        if !provider.is_enabled() {
            return Err(ProviderError::Disabled);
        }

        let result = match tokio::time::timeout(self.backend_timeout, provider.check(ip)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        match result {
            Ok(ref r) => debug!(
                provider = provider.name(),
                ip = %ip,
                is_proxy = r.is_proxy,
                kind = r.kind.as_deref().unwrap_or("N/A"),
                "Provider answered"
            ),
            Err(ref e) => warn!(provider = provider.name(), ip = %ip, error = %e, "Provider lookup failed"),
        }

        result
    }

    /// Exempt `ip`. Returns `false` if it was already exempt.
    pub fn exempt_ip(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        let changed = self.cache.set_exempt(ip, true)?;
        if changed {
            info!(ip = %ip, "IP exempted");
        }
        Ok(changed)
    }

    /// Clear the exemption on `ip`. No-op if it was not exempt.
    pub fn remove_exemption(&self, ip: &IpAddr) -> Result<(), StoreError> {
        if self.cache.set_exempt(ip, false)? {
            info!(ip = %ip, "IP exemption removed");
        }
        Ok(())
    }

    /// All exempted IPs.
    pub fn list_exemptions(&self) -> Result<BTreeSet<IpAddr>, StoreError> {
        self.cache.list_exempt_ips()
    }

    /// Add a DNS pattern exemption. Returns `false` if it already exists.
    pub fn add_dns_exemption(&self, pattern: &str) -> Result<bool, StoreError> {
        let added = self.exemptions.add_dns_pattern(pattern)?;
        if added {
            info!(pattern = pattern, "DNS exemption added");
        }
        Ok(added)
    }

    /// Remove a DNS pattern exemption. Returns `true` iff it existed.
    pub fn remove_dns_exemption(&self, pattern: &str) -> Result<bool, StoreError> {
        let removed = self.exemptions.remove_dns_pattern(pattern)?;
        if removed {
            info!(pattern = pattern, "DNS exemption removed");
        }
        Ok(removed)
    }

    /// DNS pattern exemptions in insertion order.
    pub fn list_dns_exemptions(&self) -> Result<Vec<String>, StoreError> {
        self.exemptions.list_dns_patterns()
    }

    /// Fetch descriptive metadata from the secondary provider.
    ///
    /// Bypasses the cache and all exemptions. Provider failures yield `None`.
    pub async fn get_ip_info(&self, ip: &IpAddr) -> Option<IpInfo> {
        let provider = self.secondary.as_deref()?;

        match tokio::time::timeout(self.backend_timeout, provider.ip_info(ip)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                warn!(provider = provider.name(), ip = %ip, error = %e, "IP info lookup failed");
                None
            }
            Err(_) => {
                warn!(provider = provider.name(), ip = %ip, "IP info lookup timed out");
                None
            }
        }
    }
}

/// OR the affirmative answers; failures are negative votes.
fn fold_results<const N: usize>(
    results: [(&str, Result<ReputationResult, ProviderError>); N],
) -> Verdict {
    let mut flagged_by = Vec::new();
    let mut failed = Vec::new();

    for (slot, result) in results {
        match result {
            Ok(r) if r.is_proxy => flagged_by.push(r.provider),
            Ok(_) => {}
            Err(_) => failed.push(slot.to_string()),
        }
    }

    Verdict {
        is_proxy: !flagged_by.is_empty(),
        source: VerdictSource::Backends { flagged_by, failed },
    }
}
