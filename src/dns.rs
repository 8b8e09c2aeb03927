//! Reverse-DNS exemption checks.

use crate::exemptions::ExemptionStore;
use crate::store::{blocking, StoreError};
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for a single PTR query.
const REVERSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves an IP address to a hostname.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// Return the PTR hostname for `ip` (without trailing dot), or `None` if
    /// there is none or the lookup failed.
    async fn reverse(&self, ip: &IpAddr) -> Option<String>;
}

/// System resolver backed by hickory.
pub struct HickoryReverseResolver {
    resolver: TokioResolver,
}

impl HickoryReverseResolver {
    /// Build a resolver from the system configuration, falling back to the
    /// default upstreams when it cannot be read.
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read system DNS config, using defaults");
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });

        Self { resolver }
    }
}

impl Default for HickoryReverseResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReverseResolver for HickoryReverseResolver {
    async fn reverse(&self, ip: &IpAddr) -> Option<String> {
        match tokio::time::timeout(REVERSE_TIMEOUT, self.resolver.reverse_lookup(*ip)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .map(|ptr| ptr.to_string().trim_end_matches('.').to_string()),
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "Reverse lookup failed");
                None
            }
            Err(_) => {
                warn!(ip = %ip, "Reverse lookup timed out");
                None
            }
        }
    }
}

/// A reverse-DNS exemption hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsExemption {
    pub hostname: String,
    pub pattern: String,
}

/// Matches reverse-DNS hostnames against stored exemption patterns.
#[derive(Clone)]
pub struct DnsExemptionResolver {
    resolver: Arc<dyn ReverseResolver>,
    exemptions: ExemptionStore,
}

impl DnsExemptionResolver {
    pub fn new(resolver: Arc<dyn ReverseResolver>, exemptions: ExemptionStore) -> Self {
        Self {
            resolver,
            exemptions,
        }
    }

    /// Find the exemption covering `ip`, if any.
    ///
    /// Lookup failures count as "not exempt". The PTR query is skipped when
    /// no patterns are stored.
    pub async fn find_exemption(&self, ip: &IpAddr) -> Result<Option<DnsExemption>, StoreError> {
        let exemptions = self.exemptions.clone();
        if blocking(move || exemptions.list_dns_patterns()).await?.is_empty() {
            return Ok(None);
        }

        let Some(hostname) = self.resolver.reverse(ip).await else {
            return Ok(None);
        };

        let exemptions = self.exemptions.clone();
        let host = hostname.clone();
        let exemption = blocking(move || exemptions.find_match(&host))
            .await?
            .map(|pattern| DnsExemption { hostname, pattern });

        Ok(exemption)
    }

    /// Whether `ip` resolves to a hostname matching a stored pattern.
    pub async fn is_dns_exempt(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        Ok(self.find_exemption(ip).await?.is_some())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::Store;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolver answering from a fixed table.
    #[derive(Default)]
    pub(crate) struct StaticResolver {
        pub(crate) names: HashMap<IpAddr, String>,
        pub(crate) lookups: AtomicUsize,
    }

    impl StaticResolver {
        pub(crate) fn with(ip: &str, hostname: &str) -> Self {
            let mut names = HashMap::new();
            names.insert(ip.parse().unwrap(), hostname.to_string());
            Self {
                names,
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReverseResolver for StaticResolver {
        async fn reverse(&self, ip: &IpAddr) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.names.get(ip).cloned()
        }
    }

    fn setup(resolver: StaticResolver) -> (DnsExemptionResolver, ExemptionStore, Arc<StaticResolver>) {
        let exemptions = ExemptionStore::new(Store::open_in_memory().unwrap());
        let resolver = Arc::new(resolver);
        let dns = DnsExemptionResolver::new(resolver.clone(), exemptions.clone());
        (dns, exemptions, resolver)
    }

    #[tokio::test]
    async fn test_matching_hostname_is_exempt() {
        let (dns, exemptions, _) = setup(StaticResolver::with("203.0.113.4", "host.example.com"));
        exemptions.add_dns_pattern("*.example.com").unwrap();

        let hit = dns
            .find_exemption(&"203.0.113.4".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.hostname, "host.example.com");
        assert_eq!(hit.pattern, "*.example.com");
    }

    #[tokio::test]
    async fn test_non_matching_hostname() {
        let (dns, exemptions, _) = setup(StaticResolver::with("203.0.113.4", "host.other.org"));
        exemptions.add_dns_pattern("*.example.com").unwrap();

        assert!(!dns.is_dns_exempt(&"203.0.113.4".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_exempt() {
        let (dns, exemptions, _) = setup(StaticResolver::default());
        exemptions.add_dns_pattern("*").unwrap();

        assert!(!dns.is_dns_exempt(&"203.0.113.4".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_patterns_skips_lookup() {
        let (dns, _, resolver) = setup(StaticResolver::with("203.0.113.4", "host.example.com"));

        assert!(!dns.is_dns_exempt(&"203.0.113.4".parse().unwrap()).await.unwrap());
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
    }
}
