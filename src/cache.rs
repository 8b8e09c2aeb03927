//! Durable verdict cache with per-IP exemption flags.

use crate::store::{Store, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Default freshness window for cached verdicts (one day).
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// One persisted row of the cache table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub ip: IpAddr,
    /// Last known verdict. `None` for rows created only by an exemption.
    pub is_proxy: Option<bool>,
    /// Forces a "not a proxy" verdict regardless of age or `is_proxy`.
    pub exempted: bool,
    pub recorded_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the verdict is still inside the freshness window at `now`.
    pub fn is_fresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.recorded_at);
        age.num_seconds() < i64::try_from(window.as_secs()).unwrap_or(i64::MAX)
    }
}

/// Write-through SQLite cache of proxy verdicts.
///
/// Every operation hits the database before returning; there is no in-memory
/// layer, so state survives a restart.
#[derive(Clone)]
pub struct ReputationCache {
    store: Store,
    expiry: Duration,
}

impl ReputationCache {
    /// Create a cache over `store` with the given freshness window.
    pub fn new(store: Store, expiry: Duration) -> Self {
        Self { store, expiry }
    }

    /// The configured freshness window.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Return the cached verdict for `ip`, if usable.
    ///
    /// Exempted entries always yield `Some(false)`. A stale, non-exempt entry
    /// is deleted and reported as absent.
    pub fn lookup(&self, ip: &IpAddr) -> Result<Option<bool>, StoreError> {
        let now = Utc::now();
        let expiry = self.expiry;

        self.store.with_conn(|conn| {
            let Some(entry) = select_entry(conn, ip)? else {
                return Ok(None);
            };

            if entry.exempted {
                return Ok(Some(false));
            }

            match entry.is_proxy {
                Some(is_proxy) if entry.is_fresh(expiry, now) => Ok(Some(is_proxy)),
                _ => {
                    conn.execute("DELETE FROM cache WHERE ip = ?1", params![ip.to_string()])?;
                    debug!(ip = %entry.ip, recorded_at = %entry.recorded_at, "Purged stale cache entry");
                    Ok(None)
                }
            }
        })
    }

    /// Fetch the raw entry for `ip` without applying freshness rules.
    pub fn entry(&self, ip: &IpAddr) -> Result<Option<CacheEntry>, StoreError> {
        self.store.with_conn(|conn| select_entry(conn, ip))
    }

    /// Upsert a verdict for `ip` stamped with the current time.
    ///
    /// The exemption flag of an existing row is left untouched.
    pub fn record(&self, ip: &IpAddr, is_proxy: bool) -> Result<(), StoreError> {
        self.record_at(ip, is_proxy, Utc::now())
    }

    pub(crate) fn record_at(
        &self,
        ip: &IpAddr,
        is_proxy: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache (ip, is_proxy, exempted, recorded_at) VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT(ip) DO UPDATE SET is_proxy = excluded.is_proxy,
                                               recorded_at = excluded.recorded_at",
                params![ip.to_string(), is_proxy, at.timestamp()],
            )?;
            Ok(())
        })
    }

    /// Set or clear the exemption flag on `ip`.
    ///
    /// Returns `true` if the flag changed. Clearing the flag removes the row,
    /// so the next lookup goes back to the providers instead of reviving a
    /// verdict that aged while the exemption was in force.
    pub fn set_exempt(&self, ip: &IpAddr, exempt: bool) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();

        self.store.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing = select_entry(&tx, ip)?;
            let changed = existing.as_ref().map_or(exempt, |e| e.exempted != exempt);

            match existing {
                Some(_) if !exempt => {
                    tx.execute("DELETE FROM cache WHERE ip = ?1", params![ip.to_string()])?;
                }
                None if !exempt => {}
                _ => {
                    tx.execute(
                        "INSERT INTO cache (ip, is_proxy, exempted, recorded_at) VALUES (?1, NULL, ?2, ?3)
                         ON CONFLICT(ip) DO UPDATE SET exempted = excluded.exempted,
                                                       recorded_at = excluded.recorded_at",
                        params![ip.to_string(), exempt, now],
                    )?;
                }
            }

            tx.commit()?;
            Ok(changed)
        })
    }

    /// Whether `ip` is currently exempted.
    pub fn is_exempt(&self, ip: &IpAddr) -> Result<bool, StoreError> {
        Ok(self.entry(ip)?.is_some_and(|e| e.exempted))
    }

    /// All exempted IPs.
    pub fn list_exempt_ips(&self) -> Result<BTreeSet<IpAddr>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT ip FROM cache WHERE exempted = 1")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut ips = BTreeSet::new();
            for raw in rows {
                ips.insert(parse_ip(&raw?)?);
            }
            Ok(ips)
        })
    }

    /// Number of rows in the cache table.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.store.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Check if the cache table is empty.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn select_entry(
    conn: &rusqlite::Connection,
    ip: &IpAddr,
) -> Result<Option<CacheEntry>, StoreError> {
    let row = conn
        .query_row(
            "SELECT is_proxy, exempted, recorded_at FROM cache WHERE ip = ?1",
            params![ip.to_string()],
            |row| {
                Ok((
                    row.get::<_, Option<bool>>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((is_proxy, exempted, ts)) = row else {
        return Ok(None);
    };

    let recorded_at = Utc
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} for {}", ts, ip)))?;

    Ok(Some(CacheEntry {
        ip: *ip,
        is_proxy,
        exempted,
        recorded_at,
    }))
}

fn parse_ip(raw: &str) -> Result<IpAddr, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid ip {:?}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(expiry: Duration) -> ReputationCache {
        ReputationCache::new(Store::open_in_memory().unwrap(), expiry)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cache_record_and_lookup() {
        let cache = cache(DEFAULT_EXPIRY);
        let addr = ip("203.0.113.7");

        cache.record(&addr, true).unwrap();
        assert_eq!(cache.lookup(&addr).unwrap(), Some(true));

        cache.record(&addr, false).unwrap();
        assert_eq!(cache.lookup(&addr).unwrap(), Some(false));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_cache_miss() {
        let cache = cache(DEFAULT_EXPIRY);
        assert_eq!(cache.lookup(&ip("198.51.100.1")).unwrap(), None);
    }

    #[test]
    fn test_stale_entry_is_purged() {
        let cache = cache(Duration::from_secs(3600));
        let addr = ip("198.51.100.2");

        cache
            .record_at(&addr, true, Utc::now() - chrono::Duration::hours(2))
            .unwrap();

        assert_eq!(cache.lookup(&addr).unwrap(), None);
        assert!(cache.entry(&addr).unwrap().is_none());
    }

    #[test]
    fn test_zero_window_is_never_fresh() {
        let cache = cache(Duration::ZERO);
        let addr = ip("198.51.100.3");

        cache.record(&addr, true).unwrap();
        assert_eq!(cache.lookup(&addr).unwrap(), None);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_exempt_wins_over_verdict_and_age() {
        let cache = cache(Duration::from_secs(60));
        let addr = ip("192.0.2.200");

        cache
            .record_at(&addr, true, Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert!(cache.set_exempt(&addr, true).unwrap());

        // Refresh the verdict as proxy; the flag must survive.
        cache
            .record_at(&addr, true, Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert!(cache.is_exempt(&addr).unwrap());
        assert_eq!(cache.lookup(&addr).unwrap(), Some(false));
        assert!(cache.entry(&addr).unwrap().is_some());
    }

    #[test]
    fn test_set_exempt_reports_change() {
        let cache = cache(DEFAULT_EXPIRY);
        let addr = ip("2001:db8::1");

        assert!(cache.set_exempt(&addr, true).unwrap());
        assert!(!cache.set_exempt(&addr, true).unwrap());
        assert!(cache.set_exempt(&addr, false).unwrap());
        assert!(!cache.set_exempt(&addr, false).unwrap());
    }

    #[test]
    fn test_clearing_exemption_without_verdict_deletes_row() {
        let cache = cache(DEFAULT_EXPIRY);
        let addr = ip("198.51.100.9");

        cache.set_exempt(&addr, true).unwrap();
        cache.set_exempt(&addr, false).unwrap();

        assert!(cache.entry(&addr).unwrap().is_none());
        assert_eq!(cache.lookup(&addr).unwrap(), None);
    }

    #[test]
    fn test_clearing_exemption_drops_old_verdict() {
        let cache = cache(Duration::from_secs(3600));
        let addr = ip("198.51.100.10");

        cache
            .record_at(&addr, true, Utc::now() - chrono::Duration::days(30))
            .unwrap();
        cache.set_exempt(&addr, true).unwrap();
        assert_eq!(cache.lookup(&addr).unwrap(), Some(false));

        assert!(cache.set_exempt(&addr, false).unwrap());
        assert!(cache.entry(&addr).unwrap().is_none());
        assert_eq!(cache.lookup(&addr).unwrap(), None);
    }

    #[test]
    fn test_huge_window_keeps_entries_fresh() {
        let cache = cache(Duration::from_secs(u64::MAX));
        let addr = ip("8.8.4.4");

        cache.record(&addr, true).unwrap();
        assert_eq!(cache.lookup(&addr).unwrap(), Some(true));

        let entry = cache.entry(&addr).unwrap().unwrap();
        assert!(entry.is_fresh(Duration::from_secs(u64::MAX), Utc::now()));
    }

    #[test]
    fn test_list_exempt_ips() {
        let cache = cache(DEFAULT_EXPIRY);

        cache.set_exempt(&ip("198.51.100.1"), true).unwrap();
        cache.set_exempt(&ip("2001:db8::5"), true).unwrap();
        cache.record(&ip("198.51.100.2"), false).unwrap();

        let listed = cache.list_exempt_ips().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&ip("198.51.100.1")));
        assert!(listed.contains(&ip("2001:db8::5")));
    }

    #[test]
    fn test_cache_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("hopm-cache-{}", uuid::Uuid::new_v4()));
        let path = dir.join("cache.db");
        let addr = ip("203.0.113.50");

        {
            let cache = ReputationCache::new(Store::open(&path).unwrap(), DEFAULT_EXPIRY);
            cache.record(&addr, true).unwrap();
            cache.set_exempt(&ip("203.0.113.51"), true).unwrap();
        }

        let cache = ReputationCache::new(Store::open(&path).unwrap(), DEFAULT_EXPIRY);
        assert_eq!(cache.lookup(&addr).unwrap(), Some(true));
        assert!(cache.is_exempt(&ip("203.0.113.51")).unwrap());

        drop(cache);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cache_entry_is_fresh() {
        let now = Utc::now();
        let entry = CacheEntry {
            ip: ip("203.0.113.1"),
            is_proxy: Some(false),
            exempted: false,
            recorded_at: now - chrono::Duration::seconds(100),
        };

        assert!(!entry.is_fresh(Duration::from_secs(60), now));
        assert!(entry.is_fresh(Duration::from_secs(101), now));
    }
}
