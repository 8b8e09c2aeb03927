//! Operator-managed DNS pattern exemptions.

use crate::store::{Store, StoreError};
use regex::Regex;
use rusqlite::params;
use tracing::debug;

/// Exemption kind tag stored in the `type` column.
const DNS_KIND: &str = "dns";

/// A shell-style hostname glob (`*` and `?`), matched case-sensitively
/// against the whole hostname.
#[derive(Debug, Clone)]
pub struct DnsPattern {
    pattern: String,
    regex: Regex,
}

impl DnsPattern {
    /// Compile a glob pattern.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&glob_to_regex(pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The glob text as written.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Check if `hostname` matches this pattern.
    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(hostname)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// Persistent list of DNS pattern exemptions. Patterns never expire.
#[derive(Clone)]
pub struct ExemptionStore {
    store: Store,
}

impl ExemptionStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert `pattern`. Returns `false` if the exact string already exists.
    pub fn add_dns_pattern(&self, pattern: &str) -> Result<bool, StoreError> {
        self.store.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO exemptions (type, value) VALUES (?1, ?2)",
                params![DNS_KIND, pattern],
            )?;
            debug!(pattern = pattern, inserted = inserted > 0, "DNS exemption add");
            Ok(inserted > 0)
        })
    }

    /// Delete `pattern`. Returns `true` iff a row was removed.
    pub fn remove_dns_pattern(&self, pattern: &str) -> Result<bool, StoreError> {
        self.store.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM exemptions WHERE type = ?1 AND value = ?2",
                params![DNS_KIND, pattern],
            )?;
            Ok(deleted > 0)
        })
    }

    /// All patterns in insertion order.
    pub fn list_dns_patterns(&self) -> Result<Vec<String>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT value FROM exemptions WHERE type = ?1 ORDER BY id")?;
            let patterns = stmt
                .query_map(params![DNS_KIND], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(patterns)
        })
    }

    /// Return the first stored pattern matching `hostname`.
    ///
    /// Stored patterns that fail to compile are skipped.
    pub fn find_match(&self, hostname: &str) -> Result<Option<String>, StoreError> {
        for raw in self.list_dns_patterns()? {
            match DnsPattern::new(&raw) {
                Ok(pattern) if pattern.matches(hostname) => {
                    debug!(pattern = pattern.as_str(), hostname = hostname, "DNS exemption matched");
                    return Ok(Some(pattern.as_str().to_string()));
                }
                Ok(_) => {}
                Err(e) => debug!(pattern = %raw, error = %e, "Skipping uncompilable DNS pattern"),
            }
        }
        Ok(None)
    }
}
