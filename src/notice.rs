//! Connection notice parsing and address eligibility.

use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use tracing::debug;

/// Local client connection notice:
/// `CONNECT: Client connecting on port 6697 (class users): nick!ident@host (203.0.113.9)`.
/// The address may also be bracketed: `[2001:db8::1]`.
static CONNECT_NOTICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"CONNECT: Client connecting on port \d+ \(class [^)]+\): ([^!\s]+)![^@\s]*@\S*\s*[(\[]([0-9A-Fa-f:.]+)[)\]]",
    )
    .unwrap()
});

/// Ranges that are never subject to reputation checks.
static NON_PUBLIC: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "127.0.0.0/8",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "240.0.0.0/4",
        "255.255.255.255/32",
        "::/128",
        "::1/128",
        "::ffff:0:0/96",
        "100::/64",
        "2001::/23",
        "2001:db8::/32",
        "fc00::/7",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

static LINK_LOCAL: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    ["169.254.0.0/16", "fe80::/10"]
        .iter()
        .filter_map(|net| net.parse().ok())
        .collect()
});

/// Why a candidate address was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// Not an IPv4 or IPv6 literal.
    Invalid,
    /// Private, loopback, reserved or documentation range.
    Private,
    /// Link-local range.
    LinkLocal,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::Invalid => write!(f, "not a valid IP address"),
            AddressError::Private => write!(f, "private or reserved address"),
            AddressError::LinkLocal => write!(f, "link-local address"),
        }
    }
}

impl std::error::Error for AddressError {}

/// Parse `candidate` and require a publicly routable address.
pub fn classify(candidate: &str) -> Result<IpAddr, AddressError> {
    let ip: IpAddr = candidate.trim().parse().map_err(|_| AddressError::Invalid)?;

    if LINK_LOCAL.iter().any(|net| net.contains(&ip)) {
        return Err(AddressError::LinkLocal);
    }
    if NON_PUBLIC.iter().any(|net| net.contains(&ip)) {
        return Err(AddressError::Private);
    }

    Ok(ip)
}

/// A client eligible for a reputation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectingClient {
    pub ip: IpAddr,
    pub nick: String,
}

/// Extract the connecting client from a server notice.
///
/// Returns `None` for notices that are not local connection notices, or whose
/// address is invalid or not public.
pub fn parse(notice: &str) -> Option<ConnectingClient> {
    if notice.contains("REMOTECONNECT") {
        return None;
    }

    let Some(caps) = CONNECT_NOTICE.captures(notice) else {
        debug!(notice = notice, "Notice is not a connection notice");
        return None;
    };

    let nick = caps[1].to_string();
    match classify(&caps[2]) {
        Ok(ip) => Some(ConnectingClient { ip, nick }),
        Err(e) => {
            debug!(nick = %nick, address = &caps[2], reason = %e, "Skipping ineligible address");
            None
        }
    }
}
