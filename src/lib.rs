//! HOPM-style proxy checker for IRC networks.
//!
//! Watches server connection notices, looks up each connecting client's IP
//! against remote proxy/VPN reputation providers and bans positives.
//!
//! # Features
//!
//! - **Persistent verdict cache** - SQLite-backed, one day freshness by default
//! - **Two providers** - a generic JSON endpoint and proxycheck.io, queried
//!   concurrently; either one flagging the IP is enough
//! - **Exemptions** - per-IP and reverse-DNS glob patterns, managed from the
//!   operator channel
//! - **Address filtering** - private, reserved and link-local addresses are
//!   never checked or banned
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   cache_expiry_seconds: 86400
//!   channel: "#hopm"
//!
//! proxycheck:
//!   api_key: "${PROXYCHECK_API_KEY}"
//!
//! admins:
//!   - "oper!oper@staff.example.net"
//!
//! dns_exemptions:
//!   - "*.staff.example.net"
//! ```

pub mod cache;
pub mod checker;
pub mod commands;
pub mod config;
pub mod dns;
pub mod exemptions;
pub mod notice;
pub mod providers;
pub mod store;
pub mod transport;

pub use checker::{ProxyChecker, Verdict};
pub use commands::{Command, CommandRouter};
pub use config::Config;
