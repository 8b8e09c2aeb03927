//! Admin command parsing and event routing.

use crate::checker::ProxyChecker;
use crate::config::Settings;
use crate::notice::{self, AddressError};
use crate::store::StoreError;
use crate::transport::{BanDirective, Transport};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

const EXEMPT_USAGE: &str =
    "Usage: !hopm exempt add|del <ip> | !hopm exempt list | !hopm exempt dns add|del <pattern> | !hopm exempt dns list";
const INFO_USAGE: &str = "Usage: >info <ip>";

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddIpExemption(IpAddr),
    DelIpExemption(IpAddr),
    ListIpExemptions,
    AddDnsExemption(String),
    DelDnsExemption(String),
    ListDnsExemptions,
    Info(IpAddr),
}

/// A recognised command that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Wrong sub-command or argument count.
    Usage(&'static str),
    /// The IP argument was rejected.
    InvalidAddress { input: String, reason: AddressError },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Usage(usage) => write!(f, "{}", usage),
            CommandError::InvalidAddress { input, reason } => {
                write!(f, "Invalid IP {}: {}", input, reason)
            }
        }
    }
}

impl std::error::Error for CommandError {}

impl Command {
    /// Parse an admin message.
    ///
    /// Returns `Ok(None)` if the message is not addressed to this bot at all.
    pub fn parse(text: &str) -> Result<Option<Command>, CommandError> {
        let tokens: Vec<&str> = text.split_whitespace().collect();

        let command = match tokens.as_slice() {
            ["!hopm", "exempt", args @ ..] => parse_exempt(args)?,
            ["!hopm", ..] => return Err(CommandError::Usage(EXEMPT_USAGE)),
            [">info", ip] => Command::Info(parse_any_ip(ip)?),
            [">info", ..] => return Err(CommandError::Usage(INFO_USAGE)),
            _ => return Ok(None),
        };

        Ok(Some(command))
    }
}

fn parse_exempt(args: &[&str]) -> Result<Command, CommandError> {
    match args {
        ["add", ip] => Ok(Command::AddIpExemption(parse_ip(ip)?)),
        ["del", ip] => Ok(Command::DelIpExemption(parse_ip(ip)?)),
        ["list"] => Ok(Command::ListIpExemptions),
        ["dns", "add", pattern] => Ok(Command::AddDnsExemption(pattern.to_string())),
        ["dns", "del", pattern] => Ok(Command::DelDnsExemption(pattern.to_string())),
        ["dns", "list"] => Ok(Command::ListDnsExemptions),
        _ => Err(CommandError::Usage(EXEMPT_USAGE)),
    }
}

fn parse_ip(input: &str) -> Result<IpAddr, CommandError> {
    notice::classify(input).map_err(|reason| CommandError::InvalidAddress {
        input: input.to_string(),
        reason,
    })
}

/// Syntax-only parse for lookups that never touch the cache or exemptions.
fn parse_any_ip(input: &str) -> Result<IpAddr, CommandError> {
    input.parse().map_err(|_| CommandError::InvalidAddress {
        input: input.to_string(),
        reason: AddressError::Invalid,
    })
}

/// Routes connection notices and admin commands to the checker and reports
/// the outcome through the transport.
pub struct CommandRouter {
    checker: Arc<ProxyChecker>,
    transport: Arc<dyn Transport>,
    admins: HashSet<String>,
    settings: Settings,
}

impl CommandRouter {
    pub fn new(
        checker: Arc<ProxyChecker>,
        transport: Arc<dyn Transport>,
        admins: impl IntoIterator<Item = String>,
        settings: Settings,
    ) -> Self {
        Self {
            checker,
            transport,
            admins: admins.into_iter().collect(),
            settings,
        }
    }

    /// Whether `source` may issue admin commands.
    pub fn is_admin(&self, source: &str) -> bool {
        self.admins.contains(source)
    }

    /// Handle a server connection notice: check the client and ban or
    /// announce the result.
    pub async fn handle_notice(&self, text: &str) {
        let Some(client) = notice::parse(text) else {
            return;
        };

        let verdict = match self.checker.check(&client.ip).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(ip = %client.ip, nick = %client.nick, error = %e, "Proxy check failed");
                self.transport
                    .reply(&format!(
                        "Scan of {}@{} failed: {}",
                        client.nick, client.ip, e
                    ))
                    .await;
                return;
            }
        };

        if verdict.is_proxy {
            let ban = BanDirective::new(
                client.ip,
                &self.settings.ban_duration,
                &self.settings.ban_reason,
            );
            info!(
                ip = %client.ip,
                nick = %client.nick,
                ban_id = %ban.id,
                source = ?verdict.source,
                "Banning proxy"
            );
            self.transport.send_ban(&ban).await;
            self.transport
                .reply(&format!(
                    "Scanned {}@{}. Response positive: User has been banned from the server: Proxy. ID: {}",
                    client.nick, client.ip, ban.id
                ))
                .await;
        } else {
            debug!(ip = %client.ip, nick = %client.nick, source = ?verdict.source, "Client passed");
            if self.settings.announce_clean {
                self.transport
                    .reply(&format!(
                        "Scanned {}@{}. Response None: User passed control of HOPM.",
                        client.nick, client.ip
                    ))
                    .await;
            }
        }
    }

    /// Handle a channel message from `source`. Messages from non-admins and
    /// messages that are not commands are ignored.
    pub async fn handle_command(&self, source: &str, text: &str) {
        if !self.is_admin(source) {
            return;
        }

        let reply = match Command::parse(text) {
            Ok(None) => return,
            Ok(Some(command)) => {
                debug!(source = source, command = ?command, "Admin command");
                match self.dispatch(command).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(source = source, error = %e, "Admin command failed");
                        format!("Command failed: {}", e)
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        self.transport.reply(&reply).await;
    }

    /// Execute a parsed command and render its reply.
    pub async fn dispatch(&self, command: Command) -> Result<String, StoreError> {
        let reply = match command {
            Command::AddIpExemption(ip) => {
                if self.checker.exempt_ip(&ip)? {
                    format!("IP {} has been exempted from proxy checks.", ip)
                } else {
                    format!("IP {} is already exempted.", ip)
                }
            }
            Command::DelIpExemption(ip) => {
                self.checker.remove_exemption(&ip)?;
                format!("IP {} exemption has been removed.", ip)
            }
            Command::ListIpExemptions => {
                let ips = self.checker.list_exemptions()?;
                if ips.is_empty() {
                    "No exempted IPs.".to_string()
                } else {
                    let list: Vec<String> = ips.iter().map(IpAddr::to_string).collect();
                    format!("Exempted IPs: {}", list.join(", "))
                }
            }
            Command::AddDnsExemption(pattern) => {
                if self.checker.add_dns_exemption(&pattern)? {
                    format!("DNS pattern {} has been exempted from proxy checks.", pattern)
                } else {
                    format!("DNS pattern {} is already exempted.", pattern)
                }
            }
            Command::DelDnsExemption(pattern) => {
                if self.checker.remove_dns_exemption(&pattern)? {
                    format!("DNS pattern {} exemption has been removed.", pattern)
                } else {
                    format!("DNS pattern {} was not exempted.", pattern)
                }
            }
            Command::ListDnsExemptions => {
                let patterns = self.checker.list_dns_exemptions()?;
                if patterns.is_empty() {
                    "No exempted DNS patterns.".to_string()
                } else {
                    format!("Exempted DNS patterns: {}", patterns.join(", "))
                }
            }
            Command::Info(ip) => match self.checker.get_ip_info(&ip).await {
                Some(info) => format!("IP info for {}: {}", ip, info),
                None => format!("No information available for {}.", ip),
            },
        };

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReputationCache;
    use crate::dns::tests::StaticResolver;
    use crate::exemptions::ExemptionStore;
    use crate::providers::{ProviderError, ReputationProvider, ReputationResult};
    use crate::store::Store;
    use crate::transport::tests::RecordingTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ADMIN: &str = "oper!oper@staff.example.net";

    /// Flags exactly the listed addresses.
    struct ListProvider {
        proxies: Vec<IpAddr>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReputationProvider for ListProvider {
        async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.proxies.contains(ip) {
                Ok(ReputationResult::proxy("list"))
            } else {
                Ok(ReputationResult::clean("list"))
            }
        }

        fn name(&self) -> &str {
            "list"
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    struct Harness {
        router: CommandRouter,
        transport: Arc<RecordingTransport>,
        provider: Arc<ListProvider>,
    }

    fn harness(proxies: &[&str], settings: Settings) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let provider = Arc::new(ListProvider {
            proxies: proxies.iter().map(|p| p.parse().unwrap()).collect(),
            calls: AtomicUsize::new(0),
        });
        let checker = ProxyChecker::new(
            ReputationCache::new(store.clone(), Duration::from_secs(3600)),
            ExemptionStore::new(store),
            Arc::new(StaticResolver::default()),
            Some(provider.clone()),
            None,
        );
        let transport = Arc::new(RecordingTransport::default());
        let router = CommandRouter::new(
            Arc::new(checker),
            transport.clone(),
            vec![ADMIN.to_string()],
            settings,
        );

        Harness {
            router,
            transport,
            provider,
        }
    }

    fn connect(user: &str, addr: &str) -> String {
        format!(
            "*** Notice -- CONNECT: Client connecting on port 6697 (class users): {} ({})",
            user, addr
        )
    }

    #[test]
    fn test_parse_exempt_commands() {
        assert_eq!(
            Command::parse("!hopm exempt add 8.8.8.8").unwrap(),
            Some(Command::AddIpExemption("8.8.8.8".parse().unwrap()))
        );
        assert_eq!(
            Command::parse("!hopm exempt del 2606:4700::1111").unwrap(),
            Some(Command::DelIpExemption("2606:4700::1111".parse().unwrap()))
        );
        assert_eq!(
            Command::parse("!hopm exempt list").unwrap(),
            Some(Command::ListIpExemptions)
        );
        assert_eq!(
            Command::parse("!hopm exempt dns add *.example.com").unwrap(),
            Some(Command::AddDnsExemption("*.example.com".to_string()))
        );
        assert_eq!(
            Command::parse("!hopm   exempt dns del  *.example.com").unwrap(),
            Some(Command::DelDnsExemption("*.example.com".to_string()))
        );
        assert_eq!(
            Command::parse("!hopm exempt dns list").unwrap(),
            Some(Command::ListDnsExemptions)
        );
        assert_eq!(
            Command::parse(">info 1.1.1.1").unwrap(),
            Some(Command::Info("1.1.1.1".parse().unwrap()))
        );
    }

    #[test]
    fn test_parse_non_commands() {
        assert_eq!(Command::parse("hello there").unwrap(), None);
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("!hopmx exempt list").unwrap(), None);
        assert_eq!(Command::parse("!HOPM exempt list").unwrap(), None);
    }

    #[test]
    fn test_parse_bad_arity() {
        assert_eq!(
            Command::parse("!hopm exempt add"),
            Err(CommandError::Usage(EXEMPT_USAGE))
        );
        assert_eq!(
            Command::parse("!hopm exempt add 8.8.8.8 extra"),
            Err(CommandError::Usage(EXEMPT_USAGE))
        );
        assert_eq!(
            Command::parse("!hopm exempt list now"),
            Err(CommandError::Usage(EXEMPT_USAGE))
        );
        assert_eq!(
            Command::parse("!hopm exempt dns add"),
            Err(CommandError::Usage(EXEMPT_USAGE))
        );
        assert_eq!(Command::parse("!hopm status"), Err(CommandError::Usage(EXEMPT_USAGE)));
        assert_eq!(Command::parse(">info"), Err(CommandError::Usage(INFO_USAGE)));
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert_eq!(
            Command::parse("!hopm exempt add nope"),
            Err(CommandError::InvalidAddress {
                input: "nope".to_string(),
                reason: AddressError::Invalid,
            })
        );
        assert_eq!(
            Command::parse("!hopm exempt add 10.1.2.3"),
            Err(CommandError::InvalidAddress {
                input: "10.1.2.3".to_string(),
                reason: AddressError::Private,
            })
        );
        assert!(Command::parse(">info not-an-ip").is_err());
    }

    #[test]
    fn test_info_accepts_any_valid_address() {
        assert_eq!(
            Command::parse(">info 10.1.2.3").unwrap(),
            Some(Command::Info("10.1.2.3".parse().unwrap()))
        );
        assert_eq!(
            Command::parse(">info fe80::1").unwrap(),
            Some(Command::Info("fe80::1".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn test_proxy_notice_bans_once() {
        let h = harness(&["8.8.8.8"], Settings::default());

        h.router.handle_notice(&connect("mallory!m@h", "8.8.8.8")).await;

        let bans = h.transport.bans();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].to_zline(), "ZLINE *@8.8.8.8 1d :Proxy detected, Z-lined by HOPM.");

        let replies = h.transport.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            format!(
                "Scanned mallory@8.8.8.8. Response positive: User has been banned from the server: Proxy. ID: {}",
                bans[0].id
            )
        );
    }

    #[tokio::test]
    async fn test_clean_notice_is_announced() {
        let h = harness(&[], Settings::default());

        h.router.handle_notice(&connect("alice!a@h", "1.1.1.1")).await;

        assert!(h.transport.bans().is_empty());
        assert_eq!(
            h.transport.replies(),
            vec!["Scanned alice@1.1.1.1. Response None: User passed control of HOPM."]
        );
    }

    #[tokio::test]
    async fn test_clean_notice_silent_when_disabled() {
        let settings = Settings {
            announce_clean: false,
            ..Settings::default()
        };
        let h = harness(&[], settings);

        h.router.handle_notice(&connect("alice!a@h", "1.1.1.1")).await;
        assert!(h.transport.replies().is_empty());
    }

    #[tokio::test]
    async fn test_private_notice_never_checked() {
        let h = harness(&["10.0.0.5"], Settings::default());

        h.router.handle_notice(&connect("lan!l@h", "10.0.0.5")).await;
        h.router.handle_notice(&connect("lan!l@h", "fe80::1")).await;

        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
        assert!(h.transport.bans().is_empty());
        assert!(h.transport.replies().is_empty());
    }

    #[tokio::test]
    async fn test_non_admin_is_ignored() {
        let h = harness(&[], Settings::default());

        h.router
            .handle_command("random!r@elsewhere", "!hopm exempt add 8.8.8.8")
            .await;

        assert!(h.transport.replies().is_empty());
        assert!(h.router.checker.list_exemptions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exempt_command_flow() {
        let h = harness(&["8.8.8.8"], Settings::default());

        h.router.handle_command(ADMIN, "!hopm exempt add 8.8.8.8").await;
        h.router.handle_command(ADMIN, "!hopm exempt add 8.8.8.8").await;
        h.router.handle_command(ADMIN, "!hopm exempt list").await;
        h.router.handle_notice(&connect("mallory!m@h", "8.8.8.8")).await;
        h.router.handle_command(ADMIN, "!hopm exempt del 8.8.8.8").await;
        h.router.handle_command(ADMIN, "!hopm exempt list").await;

        assert_eq!(
            h.transport.replies(),
            vec![
                "IP 8.8.8.8 has been exempted from proxy checks.",
                "IP 8.8.8.8 is already exempted.",
                "Exempted IPs: 8.8.8.8",
                "Scanned mallory@8.8.8.8. Response None: User passed control of HOPM.",
                "IP 8.8.8.8 exemption has been removed.",
                "No exempted IPs.",
            ]
        );
        assert!(h.transport.bans().is_empty());
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dns_command_flow() {
        let h = harness(&[], Settings::default());

        h.router.handle_command(ADMIN, "!hopm exempt dns add *.example.com").await;
        h.router.handle_command(ADMIN, "!hopm exempt dns add *.example.com").await;
        h.router.handle_command(ADMIN, "!hopm exempt dns list").await;
        h.router.handle_command(ADMIN, "!hopm exempt dns del *.example.com").await;
        h.router.handle_command(ADMIN, "!hopm exempt dns del *.example.com").await;
        h.router.handle_command(ADMIN, "!hopm exempt dns list").await;

        assert_eq!(
            h.transport.replies(),
            vec![
                "DNS pattern *.example.com has been exempted from proxy checks.",
                "DNS pattern *.example.com is already exempted.",
                "Exempted DNS patterns: *.example.com",
                "DNS pattern *.example.com exemption has been removed.",
                "DNS pattern *.example.com was not exempted.",
                "No exempted DNS patterns.",
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_command_gets_usage_reply() {
        let h = harness(&[], Settings::default());

        h.router.handle_command(ADMIN, "!hopm exempt add").await;
        h.router.handle_command(ADMIN, "!hopm exempt add 192.168.0.1").await;
        h.router.handle_command(ADMIN, "just chatting").await;

        assert_eq!(
            h.transport.replies(),
            vec![
                EXEMPT_USAGE.to_string(),
                "Invalid IP 192.168.0.1: private or reserved address".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_info_without_secondary() {
        let h = harness(&[], Settings::default());

        h.router.handle_command(ADMIN, ">info 1.1.1.1").await;
        assert_eq!(
            h.transport.replies(),
            vec!["No information available for 1.1.1.1."]
        );
    }
}
