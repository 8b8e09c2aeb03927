//! Outbound actions: ban directives and channel replies.

use async_trait::async_trait;
use std::net::IpAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

/// A ban to be applied to an IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanDirective {
    pub ip: IpAddr,
    /// Duration token understood by the server, e.g. `1d`.
    pub duration: String,
    pub reason: String,
    /// Short identifier quoted in the channel announcement.
    pub id: String,
}

impl BanDirective {
    /// Create a ban with a fresh identifier.
    pub fn new(ip: IpAddr, duration: &str, reason: &str) -> Self {
        Self {
            ip,
            duration: duration.to_string(),
            reason: reason.to_string(),
            id: ban_id(),
        }
    }

    /// Render as a raw `ZLINE` command.
    pub fn to_zline(&self) -> String {
        format!("ZLINE *@{} {} :{}", self.ip, self.duration, self.reason)
    }
}

/// First group of a random UUID, upper-cased.
fn ban_id() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    uuid.split('-').next().unwrap_or_default().to_uppercase()
}

/// Capability through which the checker acts on the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Apply a ban.
    async fn send_ban(&self, ban: &BanDirective);

    /// Send a human-readable reply to the operator channel.
    async fn reply(&self, text: &str);
}

/// Writes raw IRC lines (`ZLINE`, `PRIVMSG`) to a stream, one per line.
pub struct LineTransport<W> {
    channel: String,
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> LineTransport<W> {
    pub fn new(channel: &str, writer: W) -> Self {
        Self {
            channel: channel.to_string(),
            writer: Mutex::new(writer),
        }
    }

    async fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Failed to write outbound line");
        }
    }

    /// Consume the transport and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for LineTransport<W> {
    async fn send_ban(&self, ban: &BanDirective) {
        self.write_line(&ban.to_zline()).await;
    }

    async fn reply(&self, text: &str) {
        self.write_line(&format!("PRIVMSG {} :{}", self.channel, text))
            .await;
    }
}
