//! HOPM proxy checker CLI.
//!
//! Events arrive on stdin, one per line:
//!
//! - `notice <server notice text>`
//! - `command <source> <message text>`
//!
//! Ban directives (`ZLINE ...`) and channel replies (`PRIVMSG <channel> :...`)
//! are written to stdout, ready to be relayed by an IRC client.

use anyhow::Result;
use clap::Parser;
use hopm_proxy_checker::transport::LineTransport;
use hopm_proxy_checker::{CommandRouter, Config, ProxyChecker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hopm-proxy-checker")]
#[command(about = "Proxy/VPN checker for IRC connection notices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "hopm.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

/// One inbound event from the stdin bridge.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Notice(String),
    Command { source: String, text: String },
}

fn parse_event(line: &str) -> Option<Event> {
    let (kind, rest) = line.split_once(' ')?;
    match kind {
        "notice" => Some(Event::Notice(rest.to_string())),
        "command" => {
            let (source, text) = rest.split_once(' ')?;
            Some(Event::Command {
                source: source.to_string(),
                text: text.to_string(),
            })
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Logs go to stderr; stdout carries outbound IRC lines.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let checker = Arc::new(ProxyChecker::from_config(&config)?);
    let transport = Arc::new(LineTransport::new(
        &config.settings.channel,
        tokio::io::stdout(),
    ));
    let router = Arc::new(CommandRouter::new(
        checker,
        transport,
        config.admins.clone(),
        config.settings.clone(),
    ));

    info!(
        database = %config.settings.database_path.display(),
        expiry_seconds = config.settings.cache_expiry_seconds,
        admins = config.admins.len(),
        "Proxy checker started"
    );

    let permits = Arc::new(Semaphore::new(config.settings.max_concurrent_events));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_event(line.trim_end()) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Unrecognised input line");
            }
            continue;
        };

        let permit = permits.clone().acquire_owned().await?;
        let router = router.clone();
        tokio::spawn(async move {
            match event {
                Event::Notice(text) => router.handle_notice(&text).await,
                Event::Command { source, text } => router.handle_command(&source, &text).await,
            }
            drop(permit);
        });
    }

    // Wait for in-flight events before exiting.
    let _ = permits
        .acquire_many(config.settings.max_concurrent_events as u32)
        .await?;
    debug!("Input closed, shutting down");

    Ok(())
}
