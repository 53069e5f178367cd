use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use tftpd::config::{Config, DEFAULT_PORT};
use tftpd::dispatcher::Dispatcher;
use tftpd::storage::{FsStore, Policy};

/// A TFTP server (RFC 1350)
#[derive(Parser, Debug)]
#[command(name = "tftpd", version)]
struct Args {
    /// IP address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Port to listen on for new requests
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory to serve files from
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Retransmission timeout in milliseconds
    #[arg(short, long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..=60_000))]
    timeout: u64,

    /// Retransmissions before a silent peer is abandoned
    #[arg(short, long, default_value_t = 5)]
    retries: u32,

    /// Refuse all write requests
    #[arg(long)]
    read_only: bool,

    /// Allow write requests to replace existing files
    #[arg(long)]
    overwrite: bool,

    /// Ports for transfer sockets, as LOW-HIGH
    #[arg(long, value_parser = parse_port_range)]
    port_range: Option<RangeInclusive<u16>>,

    /// Maximum number of concurrent transfers
    #[arg(long, default_value_t = 256)]
    max_sessions: usize,

    /// Leave as soon as the final block of an upload is acknowledged
    #[arg(long)]
    no_dally: bool,
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>> {
    let (low, high) = s.split_once('-').ok_or_else(|| anyhow!("expected LOW-HIGH, got '{s}'"))?;
    let range = low.trim().parse::<u16>()?..=high.trim().parse::<u16>()?;
    if range.is_empty() {
        bail!("port range '{s}' is empty");
    }
    Ok(range)
}

impl Args {
    fn into_config(self) -> Config {
        Config::new(self.ip, self.port, self.directory)
            .with_timeout(Duration::from_millis(self.timeout))
            .with_max_retries(self.retries)
            .with_read_only(self.read_only)
            .with_overwrite(self.overwrite)
            .with_port_range(self.port_range)
            .with_max_sessions(self.max_sessions)
            .with_dally(!self.no_dally)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();

    let root = config
        .root
        .canonicalize()
        .with_context(|| format!("Directory does not exist: {}", config.root.display()))?;
    if !root.is_dir() {
        bail!("Not a directory: {}", root.display());
    }

    let store = FsStore::new(root.clone(), config.overwrite);
    let policy = if config.read_only { Policy::read_only() } else { Policy::allow_all() };
    let bind_addr = config.bind_addr;

    let mut dispatcher = Dispatcher::bind(config, Arc::new(store), Arc::new(policy))
        .with_context(|| format!("Failed to bind TFTP socket to {}", bind_addr))?;

    log::info!("TFTP server listening on {}", bind_addr);
    log::info!("Serving files from {}", root.display());

    dispatcher
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    log::info!("TFTP server stopped");
    Ok(())
}
