use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// The well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// Server configuration.
///
/// ```rust
/// use std::time::Duration;
/// use tftpd::config::Config;
///
/// let config = Config::default()
///     .with_timeout(Duration::from_millis(500))
///     .with_read_only(true);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the dispatcher listens on for new requests.
    pub bind_addr: SocketAddr,
    /// Directory served by the filesystem store.
    pub root: PathBuf,
    /// How long to wait for the peer before retransmitting.
    pub timeout: Duration,
    /// Retransmissions of one packet before the peer is presumed gone.
    pub max_retries: u32,
    /// Refuse every write request.
    pub read_only: bool,
    /// Let write requests replace existing files.
    pub overwrite: bool,
    /// Ports to pick session sockets from. `None` lets the OS choose.
    pub port_range: Option<RangeInclusive<u16>>,
    /// Requests beyond this many concurrent sessions are refused.
    pub max_sessions: usize,
    /// Stay for one timeout after the final ACK of a write to answer a repeated final block.
    pub dally: bool,
}

impl Config {
    pub fn new(ip_address: IpAddr, port: u16, root: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::new(ip_address, port),
            root,
            timeout: Duration::from_secs(1),
            max_retries: 5,
            read_only: false,
            overwrite: false,
            port_range: None,
            max_sessions: 256,
            dally: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_port_range(mut self, port_range: Option<RangeInclusive<u16>>) -> Self {
        self.port_range = port_range;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_dally(mut self, dally: bool) -> Self {
        self.dally = dally;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            DEFAULT_PORT,
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        )
    }
}
