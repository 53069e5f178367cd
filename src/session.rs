// A session serves one read or write request from one peer.
//
// The dispatcher hands a fresh request to `Session::open`, which binds an ephemeral socket (our
// TID), checks the request against the access policy and the store, and either answers with an
// error or returns a ready session. `Session::handle` then alternates between sending and waiting:
//
// 1. Whatever the processor wants sent is sent and its exact bytes are kept.
// 2. We wait for the peer until the retransmission deadline. Packets from any address other than
//    the peer's are answered with an UnknownTid error, unless they are errors themselves, and
//    otherwise ignored. Malformed datagrams are dropped. Packets the peer sent to the well-known
//    port arrive through the inbox.
// 3. On a deadline the kept bytes are sent again, until the retry budget runs out and the peer is
//    presumed gone.
//
// Only the task running `handle` touches the session, so a timer expiry and an incoming packet
// are never processed at the same time, and once `handle` returns nothing fires anymore.

use crate::config::Config;
use crate::netascii::{NetasciiSink, NetasciiSource};
use crate::processor::{PacketProcessor, ResultAction};
use crate::storage::{AccessPolicy, DataSink, DataSource, Store};
use crate::tftp;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

const BIND_ATTEMPTS: usize = 32;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The last block went through.
    Completed,
    /// The peer sent an error packet.
    PeerError,
    /// We sent an error packet and gave up.
    Terminated,
    /// The peer stopped answering.
    TimedOut,
    /// Our socket failed.
    TransportFailed,
}

/// One transfer with one peer.
pub struct Session {
    /// The session's own socket; its port is our TID.
    sock: tftp::TftpSocket,

    /// The peer, fixed by the address the request came from.
    dst: SocketAddr,

    processor: PacketProcessor,

    /// Datagrams from the peer that reached the dispatcher's socket instead of ours.
    inbox: mpsc::Receiver<Vec<u8>>,

    timeout: Duration,
    max_retries: u32,
    dally: bool,

    /// Exact bytes of the last packet sent, for retransmission.
    last_sent: Vec<u8>,
    retries: u32,
}

enum Inbound {
    Socket(tftp::TftpResult<(tftp::Packet, SocketAddr)>),
    Forwarded(Vec<u8>),
}

/// Binds the session socket, on a random port of the range if one is configured.
fn bind_session_socket(ip: IpAddr, port_range: Option<&RangeInclusive<u16>>) -> tftp::TftpResult<tftp::TftpSocket> {
    let range = match port_range {
        Some(range) => range.clone(),
        None => return tftp::TftpSocket::bind((ip, 0).into()),
    };
    if range.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "session port range is empty").into());
    }

    let mut rng = rand::thread_rng();
    let mut attempt = 1;
    loop {
        match tftp::TftpSocket::bind((ip, rng.gen_range(range.clone())).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) if attempt < BIND_ATTEMPTS => log::warn!("Couldn't bind socket: {}", e),
            Err(e) => return Err(e),
        }
        attempt += 1;
    }
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

/// Tells the peer why its request is refused and turns that into the matching error.
async fn refuse<T>(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) -> Result<T, ServerConnectionError> {
    send_error_packet(sock, dst, code, message.clone()).await;
    Err(ServerConnectionError::Refused(message))
}

impl Session {
    pub async fn open(
        config: &Config,
        store: &dyn Store,
        policy: &dyn AccessPolicy,
        initial_request: &tftp::Packet,
        src: SocketAddr,
        inbox: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Session, ServerConnectionError> {
        let (path, mode) = match initial_request {
            tftp::Packet::ReadReq { path, mode } | tftp::Packet::WriteReq { path, mode } => (path, *mode),
            _ => {
                return Err(ServerConnectionError::BadRequest(
                    "Only read and write requests are valid initial requests.".to_string(),
                ))
            }
        };

        let sock = bind_session_socket(config.bind_addr.ip(), config.port_range.as_ref())?;
        log::debug!("Session for {} bound to {:?}", src, sock.local_addr());

        if mode == tftp::FileMode::Mail {
            return refuse(&sock, src, tftp::ErrorCode::Undefined, "mail mode is not supported".to_string()).await;
        }

        let processor = if let tftp::Packet::ReadReq { .. } = initial_request {
            if !policy.can_read(path) {
                return refuse(&sock, src, tftp::ErrorCode::AccessViolation, format!("Reading '{path}' is not allowed")).await;
            }
            let source = match store.open_source(path).await {
                Ok(source) => source,
                Err(e) => {
                    send_error_packet(&sock, src, e.kind().into(), e.to_string()).await;
                    return Err(e.into());
                }
            };
            let source: Box<dyn DataSource> = match mode {
                tftp::FileMode::NetAscii => Box::new(NetasciiSource::new(source)),
                _ => source,
            };
            log::info!("{} reading '{}' ({})", src, path, mode.as_str());
            PacketProcessor::for_reading(source)
        } else {
            if !policy.can_write(path) {
                return refuse(&sock, src, tftp::ErrorCode::AccessViolation, format!("Writing '{path}' is not allowed")).await;
            }
            let sink = match store.open_sink(path).await {
                Ok(sink) => sink,
                Err(e) => {
                    send_error_packet(&sock, src, e.kind().into(), e.to_string()).await;
                    return Err(e.into());
                }
            };
            let sink: Box<dyn DataSink> = match mode {
                tftp::FileMode::NetAscii => Box::new(NetasciiSink::new(sink)),
                _ => sink,
            };
            log::info!("{} writing '{}' ({})", src, path, mode.as_str());
            PacketProcessor::for_writing(sink)
        };

        Ok(Session {
            sock,
            dst: src,
            processor,
            inbox,
            timeout: config.timeout,
            max_retries: config.max_retries,
            dally: config.dally,
            last_sent: Vec::new(),
            retries: 0,
        })
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(mut self) -> Outcome {
        let mut action = self.processor.first_packet().await;
        let mut deadline = self.deadline();
        let mut lingering = false;

        loop {
            match action {
                ResultAction::SendPacketAndAwait(packet) => {
                    if let Err(e) = self.transmit(&packet).await {
                        log::warn!("Unable to send packet to {}: {}", self.dst, e);
                        return Outcome::TransportFailed;
                    }
                    self.retries = 0;
                    deadline = self.deadline();
                }
                ResultAction::SendPacketAndLinger(packet) => {
                    if let Err(e) = self.transmit(&packet).await {
                        log::warn!("Unable to send final packet to {}: {}", self.dst, e);
                        return Outcome::TransportFailed;
                    }
                    log::info!("Transfer with {} complete", self.dst);
                    if !self.dally {
                        return Outcome::Completed;
                    }
                    lingering = true;
                    deadline = self.deadline();
                }
                ResultAction::ResendLast => {
                    if let Err(e) = self.sock.send_bytes(&self.last_sent, self.dst).await {
                        log::warn!("Unable to resend packet to {}: {}", self.dst, e);
                        return Outcome::TransportFailed;
                    }
                }
                ResultAction::RetryRecv => {}
                ResultAction::CloseConnection(None) => {
                    log::info!("Transfer with {} complete", self.dst);
                    return Outcome::Completed;
                }
                ResultAction::CloseConnection(Some(msg)) => {
                    log::warn!("Closing connection with {}: {}", self.dst, msg);
                    return Outcome::PeerError;
                }
                ResultAction::TerminateWithPacket(packet) => {
                    log::warn!("Terminating request from {} with {:?}", self.dst, packet);
                    let _ = self.sock.send(&packet, self.dst).await;
                    return Outcome::Terminated;
                }
            }

            action = match self.next_packet(deadline).await {
                Some(packet) => {
                    log::debug!("Got packet from {}: {:?}", self.dst, packet.op_code());
                    self.processor.process_packet(&packet).await
                }
                None if lingering => return Outcome::Completed,
                None => {
                    self.retries += 1;
                    if self.retries > self.max_retries {
                        log::warn!("{} stopped answering, abandoning transfer", self.dst);
                        return Outcome::TimedOut;
                    }
                    log::info!("Timed out, retransmitting to {} ({}/{})", self.dst, self.retries, self.max_retries);
                    deadline = self.deadline();
                    ResultAction::ResendLast
                }
            };
        }
    }

    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout).unwrap_or_else(|| now + FAR_FUTURE)
    }

    async fn transmit(&mut self, packet: &tftp::Packet) -> tftp::TftpResult<()> {
        self.last_sent = packet.to_bytes();
        self.sock.send_bytes(&self.last_sent, self.dst).await
    }

    /// Waits for the next well-formed packet from the peer, or `None` once the deadline passes.
    async fn next_packet(&mut self, deadline: Instant) -> Option<tftp::Packet> {
        loop {
            let inbound = tokio::select! {
                _ = sleep_until(deadline) => return None,
                received = self.sock.recv() => Inbound::Socket(received),
                Some(datagram) = self.inbox.recv() => Inbound::Forwarded(datagram),
            };

            match inbound {
                Inbound::Socket(Ok((packet, src))) if src == self.dst => return Some(packet),
                Inbound::Socket(Ok((tftp::Packet::Error { code, message }, src))) => {
                    log::debug!("Ignoring error from {}: {:?} '{}'", src, code, message);
                }
                Inbound::Socket(Ok((_, src))) => {
                    log::warn!("Got packet from {} on the session with {}", src, self.dst);
                    send_error_packet(
                        &self.sock,
                        src,
                        tftp::ErrorCode::UnknownTid,
                        "This port belongs to a transfer with another client.".to_string(),
                    )
                    .await;
                }
                Inbound::Socket(Err(tftp::SocketError::PacketParse(msg))) => {
                    log::debug!("Dropping malformed packet: {}", msg);
                }
                Inbound::Socket(Err(e)) => log::warn!("Error receiving packet: {}", e),
                Inbound::Forwarded(datagram) => match tftp::Packet::parse_from_buf(&datagram) {
                    Ok(packet) => return Some(packet),
                    Err(e) => log::debug!("Dropping malformed packet: {}", e),
                },
            }
        }
    }
}

/// Why a request did not turn into a session.
#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Refused(String),
    Socket(tftp::SocketError),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Refused(msg) => write!(f, "Request refused: {}", msg),
            Self::Socket(e) => write!(f, "Socket error: {}", e),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<tftp::SocketError> for ServerConnectionError {
    fn from(e: tftp::SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
