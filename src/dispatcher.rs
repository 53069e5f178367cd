// The dispatcher owns the socket on the well-known port and the table of running sessions.
//
// New RRQ/WRQ datagrams start a session task keyed by the sender's address. Anything else that
// reaches the well-known port is passed to the sender's session, or answered with UnknownTid if
// there is none. Every session task reports back when it ends and its entry is removed. The
// table lives on the dispatcher's own task, so inserting, removing and looking up never race.

use crate::config::Config;
use crate::session::Session;
use crate::storage::{AccessPolicy, Store};
use crate::tftp;
use std::collections::HashMap;
use std::future::{self, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Datagrams queued for a session before further ones are dropped.
const INBOX_DEPTH: usize = 16;

struct SessionHandle {
    inbox: mpsc::Sender<Vec<u8>>,
}

enum Event {
    Shutdown,
    Finished(SocketAddr),
    Datagram(tftp::TftpResult<(Vec<u8>, SocketAddr)>),
}

pub struct Dispatcher {
    sock: tftp::TftpSocket,
    config: Arc<Config>,
    store: Arc<dyn Store>,
    policy: Arc<dyn AccessPolicy>,
    sessions: HashMap<SocketAddr, SessionHandle>,
    finished_tx: mpsc::UnboundedSender<SocketAddr>,
    finished_rx: mpsc::UnboundedReceiver<SocketAddr>,
}

impl Dispatcher {
    pub fn bind(config: Config, store: Arc<dyn Store>, policy: Arc<dyn AccessPolicy>) -> tftp::TftpResult<Dispatcher> {
        let sock = tftp::TftpSocket::bind(config.bind_addr)?;
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Ok(Dispatcher {
            sock,
            config: Arc::new(config),
            store,
            policy,
            sessions: HashMap::new(),
            finished_tx,
            finished_rx,
        })
    }

    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Serves requests forever.
    pub async fn run(&mut self) {
        self.run_until(future::pending()).await
    }

    /// Serves requests until `shutdown` resolves. Sessions already running are left to finish.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => Event::Shutdown,
                Some(peer) = self.finished_rx.recv() => Event::Finished(peer),
                received = self.sock.recv_datagram() => Event::Datagram(received),
            };

            match event {
                Event::Shutdown => {
                    while let Ok(peer) = self.finished_rx.try_recv() {
                        self.sessions.remove(&peer);
                    }
                    log::info!("Dispatcher stopping with {} sessions still running", self.sessions.len());
                    return;
                }
                Event::Finished(peer) => {
                    self.sessions.remove(&peer);
                    log::debug!("Session with {} removed, {} active", peer, self.sessions.len());
                }
                Event::Datagram(Ok((datagram, src))) => self.dispatch(&datagram, src).await,
                Event::Datagram(Err(e)) => log::warn!("Error receiving packet: {}", e),
            }
        }
    }

    async fn dispatch(&mut self, datagram: &[u8], src: SocketAddr) {
        let opcode = match tftp::OpCode::peek(datagram) {
            Ok(opcode) => opcode,
            Err(e) => {
                log::debug!("Dropping datagram from {}: {}", src, e);
                return;
            }
        };

        match opcode {
            tftp::OpCode::Rrq | tftp::OpCode::Wrq => self.accept(datagram, src).await,
            _ => match self.sessions.get(&src) {
                Some(handle) => {
                    if let Err(e) = handle.inbox.try_send(datagram.to_vec()) {
                        log::debug!("Dropping datagram for session with {}: {}", src, e);
                    }
                }
                // Answering an error with an error could go on forever.
                None if opcode == tftp::OpCode::Error => {
                    log::debug!("Ignoring error packet from unknown peer {}", src);
                }
                None => {
                    log::warn!("Got {:?} packet from {}, which has no transfer", opcode, src);
                    self.send_error(src, tftp::ErrorCode::UnknownTid, "No transfer with this client".to_string())
                        .await;
                }
            },
        }
    }

    async fn accept(&mut self, datagram: &[u8], src: SocketAddr) {
        if self.sessions.contains_key(&src) {
            log::debug!("Ignoring duplicate request from {}", src);
            return;
        }

        let request = match tftp::Packet::parse_from_buf(datagram) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Dropping request from {}: {}", src, e);
                return;
            }
        };

        if self.sessions.len() >= self.config.max_sessions {
            log::warn!("Refusing request from {}: {} sessions active", src, self.sessions.len());
            self.send_error(src, tftp::ErrorCode::Undefined, "server busy".to_string()).await;
            return;
        }

        let (inbox, rx) = mpsc::channel(INBOX_DEPTH);
        self.sessions.insert(src, SessionHandle { inbox });

        let config = self.config.clone();
        let store = self.store.clone();
        let policy = self.policy.clone();
        let finished = self.finished_tx.clone();
        tokio::spawn(async move {
            match Session::open(&config, store.as_ref(), policy.as_ref(), &request, src, rx).await {
                Ok(session) => {
                    let outcome = session.handle().await;
                    log::info!("Session with {} ended: {:?}", src, outcome);
                }
                Err(e) => log::warn!("Could not serve request from {}: {}", src, e),
            }
            let _ = finished.send(src);
        });
    }

    async fn send_error(&self, dst: SocketAddr, code: tftp::ErrorCode, message: String) {
        // Error packet is sent as a courtesy, we don't care how it goes.
        let _ = self.sock.send(&tftp::Packet::Error { code, message }, dst).await;
    }
}
