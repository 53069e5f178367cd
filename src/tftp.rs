use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Largest payload carried by a single DATA packet.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode plus block number.
pub const HEADER_SIZE: usize = 4;

/// Largest datagram a peer may legally send us.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

fn malformed<T>(msg: impl Into<String>) -> TftpResult<T> {
    Err(SocketError::PacketParse(msg.into()))
}

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    fn from_wire(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// Maps storage failures onto the error code reported to the peer.
impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (buf[..end].iter().map(|&c| char::from(c)).collect(), end)
}

/// Strings travel as one byte per char; anything outside latin-1 is replaced.
fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend(s.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')));
    out.push(0x00);
}

/// The TFTP opcode carried in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    /// Reads the opcode of a datagram without parsing the rest of it.
    pub fn peek(buf: &[u8]) -> TftpResult<OpCode> {
        if buf.len() < 2 {
            return malformed("Packet too short to carry an opcode");
        }
        let rawcode = u16_from_buffer(&buf[..2]);
        match rawcode {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => malformed(format!("Unknown opcode retrieved: {rawcode}")),
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return malformed("Request does not contain a mode, but it needs to!");
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return malformed("Mode must be terminated with a null byte!");
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return malformed(format!("Unknown file mode: '{raw_mode}'")),
    };

    Ok((path, mode))
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let payload = &buf[HEADER_SIZE..];
    if payload.len() > DATA_BUFFER_SIZE {
        return malformed(format!("Data payload of {} bytes exceeds {DATA_BUFFER_SIZE}", payload.len()));
    }
    Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data: payload.to_vec() })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from_wire(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[HEADER_SIZE..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        let opcode = OpCode::peek(buf)?;
        match opcode {
            OpCode::Rrq | OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                if opcode == OpCode::Rrq {
                    Ok(Packet::ReadReq { path, mode })
                } else {
                    Ok(Packet::WriteReq { path, mode })
                }
            }
            _ if buf.len() < HEADER_SIZE => malformed(format!("{opcode:?} packet too short!")),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) }),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Parses a buffer that must hold a packet of the given kind. A packet of any other kind is
    /// rejected rather than reinterpreted.
    pub fn parse_as(buf: &[u8], expected: OpCode) -> TftpResult<Packet> {
        let found = OpCode::peek(buf)?;
        if found != expected {
            return malformed(format!("Expected a {expected:?} packet, found {found:?}"));
        }
        Packet::parse_from_buf(buf)
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Serializes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_PACKET_SIZE);
        out.extend_from_slice(&self.op_code().to_wire().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                put_string(&mut out, path);
                put_string(&mut out, mode.as_str());
            }
            Packet::Data { block, data } => {
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => out.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                out.extend_from_slice(&code.to_wire().to_be_bytes());
                put_string(&mut out, message);
            }
        }
        out
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_bytes(&packet.to_bytes(), dst).await
    }

    /// Sends an already encoded packet, used to retransmit the exact bytes sent before.
    pub async fn send_bytes(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }

    /// Receives one datagram and parses it. A malformed datagram surfaces as
    /// `SocketError::PacketParse`; the receive buffer is not retained.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let (datagram, src) = self.recv_datagram().await?;
        Ok((Packet::parse_from_buf(&datagram)?, src))
    }

    /// Receives one raw datagram. One byte of slack lets oversized packets fail to parse instead
    /// of being silently truncated into a valid-looking one.
    pub async fn recv_datagram(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..total_written].to_vec(), src))
    }
}
