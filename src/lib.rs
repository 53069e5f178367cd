//! A TFTP server (RFC 1350).
//!
//! A transfer begins with a read (RRQ) or write (WRQ) request sent to the well-known port. The
//! server answers from a fresh port of its own; that port and the client's port identify the
//! transfer (the TIDs) for as long as it lasts. The file then moves in 512-byte DATA blocks, each
//! of which must be acknowledged before the next one is sent. A block shorter than 512 bytes,
//! possibly empty, ends the transfer.
//!
//! UDP may lose, duplicate or reorder any of these packets. Whoever is waiting retransmits its last
//! packet when a timer runs out, and both sides treat repeated packets as harmless. Errors end the
//! transfer with an ERROR packet that is never acknowledged or retransmitted.
//!
//! - [`tftp`]: packet encoding/decoding and the UDP socket wrapper.
//! - [`processor`]: the block-sequencing state machine for reads and writes.
//! - [`session`]: one transfer with one peer: its socket, timer and retransmissions.
//! - [`dispatcher`]: the well-known port and the table of running sessions.
//! - [`storage`]: where data comes from and goes to, and who may do what.
//! - [`netascii`]: line ending translation for "netascii" mode.
//! - [`config`]: server settings.

pub mod config;
pub mod dispatcher;
pub mod netascii;
pub mod processor;
pub mod session;
pub mod storage;
pub mod tftp;
