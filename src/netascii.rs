// Netascii line discipline for transfers requested in "netascii" mode.
//
// On the wire a line ends in CR LF and a bare CR is sent as CR NUL. Locally lines end in LF.
// Translation changes the length of the data, so the encoder re-blocks its output and the decoder
// has to remember a CR that ended the previous block.

use crate::storage::{DataSink, DataSource};
use crate::tftp;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::io;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0x00;

/// Translates a local source into netascii blocks.
#[derive(Debug)]
pub struct NetasciiSource {
    inner: Box<dyn DataSource>,
    pending: VecDeque<u8>,
    exhausted: bool,
}

impl NetasciiSource {
    pub fn new(inner: Box<dyn DataSource>) -> NetasciiSource {
        NetasciiSource { inner, pending: VecDeque::new(), exhausted: false }
    }
}

#[async_trait]
impl DataSource for NetasciiSource {
    async fn read_block(&mut self) -> io::Result<Vec<u8>> {
        while self.pending.len() < tftp::DATA_BUFFER_SIZE && !self.exhausted {
            let raw = self.inner.read_block().await?;
            self.exhausted = raw.len() < tftp::DATA_BUFFER_SIZE;
            for c in raw {
                match c {
                    LF => self.pending.extend([CR, LF]),
                    CR => self.pending.extend([CR, NUL]),
                    _ => self.pending.push_back(c),
                }
            }
        }

        let take = usize::min(self.pending.len(), tftp::DATA_BUFFER_SIZE);
        Ok(self.pending.drain(..take).collect())
    }
}

/// Translates netascii blocks back into local line endings before they reach the sink.
#[derive(Debug)]
pub struct NetasciiSink {
    inner: Box<dyn DataSink>,
    /// The previous block ended in a CR whose meaning depends on the next byte.
    pending_cr: bool,
}

impl NetasciiSink {
    pub fn new(inner: Box<dyn DataSink>) -> NetasciiSink {
        NetasciiSink { inner, pending_cr: false }
    }
}

#[async_trait]
impl DataSink for NetasciiSink {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = Vec::with_capacity(data.len() + 1);
        for &c in data {
            if self.pending_cr {
                self.pending_cr = false;
                match c {
                    LF => out.push(LF),
                    NUL => out.push(CR),
                    CR => {
                        out.push(CR);
                        self.pending_cr = true;
                    }
                    _ => out.extend([CR, c]),
                }
            } else if c == CR {
                self.pending_cr = true;
            } else {
                out.push(c);
            }
        }
        self.inner.append(&out).await
    }

    async fn finalize(&mut self) -> io::Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.inner.append(&[CR]).await?;
        }
        self.inner.finalize().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Store};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_encodes_line_endings() {
        let store = MemoryStore::new();
        store.insert("motd", b"hi\nthere\rend".to_vec());

        let mut source = NetasciiSource::new(assert_ok!(store.open_source("motd").await));
        assert_eq!(assert_ok!(source.read_block().await), b"hi\r\nthere\r\0end".to_vec());
    }

    #[tokio::test]
    async fn test_encoder_reblocks_expanded_output() {
        let store = MemoryStore::new();
        // 400 newlines expand to 800 bytes: one full block and one short one.
        store.insert("lines", vec![LF; 400]);

        let mut source = NetasciiSource::new(assert_ok!(store.open_source("lines").await));
        let first = assert_ok!(source.read_block().await);
        let second = assert_ok!(source.read_block().await);
        assert_eq!(first.len(), 512);
        assert_eq!(second.len(), 288);
        assert!(first.chunks(2).all(|pair| pair == [CR, LF]));
    }

    #[tokio::test]
    async fn test_encoder_ends_with_empty_block_on_exact_multiple() {
        let store = MemoryStore::new();
        store.insert("lines", vec![LF; 256]);

        let mut source = NetasciiSource::new(assert_ok!(store.open_source("lines").await));
        assert_eq!(assert_ok!(source.read_block().await).len(), 512);
        assert_eq!(assert_ok!(source.read_block().await), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_decodes_across_block_boundaries() {
        let store = MemoryStore::new();
        let mut sink = NetasciiSink::new(assert_ok!(store.open_sink("upload").await));

        assert_ok!(sink.append(b"one\r").await);
        assert_ok!(sink.append(b"\ntwo\r").await);
        assert_ok!(sink.append(b"\0three\r").await);
        assert_ok!(sink.finalize().await);

        assert_eq!(store.get("upload").unwrap(), b"one\ntwo\rthree\r".to_vec());
    }
}
