// Collaborators a session reads from, writes to, and asks for permission.
//
// A session never touches the filesystem directly. It asks a `Store` to open a `DataSource` (for
// a read request) or a `DataSink` (for a write request), and asks an `AccessPolicy` whether the
// peer may do either. `FsStore` serves a directory; `MemoryStore` keeps everything in a shared map.

use crate::tftp;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// A sequential stream of blocks handed out to a reading peer.
#[async_trait]
pub trait DataSource: Send + fmt::Debug {
    /// Returns the next block of at most `tftp::DATA_BUFFER_SIZE` bytes. A shorter block,
    /// including an empty one, is the last.
    async fn read_block(&mut self) -> io::Result<Vec<u8>>;
}

/// Where the payload of a writing peer ends up.
#[async_trait]
pub trait DataSink: Send + fmt::Debug {
    async fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Called once, after the last block was appended.
    async fn finalize(&mut self) -> io::Result<()>;
}

/// Opens sources and sinks by the filename a peer asked for.
#[async_trait]
pub trait Store: Send + Sync {
    async fn open_source(&self, name: &str) -> io::Result<Box<dyn DataSource>>;
    async fn open_sink(&self, name: &str) -> io::Result<Box<dyn DataSink>>;
}

/// Yes/no decision on whether a request may proceed.
pub trait AccessPolicy: Send + Sync {
    fn can_read(&self, name: &str) -> bool;
    fn can_write(&self, name: &str) -> bool;
}

/// Blanket switches for reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub allow_reads: bool,
    pub allow_writes: bool,
}

impl Policy {
    pub fn allow_all() -> Policy {
        Policy { allow_reads: true, allow_writes: true }
    }

    pub fn read_only() -> Policy {
        Policy { allow_reads: true, allow_writes: false }
    }
}

impl AccessPolicy for Policy {
    fn can_read(&self, _name: &str) -> bool {
        self.allow_reads
    }

    fn can_write(&self, _name: &str) -> bool {
        self.allow_writes
    }
}

///////////////////////////////////////////////////////////////
// Filesystem store

/// Serves files from beneath a root directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    overwrite: bool,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>, overwrite: bool) -> FsStore {
        FsStore { root: root.into(), overwrite }
    }

    /// Resolves a requested name below the root. Names that would escape it are refused.
    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(outside_root(name));
        }
        Ok(self.root.join(relative))
    }

    /// Fails unless `path`, with every symlink followed, still lies below the root.
    async fn confine(&self, name: &str, path: &Path) -> io::Result<PathBuf> {
        let root = fs::canonicalize(&self.root).await?;
        let real = fs::canonicalize(path).await?;
        if !real.starts_with(&root) {
            return Err(outside_root(name));
        }
        Ok(real)
    }
}

fn outside_root(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("'{name}' is outside of the served directory"),
    )
}

#[async_trait]
impl Store for FsStore {
    async fn open_source(&self, name: &str) -> io::Result<Box<dyn DataSource>> {
        let path = self.confine(name, &self.resolve(name)?).await?;
        log::info!("Reading from {:?}", path);
        Ok(Box::new(FileSource { f: File::open(path).await? }))
    }

    async fn open_sink(&self, name: &str) -> io::Result<Box<dyn DataSink>> {
        let requested = self.resolve(name)?;
        let (dir, file_name) = match (requested.parent(), requested.file_name()) {
            (Some(dir), Some(file_name)) => (self.confine(name, dir).await?, file_name.to_owned()),
            _ => return Err(outside_root(name)),
        };
        let target = dir.join(&file_name);
        if !self.overwrite && fs::symlink_metadata(&target).await.is_ok() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("'{name}' already exists")));
        }

        // The upload goes to a hidden file next to the target and only takes the target's name
        // once it is complete.
        let partial = dir.join(format!(
            ".{}.{:08x}.part",
            file_name.to_string_lossy(),
            rand::random::<u32>()
        ));
        let f = OpenOptions::new().write(true).create_new(true).open(&partial).await?;
        log::info!("Writing to {:?} via {:?}", target, partial);
        Ok(Box::new(FileSink { f, partial, target, overwrite: self.overwrite, finished: false }))
    }
}

#[derive(Debug)]
pub struct FileSource {
    f: File,
}

#[async_trait]
impl DataSource for FileSource {
    async fn read_block(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
        let mut cursor = 0;

        // A single read may return less than was asked for without being at the end of the file,
        // so keep reading into the rest of the buffer until it is full or the file runs out.
        while cursor < buf.len() {
            match self.f.read(&mut buf[cursor..]).await? {
                0 => break,
                s => cursor += s,
            }
        }
        buf.truncate(cursor);
        Ok(buf)
    }
}

/// Writes into a partial file and moves it onto the target once finalized. A sink dropped
/// before that removes its partial file.
#[derive(Debug)]
pub struct FileSink {
    f: File,
    partial: PathBuf,
    target: PathBuf,
    overwrite: bool,
    finished: bool,
}

#[async_trait]
impl DataSink for FileSink {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.f.write_all(data).await
    }

    async fn finalize(&mut self) -> io::Result<()> {
        self.f.flush().await?;
        self.f.sync_all().await?;

        if self.overwrite {
            fs::rename(&self.partial, &self.target).await?;
        } else {
            // Linking fails if someone else created the target in the meantime.
            fs::hard_link(&self.partial, &self.target).await?;
            fs::remove_file(&self.partial).await?;
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.partial) {
            log::warn!("Unable to remove partial upload {:?}: {}", self.partial, e);
        }
    }
}

///////////////////////////////////////////////////////////////
// In-memory store

/// Keeps files in a map shared between all clones of the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn insert(&self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        lock(&self.files).insert(name.into(), contents.into());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(name).cloned()
    }
}

/// A poisoned map still holds whole files, so keep using it.
fn lock(files: &Mutex<HashMap<String, Vec<u8>>>) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
    files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_source(&self, name: &str) -> io::Result<Box<dyn DataSource>> {
        match self.get(name) {
            Some(contents) => Ok(Box::new(MemorySource { contents, cursor: 0 })),
            None => Err(io::Error::new(io::ErrorKind::NotFound, format!("no file named '{name}'"))),
        }
    }

    async fn open_sink(&self, name: &str) -> io::Result<Box<dyn DataSink>> {
        if lock(&self.files).contains_key(name) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("'{name}' already exists")));
        }
        Ok(Box::new(MemorySink { name: name.to_string(), buf: Vec::new(), files: self.files.clone() }))
    }
}

#[derive(Debug)]
struct MemorySource {
    contents: Vec<u8>,
    cursor: usize,
}

#[async_trait]
impl DataSource for MemorySource {
    async fn read_block(&mut self) -> io::Result<Vec<u8>> {
        let end = usize::min(self.cursor + tftp::DATA_BUFFER_SIZE, self.contents.len());
        let block = self.contents[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(block)
    }
}

/// Buffers the upload and only publishes it once finalized.
#[derive(Debug)]
struct MemorySink {
    name: String,
    buf: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl DataSink for MemorySink {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn finalize(&mut self) -> io::Result<()> {
        lock(&self.files).insert(self.name.clone(), std::mem::take(&mut self.buf));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio_test::{assert_err, assert_ok};

    async fn read_all(source: &mut Box<dyn DataSource>) -> Vec<Vec<u8>> {
        let mut blocks = vec![];
        loop {
            let block = assert_ok!(source.read_block().await);
            let last = block.len() < tftp::DATA_BUFFER_SIZE;
            blocks.push(block);
            if last {
                return blocks;
            }
        }
    }

    #[tokio::test]
    async fn test_fs_open_missing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let store = FsStore::new(tmpdir.path(), false);

        let err = assert_err!(store.open_source("missing.txt").await);
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fs_refuses_escaping_paths() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let store = FsStore::new(tmpdir.path(), false);

        for name in ["../etc/passwd", "a/../../b", ""] {
            let err = assert_err!(store.open_source(name).await);
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        }
    }

    #[tokio::test]
    async fn test_fs_strips_leading_slash() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("boot.img"), b"kernel").unwrap();
        let store = FsStore::new(tmpdir.path(), false);

        let mut source = assert_ok!(store.open_source("/boot.img").await);
        assert_eq!(read_all(&mut source).await, vec![b"kernel".to_vec()]);
    }

    #[tokio::test]
    async fn test_fs_source_blocks_end_with_empty_block_on_exact_multiple() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("exact.bin"), vec![0x42; 1024]).unwrap();
        let store = FsStore::new(tmpdir.path(), false);

        let mut source = assert_ok!(store.open_source("exact.bin").await);
        assert_eq!(read_all(&mut source).await, vec![vec![0x42; 512], vec![0x42; 512], vec![]]);
    }

    #[tokio::test]
    async fn test_fs_sink_respects_overwrite() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("upload.txt");
        std::fs::write(&path, b"old").unwrap();

        let err = assert_err!(FsStore::new(tmpdir.path(), false).open_sink("upload.txt").await);
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let mut sink = assert_ok!(FsStore::new(tmpdir.path(), true).open_sink("upload.txt").await);
        assert_ok!(sink.append(b"new").await);
        assert_ok!(sink.finalize().await);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_fs_sink_publishes_only_when_finalized() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let store = FsStore::new(tmpdir.path(), false);
        let path = tmpdir.path().join("upload.txt");

        let mut sink = assert_ok!(store.open_sink("upload.txt").await);
        assert_ok!(sink.append(b"half of it").await);
        assert!(!path.exists());
        drop(sink);

        // Nothing is left behind, so the name is still free.
        assert_eq!(std::fs::read_dir(tmpdir.path()).unwrap().count(), 0);
        let mut sink = assert_ok!(store.open_sink("upload.txt").await);
        assert_ok!(sink.append(b"all of it").await);
        assert_ok!(sink.finalize().await);
        drop(sink);
        assert_eq!(std::fs::read(&path).unwrap(), b"all of it");
        assert_eq!(std::fs::read_dir(tmpdir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_fs_sink_loses_race_for_name() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let store = FsStore::new(tmpdir.path(), false);

        let mut sink = assert_ok!(store.open_sink("upload.txt").await);
        std::fs::write(tmpdir.path().join("upload.txt"), b"first").unwrap();
        assert_ok!(sink.append(b"second").await);
        let err = assert_err!(sink.finalize().await);
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        drop(sink);

        assert_eq!(std::fs::read(tmpdir.path().join("upload.txt")).unwrap(), b"first");
        assert_eq!(std::fs::read_dir(tmpdir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fs_refuses_symlinks_out_of_root() {
        let outside = TempDir::new("outside").unwrap();
        std::fs::write(outside.path().join("secret"), b"hunter2").unwrap();
        let tmpdir = TempDir::new("scratch").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmpdir.path().join("secret")).unwrap();
        std::os::unix::fs::symlink(outside.path(), tmpdir.path().join("elsewhere")).unwrap();
        let store = FsStore::new(tmpdir.path(), false);

        let err = assert_err!(store.open_source("secret").await);
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = assert_err!(store.open_sink("elsewhere/upload.txt").await);
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let mut sink = assert_ok!(store.open_sink("notes.txt").await);
        assert_ok!(sink.append(&[0x61; 600]).await);
        assert!(store.get("notes.txt").is_none());
        assert_ok!(sink.finalize().await);

        let mut source = assert_ok!(store.open_source("notes.txt").await);
        assert_eq!(read_all(&mut source).await, vec![vec![0x61; 512], vec![0x61; 88]]);

        let err = assert_err!(store.open_sink("notes.txt").await);
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_policies() {
        assert!(Policy::allow_all().can_write("x"));
        assert!(Policy::read_only().can_read("x"));
        assert!(!Policy::read_only().can_write("x"));
    }
}
