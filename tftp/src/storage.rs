//! File-system collaborator: sequential block readers and writers.
//!
//! Sessions never touch `std::fs` directly.  They go through [`FileStore`],
//! which hands out a [`BlockReader`] for outbound transfers and a
//! [`BlockWriter`] for inbound ones.  Two stores ship with the crate:
//!
//! - [`LocalStore`] — files below a root directory, with an optional byte
//!   quota that drives disk-full reporting.
//! - [`MemoryStore`] — an in-process map, handy for tests and embedding.
//!
//! A reader reports the last block only on a short read, so a file whose
//! size is an exact multiple of [`BLOCK_SIZE`] ends with an empty block.
//! A writer publishes nothing until [`BlockWriter::finish`]: an aborted
//! transfer leaves any existing file of that name untouched.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::packet::{ErrorCode, BLOCK_SIZE};

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

/// Distinguishes concurrent staging files within one process.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl StorageError {
    /// The wire error code a session reports for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::FileNotFound,
            StorageError::AccessDenied(_) => ErrorCode::AccessViolation,
            StorageError::DiskFull(_) => ErrorCode::DiskFull,
            StorageError::Io(_) => ErrorCode::NotDefined,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::AccessDenied(err.to_string()),
            _ if err.raw_os_error() == Some(ENOSPC) => StorageError::DiskFull(err.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

/// Sequential reader handing out one block per call.
pub trait BlockReader: Send {
    /// Next block of at most [`BLOCK_SIZE`] bytes and whether it is the last.
    fn read_block(&mut self) -> Result<(Vec<u8>, bool), StorageError>;
}

/// Sequential writer consuming one block per call.
pub trait BlockWriter: Send {
    fn write_block(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Flush and close after the terminal block.
    fn finish(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard whatever was written so far.
    fn abort(self: Box<Self>);
}

/// The file-system abstraction a session is handed.
pub trait FileStore: Send + Sync {
    fn open_read(&self, name: &str) -> Result<Box<dyn BlockReader>, StorageError>;
    fn open_write(&self, name: &str) -> Result<Box<dyn BlockWriter>, StorageError>;
    fn exists(&self, name: &str) -> bool;
    /// Remaining writable bytes, `None` when unbounded or unknown.
    fn free_space(&self) -> Option<u64>;
}

/// Reject names that could escape the store's namespace.
fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::AccessDenied("empty filename".into()));
    }
    let escapes = Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(StorageError::AccessDenied(format!(
            "{name:?} is outside the served directory"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

/// Files below `root`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    quota: Option<u64>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota: None,
        }
    }

    /// Cap the total size of files below the root.
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn used_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| match entry.metadata() {
                    Ok(meta) if meta.is_dir() => walk(&entry.path()),
                    Ok(meta) => meta.len(),
                    Err(_) => 0,
                })
                .sum()
        }
        walk(&self.root)
    }
}

impl FileStore for LocalStore {
    fn open_read(&self, name: &str) -> Result<Box<dyn BlockReader>, StorageError> {
        let path = self.resolve(name)?;
        if path.is_dir() {
            return Err(StorageError::AccessDenied(format!("{name:?} is a directory")));
        }
        let file = File::open(&path)?;
        Ok(Box::new(LocalReader { file }))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn BlockWriter>, StorageError> {
        let path = self.resolve(name)?;
        if path.is_dir() {
            return Err(StorageError::AccessDenied(format!("{name:?} is a directory")));
        }
        let remaining = self.free_space();
        let staging = staging_path(&path);
        let file = File::create(&staging)?;
        Ok(Box::new(LocalWriter {
            out: BufWriter::new(file),
            staging,
            path,
            remaining,
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn free_space(&self) -> Option<u64> {
        self.quota.map(|q| q.saturating_sub(self.used_bytes()))
    }
}

/// Hidden sibling of `target` that receives the data until `finish`.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{name}.{}-{seq}.part", std::process::id()))
}

struct LocalReader {
    file: File,
}

impl BlockReader for LocalReader {
    fn read_block(&mut self) -> Result<(Vec<u8>, bool), StorageError> {
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        (&mut self.file)
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut block)?;
        let last = block.len() < BLOCK_SIZE;
        Ok((block, last))
    }
}

struct LocalWriter {
    out: BufWriter<File>,
    staging: PathBuf,
    path: PathBuf,
    remaining: Option<u64>,
}

impl BlockWriter for LocalWriter {
    fn write_block(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if let Some(remaining) = self.remaining.as_mut() {
            let len = data.len() as u64;
            if len > *remaining {
                return Err(StorageError::DiskFull(format!(
                    "quota exhausted writing {}",
                    self.path.display()
                )));
            }
            *remaining -= len;
        }
        self.out.write_all(data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), StorageError> {
        let LocalWriter {
            out, staging, path, ..
        } = *self;
        let committed = out
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all())
            .and_then(|()| fs::rename(&staging, &path));
        if let Err(e) = committed {
            discard(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let LocalWriter { out, staging, .. } = *self;
        drop(out);
        discard(&staging);
    }
}

fn discard(staging: &Path) {
    if let Err(e) = fs::remove_file(staging) {
        log::warn!("[storage] could not remove partial {}: {e}", staging.display());
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    protected: HashSet<String>,
    quota: Option<u64>,
}

impl MemoryInner {
    fn used_bytes(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }
}

/// Thread-safe in-memory file store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(self, bytes: u64) -> Self {
        self.lock().quota = Some(bytes);
        self
    }

    pub fn insert(&self, name: &str, contents: impl Into<Vec<u8>>) {
        self.lock().files.insert(name.to_string(), contents.into());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(name).cloned()
    }

    /// Make every open of `name` fail with an access violation.
    pub fn protect(&self, name: &str) {
        self.lock().protected.insert(name.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_access(&self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        if self.lock().protected.contains(name) {
            return Err(StorageError::AccessDenied(format!("{name:?} is protected")));
        }
        Ok(())
    }
}

impl FileStore for MemoryStore {
    fn open_read(&self, name: &str) -> Result<Box<dyn BlockReader>, StorageError> {
        self.check_access(name)?;
        let data = self
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        Ok(Box::new(MemoryReader { data, offset: 0 }))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn BlockWriter>, StorageError> {
        self.check_access(name)?;
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            name: name.to_string(),
            buffer: Vec::new(),
            remaining: self.free_space(),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.lock().files.contains_key(name)
    }

    fn free_space(&self) -> Option<u64> {
        let inner = self.lock();
        inner.quota.map(|q| q.saturating_sub(inner.used_bytes()))
    }
}

struct MemoryReader {
    data: Vec<u8>,
    offset: usize,
}

impl BlockReader for MemoryReader {
    fn read_block(&mut self) -> Result<(Vec<u8>, bool), StorageError> {
        let end = (self.offset + BLOCK_SIZE).min(self.data.len());
        let block = self.data[self.offset..end].to_vec();
        self.offset = end;
        let last = block.len() < BLOCK_SIZE;
        Ok((block, last))
    }
}

struct MemoryWriter {
    store: MemoryStore,
    name: String,
    buffer: Vec<u8>,
    remaining: Option<u64>,
}

impl BlockWriter for MemoryWriter {
    fn write_block(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if let Some(remaining) = self.remaining.as_mut() {
            let len = data.len() as u64;
            if len > *remaining {
                return Err(StorageError::DiskFull(format!(
                    "quota exhausted writing {}",
                    self.name
                )));
            }
            *remaining -= len;
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryWriter {
            store,
            name,
            buffer,
            ..
        } = *self;
        store.insert(&name, buffer);
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
