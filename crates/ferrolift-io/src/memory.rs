//! In-memory object store adapter
//!
//! Objects live in a shared map keyed by absolute path; directories are implied by key
//! prefixes. The adapter can throttle reads and inject faults, which makes it the backend of
//! choice for exercising retry and cancellation paths.

use async_trait::async_trait;
use bytes::Bytes;
use ferrolift_types::{ByteReader, ByteWriter, Error, FileInfo, Result, StorageAdapter};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Bytes>,
    read_faults: HashMap<String, u32>,
    denied: HashSet<String>,
    read_opens: HashMap<String, u32>,
}

/// In-memory storage adapter
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
    chunk_size: usize,
    read_delay: Duration,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            chunk_size: 64 * 1024,
            read_delay: Duration::ZERO,
        }
    }

    /// Serve reads in `chunk_size` pieces, sleeping `delay` before each piece
    pub fn with_read_throttle(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.read_delay = delay;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::other("memory store lock poisoned"))
    }

    /// Store an object
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) -> Result<()> {
        self.lock()?.objects.insert(path.into(), data.into());
        Ok(())
    }

    /// Fetch an object
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.lock().ok()?.objects.get(path).cloned()
    }

    /// All object paths in order
    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The next `count` reads of `path` fail half-way with a connection reset
    pub fn inject_read_faults(&self, path: impl Into<String>, count: u32) -> Result<()> {
        self.lock()?.read_faults.insert(path.into(), count);
        Ok(())
    }

    /// Reads and writes of `path` fail with permission denied
    pub fn deny(&self, path: impl Into<String>) -> Result<()> {
        self.lock()?.denied.insert(path.into());
        Ok(())
    }

    /// Number of times `path` was opened for reading
    pub fn read_opens(&self, path: &str) -> u32 {
        self.lock()
            .ok()
            .and_then(|state| state.read_opens.get(path).copied())
            .unwrap_or(0)
    }

    fn dir_prefix(path: &str) -> String {
        format!("{}/", path.trim_end_matches('/'))
    }

    fn check_access(state: &MemoryState, path: &str) -> Result<()> {
        if state.denied.contains(path) {
            Err(Error::PermissionDenied {
                path: path.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let state = self.lock()?;
        if let Some(data) = state.objects.get(path) {
            return Ok(FileInfo::file(path, data.len() as u64));
        }
        let prefix = Self::dir_prefix(path);
        if state.objects.keys().any(|key| key.starts_with(&prefix)) {
            Ok(FileInfo::directory(path.trim_end_matches('/')))
        } else {
            Err(Error::not_found(path))
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let state = self.lock()?;
        let prefix = Self::dir_prefix(path);
        let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();

        for (key, data) in state.objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    let dir_path = format!("{}{}", prefix, dir);
                    entries
                        .entry(dir_path.clone())
                        .or_insert_with(|| FileInfo::directory(dir_path));
                }
                None => {
                    entries.insert(key.clone(), FileInfo::file(key.clone(), data.len() as u64));
                }
            }
        }

        if entries.is_empty() && !state.objects.contains_key(path) {
            return Err(Error::not_found(path));
        }
        Ok(entries.into_values().collect())
    }

    async fn open_read(&self, path: &str) -> Result<ByteReader> {
        let mut state = self.lock()?;
        Self::check_access(&state, path)?;
        let data = state
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(path))?;

        *state.read_opens.entry(path.to_string()).or_insert(0) += 1;

        let fail_at = match state.read_faults.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Some(data.len() / 2)
            }
            _ => None,
        };

        Ok(Box::new(MemoryReader {
            data,
            pos: 0,
            chunk_size: self.chunk_size,
            delay: self.read_delay,
            sleep: None,
            fail_at,
        }))
    }

    async fn open_write(&self, path: &str) -> Result<ByteWriter> {
        Self::check_access(&*self.lock()?, path)?;
        Ok(Box::new(MemoryWriter {
            path: path.to_string(),
            buffer: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let mut state = self.lock()?;
        let data = state
            .objects
            .get(source)
            .cloned()
            .ok_or_else(|| Error::not_found(source))?;
        state.objects.insert(destination.to_string(), data);
        Ok(())
    }

    async fn rename(&self, source: &str, destination: &str) -> Result<()> {
        let mut state = self.lock()?;
        let data = state
            .objects
            .remove(source)
            .ok_or_else(|| Error::not_found(source))?;
        state.objects.insert(destination.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.lock()?;
        let prefix = Self::dir_prefix(path);
        let before = state.objects.len();
        state
            .objects
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        if state.objects.len() == before {
            return Err(Error::not_found(path));
        }
        Ok(())
    }
}

struct MemoryReader {
    data: Bytes,
    pos: usize,
    chunk_size: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    fail_at: Option<usize>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.data.len() {
            return Poll::Ready(Ok(()));
        }
        if let Some(fail_at) = this.fail_at {
            if this.pos >= fail_at {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected read fault",
                )));
            }
        }

        if !this.delay.is_zero() {
            let delay = this.delay;
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
        }

        let mut end = (this.pos + this.chunk_size).min(this.data.len());
        if let Some(fail_at) = this.fail_at {
            end = end.min(fail_at);
        }
        let len = (end - this.pos).min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + len]);
        this.pos += len;
        Poll::Ready(Ok(()))
    }
}

struct MemoryWriter {
    path: String,
    buffer: Vec<u8>,
    state: Arc<Mutex<MemoryState>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    // Objects become visible only once the upload is completed
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let data = Bytes::from(std::mem::take(&mut this.buffer));
        match this.state.lock() {
            Ok(mut state) => {
                state.objects.insert(this.path.clone(), data);
                Poll::Ready(Ok(()))
            }
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "memory store lock poisoned",
            ))),
        }
    }
}
