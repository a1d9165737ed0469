//! Core traits for FerroLift operations
//!
//! [`StorageAdapter`] is the narrow capability surface the pipelines consume. Backends that
//! cannot perform an operation keep the default method, which reports
//! [`Error::Unsupported`] so the caller can fail the task without retrying.

use crate::{Error, FileInfo, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream returned by [`StorageAdapter::open_read`]
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink returned by [`StorageAdapter::open_write`]
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Uniform capability surface over a storage backend
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    /// Short backend name used in error messages
    fn backend(&self) -> &str;

    /// Metadata for a single path; `Error::NotFound` if it does not exist
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Immediate entries of a directory
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let _ = path;
        Err(Error::unsupported("list", self.backend()))
    }

    /// Open a path for streaming reads
    async fn open_read(&self, path: &str) -> Result<ByteReader>;

    /// Open a path for streaming writes, creating parent directories as needed
    async fn open_write(&self, path: &str) -> Result<ByteWriter> {
        let _ = path;
        Err(Error::unsupported("open_write", self.backend()))
    }

    /// Server-side copy within the backend
    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let _ = (source, destination);
        Err(Error::unsupported("copy", self.backend()))
    }

    /// Move or rename within the backend
    async fn rename(&self, source: &str, destination: &str) -> Result<()> {
        let _ = (source, destination);
        Err(Error::unsupported("move", self.backend()))
    }

    /// Delete a path
    async fn delete(&self, path: &str) -> Result<()> {
        let _ = path;
        Err(Error::unsupported("delete", self.backend()))
    }
}
