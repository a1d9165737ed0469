//! Pull-only adapter wrapper
//!
//! Models sources such as plain HTTP endpoints that can be fetched but not listed or
//! written: only `stat` and `open_read` reach the wrapped adapter.

use async_trait::async_trait;
use ferrolift_types::{ByteReader, FileInfo, Result, StorageAdapter};
use std::sync::Arc;

/// Exposes only `stat` and `open_read` of the wrapped adapter
#[derive(Debug, Clone)]
pub struct ReadOnlyAdapter {
    inner: Arc<dyn StorageAdapter>,
    backend: String,
}

impl ReadOnlyAdapter {
    /// Wrap `inner`, reporting `backend` in unsupported-operation errors
    pub fn new(inner: Arc<dyn StorageAdapter>, backend: impl Into<String>) -> Self {
        Self {
            inner,
            backend: backend.into(),
        }
    }
}

#[async_trait]
impl StorageAdapter for ReadOnlyAdapter {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.inner.stat(path).await
    }

    async fn open_read(&self, path: &str) -> Result<ByteReader> {
        self.inner.open_read(path).await
    }
}
