//! Local filesystem adapter

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrolift_types::{ByteReader, ByteWriter, Error, FileInfo, Result, StorageAdapter};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Storage adapter over the local filesystem, optionally confined to a root directory
#[derive(Debug, Clone, Default)]
pub struct LocalFsAdapter {
    root: Option<PathBuf>,
}

impl LocalFsAdapter {
    /// Adapter resolving URI paths as absolute local paths
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter resolving URI paths below `root`
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    fn info(path: &str, metadata: &std::fs::Metadata) -> FileInfo {
        let info = if metadata.is_dir() {
            FileInfo::directory(path)
        } else {
            FileInfo::file(path, metadata.len())
        };
        match metadata.modified() {
            Ok(modified) => info.with_modified(DateTime::<Utc>::from(modified)),
            Err(_) => info,
        }
    }

    async fn ensure_parent(path: &Path, display: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(&e, display))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for LocalFsAdapter {
    fn backend(&self) -> &str {
        "local"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let metadata = fs::metadata(self.resolve(path))
            .await
            .map_err(|e| Error::from_io(&e, path))?;
        Ok(Self::info(path, &metadata))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut entries = fs::read_dir(self.resolve(path))
            .await
            .map_err(|e| Error::from_io(&e, path))?;

        let base = path.trim_end_matches('/');
        let mut listed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::from_io(&e, path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = format!("{}/{}", base, name);
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| Error::from_io(&e, child.as_str()))?;
            listed.push(Self::info(&child, &metadata));
        }

        listed.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Listed {} entries under {}", listed.len(), path);
        Ok(listed)
    }

    async fn open_read(&self, path: &str) -> Result<ByteReader> {
        let file = fs::File::open(self.resolve(path))
            .await
            .map_err(|e| Error::from_io(&e, path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<ByteWriter> {
        let local = self.resolve(path);
        Self::ensure_parent(&local, path).await?;
        let file = fs::File::create(&local)
            .await
            .map_err(|e| Error::from_io(&e, path))?;
        Ok(Box::new(file))
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let target = self.resolve(destination);
        Self::ensure_parent(&target, destination).await?;
        fs::copy(self.resolve(source), target)
            .await
            .map_err(|e| Error::from_io(&e, source))?;
        Ok(())
    }

    async fn rename(&self, source: &str, destination: &str) -> Result<()> {
        let target = self.resolve(destination);
        Self::ensure_parent(&target, destination).await?;
        fs::rename(self.resolve(source), target)
            .await
            .map_err(|e| Error::from_io(&e, source))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let local = self.resolve(path);
        let metadata = fs::metadata(&local)
            .await
            .map_err(|e| Error::from_io(&e, path))?;
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_file(&local).await
        };
        removed.map_err(|e| Error::from_io(&e, path))
    }
}
