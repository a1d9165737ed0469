//! Storage system registry
//!
//! Maps system identifiers to adapters and records whether each system is enabled.

use crate::uri::TransferUri;
use ferrolift_types::{Error, Result, StorageAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct SystemEntry {
    adapter: Arc<dyn StorageAdapter>,
    enabled: bool,
}

/// Registry of storage adapters keyed by system id
#[derive(Debug, Clone, Default)]
pub struct StorageRegistry {
    systems: Arc<RwLock<HashMap<String, SystemEntry>>>,
}

impl StorageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an enabled system
    pub async fn register(&self, system: impl Into<String>, adapter: Arc<dyn StorageAdapter>) {
        let system = system.into();
        info!("Registering storage system '{}' ({})", system, adapter.backend());
        self.systems.write().await.insert(
            system,
            SystemEntry {
                adapter,
                enabled: true,
            },
        );
    }

    /// Enable or disable a registered system
    pub async fn set_enabled(&self, system: &str, enabled: bool) -> Result<()> {
        let mut systems = self.systems.write().await;
        let entry = systems.get_mut(system).ok_or_else(|| Error::SystemNotFound {
            system: system.to_string(),
        })?;
        entry.enabled = enabled;
        debug!("Storage system '{}' enabled={}", system, enabled);
        Ok(())
    }

    /// Resolve the adapter for a URI
    pub async fn resolve(&self, uri: &TransferUri) -> Result<Arc<dyn StorageAdapter>> {
        self.resolve_system(uri.system()).await
    }

    /// Resolve the adapter for a system id
    pub async fn resolve_system(&self, system: &str) -> Result<Arc<dyn StorageAdapter>> {
        let systems = self.systems.read().await;
        match systems.get(system) {
            Some(entry) if entry.enabled => Ok(Arc::clone(&entry.adapter)),
            Some(_) => Err(Error::SystemDisabled {
                system: system.to_string(),
            }),
            None => Err(Error::SystemNotFound {
                system: system.to_string(),
            }),
        }
    }

    /// Registered system ids
    pub async fn systems(&self) -> Vec<String> {
        let mut names: Vec<String> = self.systems.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;
    use ferrolift_types::ErrorKind;

    #[tokio::test]
    async fn test_resolve_registered_and_disabled() {
        let registry = StorageRegistry::new();
        registry
            .register("archive", Arc::new(MemoryAdapter::new()))
            .await;

        let uri = TransferUri::parse("mem://archive/a").unwrap();
        assert!(registry.resolve(&uri).await.is_ok());

        registry.set_enabled("archive", false).await.unwrap();
        let error = registry.resolve(&uri).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Unavailable);

        let missing = TransferUri::parse("mem://nowhere/a").unwrap();
        let error = registry.resolve(&missing).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        assert_eq!(registry.systems().await, vec!["archive".to_string()]);
    }
}
