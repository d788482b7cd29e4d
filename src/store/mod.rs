pub mod disk;
pub mod memory;

use crate::core::cache::{KeyValueCollection, Store};
use disk::DiskCollection;
use fjall::{Keyspace, PartitionCreateOptions};
use memory::MemoryCollection;
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, warn};

/// A thread-safe key-value store that can hold multiple collections.
pub struct KeyValueStore {
    collections: RwLock<HashMap<String, Arc<dyn KeyValueCollection>>>,
    keyspace: Option<Keyspace>,
}

impl KeyValueStore {
    /// Store with memory-only collections.
    pub fn in_memory() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            keyspace: None,
        }
    }

    /// Store whose persistent collections live under `data_path/cache`. If the
    /// keyspace cannot be opened, persistent collections fall back to memory.
    pub fn open(data_path: &Path) -> Self {
        let cache_dir = data_path.join("cache");
        let keyspace = match fjall::Config::new(&cache_dir).open() {
            Ok(keyspace) => Some(keyspace),
            Err(e) => {
                warn!(
                    "Could not open cache at {}: {}. Using memory cache",
                    cache_dir.display(),
                    e
                );
                None
            }
        };

        Self {
            collections: RwLock::new(HashMap::new()),
            keyspace,
        }
    }

    /// Syncs persistent collections to disk. A no-op for memory-only stores.
    pub fn flush(&self) -> anyhow::Result<()> {
        if let Some(keyspace) = &self.keyspace {
            keyspace.persist(fjall::PersistMode::SyncAll)?;
        }
        Ok(())
    }

    fn create_collection(&self, name: &str, persist: bool) -> Arc<dyn KeyValueCollection> {
        if persist {
            if let Some(keyspace) = &self.keyspace {
                match keyspace.open_partition(name, PartitionCreateOptions::default()) {
                    Ok(partition) => return Arc::new(DiskCollection::new(partition)),
                    Err(e) => warn!("Could not open cache partition {}: {}", name, e),
                }
            }
        }
        debug!("Using memory collection for {}", name);
        Arc::new(MemoryCollection::new())
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Store for KeyValueStore {
    fn get_collection(
        &self,
        name: &str,
        persist: bool,
        create_if_missing: bool,
    ) -> Option<Arc<dyn KeyValueCollection>> {
        if let Some(existing) = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(Arc::clone(existing));
        }
        if !create_if_missing {
            return None;
        }

        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| self.create_collection(name, persist));
        Some(Arc::clone(collection))
    }

    fn remove_collection(&self, name: &str) -> bool {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}
