use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use autocrawl_core::error::{Error, Result};

use crate::file::FileStorage;
use crate::memory::MemoryStorage;
use crate::QueueStorage;

/// Name of the queue opened when the caller does not name one
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Where queues are kept
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Process memory only
    #[default]
    Memory,
    /// JSON files below `root`
    File { root: PathBuf },
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Clear the default queue the first time it is opened
    pub purge_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            purge_on_start: true,
        }
    }
}

/// Explicit owner of the open queue storages of a process.
///
/// Opening the same name twice returns the same storage, so every queue
/// client in the process sees one consistent set of records.
pub struct StorageContext {
    config: StorageConfig,
    queues: DashMap<String, Arc<dyn QueueStorage>>,
}

impl StorageContext {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
        }
    }

    /// Context with in-memory storage and purging enabled
    pub fn in_memory() -> Self {
        Self::new(StorageConfig::default())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Open the storage of queue `name`, or of the default queue
    pub async fn open_queue_storage(&self, name: Option<&str>) -> Result<Arc<dyn QueueStorage>> {
        let name = name.unwrap_or(DEFAULT_QUEUE_NAME);
        validate_queue_name(name)?;

        if let Some(storage) = self.queues.get(name) {
            return Ok(storage.value().clone());
        }

        let storage: Arc<dyn QueueStorage> = match &self.config.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new(name)),
            StorageBackend::File { root } => Arc::new(
                FileStorage::open(root, name)
                    .await
                    .map_err(|e| Error::storage(e).with_queue_name(name))?,
            ),
        };

        let mut created = false;
        let storage = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                created = true;
                storage
            })
            .value()
            .clone();

        if created && self.config.purge_on_start && name == DEFAULT_QUEUE_NAME {
            info!("Purging default request queue");
            storage
                .purge()
                .await
                .map_err(|e| Error::storage(e).with_queue_name(name))?;
        }

        Ok(storage)
    }

    /// Delete queue `name` and forget it
    pub async fn drop_queue_storage(&self, name: &str) -> Result<()> {
        let storage = match self.queues.remove(name) {
            Some((_, storage)) => storage,
            None => self.open_queue_storage(Some(name)).await.map(|storage| {
                self.queues.remove(name);
                storage
            })?,
        };
        storage
            .drop_storage()
            .await
            .map_err(|e| Error::storage(e).with_queue_name(name))
    }

    /// Names of the queues opened through this context
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(Error::config(
            "queue_name",
            format!("`{}` may only contain letters, digits, '-', '_' and '.'", name),
        ))
    }
}
