use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::fs;
use tokio::sync::RwLock;

use autocrawl_core::error::StorageError;
use autocrawl_core::request::Request;

use crate::index::{IndexHeader, QueueIndex, RecordUpdate};
use crate::{QueueHead, QueueMetadata, QueueStorage, QueueTotals, StorageResult, StoredRequest};

const METADATA_FILE: &str = "__metadata__.json";
const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Queue storage persisted as one JSON file per request.
///
/// Layout: `<root>/request_queues/<name>/<id>.json` plus `__metadata__.json`.
/// Files are written to a temporary name and renamed into place. The
/// in-memory index is rebuilt from the files on open, so counters always
/// agree with what is on disk.
#[derive(Debug)]
pub struct FileStorage {
    name: String,
    dir: PathBuf,
    index: RwLock<QueueIndex>,
}

impl FileStorage {
    /// Open (or create) the queue `name` under `root`
    pub async fn open(root: impl AsRef<Path>, name: &str) -> StorageResult<Self> {
        let dir = root.as_ref().join("request_queues").join(name);
        fs::create_dir_all(&dir).await?;

        let header = match fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => match serde_json::from_slice::<IndexHeader>(&bytes) {
                Ok(header) => Some(header),
                Err(e) => {
                    warn!("Ignoring unreadable metadata of queue {}: {}", name, e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let records = load_records(&dir).await?;
        debug!("Opened queue {} with {} stored requests", name, records.len());

        let index = match header {
            Some(header) => QueueIndex::restore(header, records),
            None => QueueIndex::restore(QueueIndex::new(name).header(), records),
        };

        let storage = Self {
            name: name.to_string(),
            dir,
            index: RwLock::new(index),
        };
        storage.write_header(&storage.index.read().await.header()).await?;
        Ok(storage)
    }

    /// Directory holding the queue files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    async fn write_record(&self, record: &StoredRequest) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(&record.id), &bytes).await
    }

    async fn write_header(&self, header: &IndexHeader) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(header)?;
        write_atomic(&self.dir.join(METADATA_FILE), &bytes).await
    }

    // Caller holds the write lock across planning and applying the update.
    async fn apply_update(
        &self,
        index: &mut QueueIndex,
        update: RecordUpdate,
        client_key: &str,
    ) -> StorageResult<StoredRequest> {
        if let Some(next) = &update.next {
            self.write_record(next).await?;
        }
        let changed = update.next.is_some();
        let previous = index.apply(update, client_key);
        if changed {
            self.sync_header(index).await;
        }
        Ok(previous)
    }

    // Header fields are informational; the records stay authoritative.
    async fn sync_header(&self, index: &QueueIndex) {
        if let Err(e) = self.write_header(&index.header()).await {
            warn!("Failed to write metadata of queue {}: {}", self.name, e);
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension(TEMP_EXTENSION);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_records(dir: &Path) -> StorageResult<Vec<StoredRequest>> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name == METADATA_FILE {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(TEMP_EXTENSION) => {
                // left over from an interrupted write
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("Failed to remove stale file {}: {}", path.display(), e);
                }
            }
            Some(RECORD_EXTENSION) => {
                let bytes = fs::read(&path).await?;
                match serde_json::from_slice::<StoredRequest>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        let error = StorageError::Corrupted {
                            id: file_name.to_string(),
                            message: e.to_string(),
                        };
                        error!("Skipping stored request: {}", error);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(records)
}

#[async_trait]
impl QueueStorage for FileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> StorageResult<QueueMetadata> {
        Ok(self.index.read().await.metadata())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<StoredRequest>> {
        Ok(self.index.write().await.get(id))
    }

    async fn insert(&self, record: StoredRequest, client_key: &str) -> StorageResult<()> {
        let mut index = self.index.write().await;
        if index.contains(&record.id) {
            return Err(StorageError::Conflict(record.id));
        }
        self.write_record(&record).await?;
        index.insert(record, client_key)?;
        self.sync_header(&index).await;
        Ok(())
    }

    async fn upsert(
        &self,
        record: StoredRequest,
        client_key: &str,
    ) -> StorageResult<Option<StoredRequest>> {
        let mut index = self.index.write().await;
        self.write_record(&record).await?;
        let previous = index.upsert(record, client_key);
        self.sync_header(&index).await;
        Ok(previous)
    }

    async fn delete(&self, id: &str, client_key: &str) -> StorageResult<StoredRequest> {
        let mut index = self.index.write().await;
        if !index.contains(id) {
            return Err(StorageError::NotFound(id.to_string()));
        }
        fs::remove_file(self.record_path(id)).await?;
        let removed = index.delete(id, client_key)?;
        self.sync_header(&index).await;
        Ok(removed)
    }

    async fn list_head(&self, limit: usize, client_key: &str) -> StorageResult<QueueHead> {
        Ok(self.index.write().await.list_head(limit, client_key))
    }

    async fn count_totals(&self, client_key: &str) -> StorageResult<QueueTotals> {
        Ok(self.index.read().await.totals(client_key))
    }

    async fn mark_handled(
        &self,
        request: Request,
        client_key: &str,
    ) -> StorageResult<StoredRequest> {
        let mut index = self.index.write().await;
        let update = index.plan_mark_handled(request)?;
        self.apply_update(&mut index, update, client_key).await
    }

    async fn reclaim(
        &self,
        request: Request,
        order_no: Option<i64>,
        client_key: &str,
    ) -> StorageResult<StoredRequest> {
        let mut index = self.index.write().await;
        let update = index.plan_reclaim(request, order_no)?;
        self.apply_update(&mut index, update, client_key).await
    }

    async fn purge(&self) -> StorageResult<()> {
        let mut index = self.index.write().await;
        let ids: Vec<String> = index.records().map(|r| r.id.clone()).collect();
        for id in ids {
            match fs::remove_file(self.record_path(&id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        index.clear();
        self.sync_header(&index).await;
        debug!("Purged queue {}", self.name);
        Ok(())
    }

    async fn drop_storage(&self) -> StorageResult<()> {
        let mut index = self.index.write().await;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.clear();
        debug!("Dropped queue {}", self.name);
        Ok(())
    }
}
