use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::index::QueueIndex;
use autocrawl_core::request::Request;

use crate::{QueueHead, QueueMetadata, QueueStorage, QueueTotals, StorageResult, StoredRequest};

/// Queue storage that lives only as long as the process
#[derive(Debug)]
pub struct MemoryStorage {
    name: String,
    index: RwLock<QueueIndex>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            index: RwLock::new(QueueIndex::new(&name)),
            name,
        }
    }
}

#[async_trait]
impl QueueStorage for MemoryStorage {
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
        self.index.write().await.insert(record, client_key)
    }

    async fn upsert(
        &self,
        record: StoredRequest,
        client_key: &str,
    ) -> StorageResult<Option<StoredRequest>> {
        Ok(self.index.write().await.upsert(record, client_key))
    }

    async fn delete(&self, id: &str, client_key: &str) -> StorageResult<StoredRequest> {
        self.index.write().await.delete(id, client_key)
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
        Ok(index.apply(update, client_key))
    }

    async fn reclaim(
        &self,
        request: Request,
        order_no: Option<i64>,
        client_key: &str,
    ) -> StorageResult<StoredRequest> {
        let mut index = self.index.write().await;
        let update = index.plan_reclaim(request, order_no)?;
        Ok(index.apply(update, client_key))
    }

    async fn purge(&self) -> StorageResult<()> {
        self.index.write().await.clear();
        Ok(())
    }

    async fn drop_storage(&self) -> StorageResult<()> {
        self.index.write().await.clear();
        Ok(())
    }
}
