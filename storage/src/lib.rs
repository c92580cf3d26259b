//! Record storage behind the request queue.
//!
//! A [`QueueStorage`] keeps the requests of one named queue and the
//! aggregate counters derived from them. Every call is atomic: a record and
//! the counters it contributes to always change together. Backends are
//! shared between queue clients through [`StorageContext`].

pub mod context;
pub mod file;
pub mod index;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use autocrawl_core::error::StorageError;
use autocrawl_core::request::Request;

pub use context::{StorageBackend, StorageConfig, StorageContext, DEFAULT_QUEUE_NAME};
pub use file::FileStorage;
pub use index::QueueIndex;
pub use memory::MemoryStorage;

/// Result type of storage calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A request as persisted by a queue.
///
/// `order_no` is `None` once the request is handled. Pending requests sort
/// ascending by `order_no`, so forefront requests carry negative numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRequest {
    pub id: String,
    pub unique_key: String,
    pub order_no: Option<i64>,
    pub request: Request,
}

impl StoredRequest {
    /// Wrap a request for storage, keyed by its derived id
    pub fn new(request: Request, order_no: Option<i64>) -> Self {
        let id = request.request_id();
        let unique_key = request.unique_key.clone();
        let mut request = request;
        request.id = Some(id.clone());
        Self {
            id,
            unique_key,
            order_no,
            request,
        }
    }

    /// Whether the request is handled
    pub fn is_handled(&self) -> bool {
        self.order_no.is_none()
    }
}

/// Pending requests at the head of a queue, in dispatch order
#[derive(Debug, Clone, Default)]
pub struct QueueHead {
    pub items: Vec<StoredRequest>,
    /// Modification time of the queue when the head was listed
    pub queue_modified_at: Option<DateTime<Utc>>,
    /// More than one client has touched the queue
    pub had_multiple_clients: bool,
}

/// Aggregate counters of a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueTotals {
    pub total: usize,
    pub handled: usize,
    pub modified_at: Option<DateTime<Utc>>,
    /// Newest write by any client other than the one asking
    pub foreign_modified_at: Option<DateTime<Utc>>,
}

impl QueueTotals {
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.handled)
    }
}

/// Descriptive information about a stored queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub total_request_count: usize,
    pub handled_request_count: usize,
    pub pending_request_count: usize,
    pub had_multiple_clients: bool,
}

/// Narrow CRUD contract the request queue is written against
#[async_trait]
pub trait QueueStorage: Send + Sync + 'static {
    /// Name of the stored queue
    fn name(&self) -> &str;

    /// Queue metadata and counters
    async fn metadata(&self) -> StorageResult<QueueMetadata>;

    /// Read one record
    async fn get(&self, id: &str) -> StorageResult<Option<StoredRequest>>;

    /// Insert a new record, failing with `Conflict` if the id exists
    async fn insert(&self, record: StoredRequest, client_key: &str) -> StorageResult<()>;

    /// Insert or replace a record, returning the previous version
    async fn upsert(
        &self,
        record: StoredRequest,
        client_key: &str,
    ) -> StorageResult<Option<StoredRequest>>;

    /// Remove a record, failing with `NotFound` if it does not exist
    async fn delete(&self, id: &str, client_key: &str) -> StorageResult<StoredRequest>;

    /// List up to `limit` pending records in dispatch order
    async fn list_head(&self, limit: usize, client_key: &str) -> StorageResult<QueueHead>;

    /// Total and handled counts, with writes by clients other than
    /// `client_key` reported separately
    async fn count_totals(&self, client_key: &str) -> StorageResult<QueueTotals>;

    /// Mark the stored version of `request` handled, returning the record as
    /// it was before the call.
    ///
    /// A record that is already handled is left untouched. Fails with
    /// `NotFound` if the request was never stored.
    async fn mark_handled(
        &self,
        request: Request,
        client_key: &str,
    ) -> StorageResult<StoredRequest>;

    /// Put `request` back as pending, returning the record as it was before
    /// the call.
    ///
    /// `order_no` of `None` keeps the stored position. A record that is
    /// already handled is left untouched, so a reclaim never revives it.
    async fn reclaim(
        &self,
        request: Request,
        order_no: Option<i64>,
        client_key: &str,
    ) -> StorageResult<StoredRequest>;

    /// Remove every record but keep the queue
    async fn purge(&self) -> StorageResult<()>;

    /// Remove the queue and everything in it
    async fn drop_storage(&self) -> StorageResult<()>;
}
