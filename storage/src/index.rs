use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use autocrawl_core::error::StorageError;
use autocrawl_core::request::{unique_key_to_request_id, Request};

use crate::{QueueHead, QueueMetadata, QueueTotals, StorageResult, StoredRequest};

/// Queue-level fields persisted next to the records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHeader {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub client_keys: Vec<String>,
    /// Time of the newest write of each client
    #[serde(default)]
    pub last_writes: HashMap<String, DateTime<Utc>>,
}

/// A conditional record change worked out before anything is written
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    /// The stored record as it is now
    pub previous: StoredRequest,
    /// The record to store, `None` when the change does not apply
    pub next: Option<StoredRequest>,
}

/// In-memory index of one queue.
///
/// Holds the records, the pending order and the handled count. Counters are
/// only ever changed by the record transitions below, so they cannot drift
/// from the records. Callers provide the locking.
#[derive(Debug)]
pub struct QueueIndex {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    records: HashMap<String, StoredRequest>,
    pending: BTreeSet<(i64, String)>,
    handled: usize,
    clients: HashSet<String>,
    last_writes: HashMap<String, DateTime<Utc>>,
}

impl QueueIndex {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: unique_key_to_request_id(&format!("request-queue:{}", name)),
            name: name.to_string(),
            created_at: now,
            modified_at: now,
            accessed_at: now,
            records: HashMap::new(),
            pending: BTreeSet::new(),
            handled: 0,
            clients: HashSet::new(),
            last_writes: HashMap::new(),
        }
    }

    /// Rebuild an index from persisted state
    pub fn restore(header: IndexHeader, records: impl IntoIterator<Item = StoredRequest>) -> Self {
        let mut index = Self {
            id: header.id,
            name: header.name,
            created_at: header.created_at,
            modified_at: header.modified_at,
            accessed_at: header.accessed_at,
            records: HashMap::new(),
            pending: BTreeSet::new(),
            handled: 0,
            clients: header.client_keys.into_iter().collect(),
            last_writes: header.last_writes,
        };
        for record in records {
            index.put(record);
        }
        index
    }

    pub fn header(&self) -> IndexHeader {
        let mut client_keys: Vec<String> = self.clients.iter().cloned().collect();
        client_keys.sort();
        IndexHeader {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            accessed_at: self.accessed_at,
            client_keys,
            last_writes: self.last_writes.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&mut self, id: &str) -> Option<StoredRequest> {
        self.accessed_at = Utc::now();
        self.records.get(id).cloned()
    }

    pub fn insert(&mut self, record: StoredRequest, client_key: &str) -> StorageResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(StorageError::Conflict(record.id));
        }
        self.put(record);
        self.touch_write(client_key);
        Ok(())
    }

    pub fn upsert(&mut self, record: StoredRequest, client_key: &str) -> Option<StoredRequest> {
        let previous = self.take(&record.id);
        self.put(record);
        self.touch_write(client_key);
        previous
    }

    /// Work out how marking `request` handled changes its stored record
    pub fn plan_mark_handled(&self, mut request: Request) -> StorageResult<RecordUpdate> {
        let previous = self.current(&request)?;
        if previous.is_handled() {
            return Ok(RecordUpdate {
                previous,
                next: None,
            });
        }
        if request.handled_at.is_none() {
            request.handled_at = Some(Utc::now());
        }
        Ok(RecordUpdate {
            previous,
            next: Some(StoredRequest::new(request, None)),
        })
    }

    /// Work out how reclaiming `request` changes its stored record.
    /// `order_no` of `None` keeps the stored position.
    pub fn plan_reclaim(
        &self,
        mut request: Request,
        order_no: Option<i64>,
    ) -> StorageResult<RecordUpdate> {
        let previous = self.current(&request)?;
        if previous.is_handled() {
            return Ok(RecordUpdate {
                previous,
                next: None,
            });
        }
        request.handled_at = None;
        let order_no = order_no.or(previous.order_no);
        Ok(RecordUpdate {
            previous,
            next: Some(StoredRequest::new(request, order_no)),
        })
    }

    /// Store the planned record, if any, and return the previous one
    pub fn apply(&mut self, update: RecordUpdate, client_key: &str) -> StoredRequest {
        if let Some(next) = update.next {
            self.upsert(next, client_key);
        }
        update.previous
    }

    pub fn delete(&mut self, id: &str, client_key: &str) -> StorageResult<StoredRequest> {
        let removed = self
            .take(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        self.touch_write(client_key);
        Ok(removed)
    }

    pub fn list_head(&mut self, limit: usize, client_key: &str) -> QueueHead {
        self.accessed_at = Utc::now();
        self.clients.insert(client_key.to_string());
        let items = self
            .pending
            .iter()
            .take(limit)
            .filter_map(|(_, id)| self.records.get(id).cloned())
            .collect();
        QueueHead {
            items,
            queue_modified_at: Some(self.modified_at),
            had_multiple_clients: self.clients.len() > 1,
        }
    }

    /// Counters as seen by `client_key`
    pub fn totals(&self, client_key: &str) -> QueueTotals {
        let foreign_modified_at = self
            .last_writes
            .iter()
            .filter(|(key, _)| key.as_str() != client_key)
            .map(|(_, at)| *at)
            .max();
        QueueTotals {
            total: self.records.len(),
            handled: self.handled,
            modified_at: Some(self.modified_at),
            foreign_modified_at,
        }
    }

    pub fn metadata(&self) -> QueueMetadata {
        let total = self.records.len();
        QueueMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            accessed_at: self.accessed_at,
            total_request_count: total,
            handled_request_count: self.handled,
            pending_request_count: total.saturating_sub(self.handled),
            had_multiple_clients: self.clients.len() > 1,
        }
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
        self.pending.clear();
        self.handled = 0;
        self.clients.clear();
        self.last_writes.clear();
        self.touch_write_at(Utc::now());
        // no client key is empty, so every client sees the purge as foreign
        self.last_writes.insert(String::new(), self.modified_at);
    }

    pub fn records(&self) -> impl Iterator<Item = &StoredRequest> {
        self.records.values()
    }

    fn current(&self, request: &Request) -> StorageResult<StoredRequest> {
        let id = request.request_id();
        self.records
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound(id))
    }

    fn put(&mut self, record: StoredRequest) {
        match record.order_no {
            Some(order_no) => {
                self.pending.insert((order_no, record.id.clone()));
            }
            None => self.handled += 1,
        }
        self.records.insert(record.id.clone(), record);
    }

    fn take(&mut self, id: &str) -> Option<StoredRequest> {
        let record = self.records.remove(id)?;
        match record.order_no {
            Some(order_no) => {
                self.pending.remove(&(order_no, record.id.clone()));
            }
            None => self.handled -= 1,
        }
        Some(record)
    }

    fn touch_write(&mut self, client_key: &str) {
        self.clients.insert(client_key.to_string());
        self.touch_write_at(Utc::now());
        self.last_writes.insert(client_key.to_string(), self.modified_at);
    }

    // modified_at strictly increases so that head caches can compare it
    fn touch_write_at(&mut self, now: DateTime<Utc>) {
        self.modified_at = if now > self.modified_at {
            now
        } else {
            self.modified_at + Duration::microseconds(1)
        };
        self.accessed_at = self.modified_at;
    }
}
