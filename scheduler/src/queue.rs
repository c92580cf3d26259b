use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use autocrawl_core::client_load::ClientLoad;
use autocrawl_core::error::{Error, Result, StorageError};
use autocrawl_core::request::Request;
use autocrawl_storage::{
    QueueMetadata, QueueStorage, StorageContext, StorageResult, StoredRequest,
};

use crate::config::QueueConfig;
use crate::head::QueueHeadCache;
use crate::recent::RecentIds;

const CLIENT_KEY_LENGTH: usize = 12;

/// Outcome of a queue write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperationInfo {
    pub request_id: String,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Result of the finish check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedCheck {
    /// Nothing leased, nothing pending locally or in storage
    pub is_finished: bool,
    /// Other clients have used the queue, so storage may still change
    pub had_multiple_clients: bool,
}

#[derive(Debug, Clone, Copy)]
struct CachedRequest {
    is_handled: bool,
}

/// Lease bookkeeping guarded by one lock
#[derive(Debug)]
struct LocalState {
    head: QueueHeadCache,
    in_progress: HashSet<String>,
    recently_handled: RecentIds,
}

/// Strictly increasing millisecond clock for order numbers
#[derive(Debug, Default)]
struct OrderClock {
    last: AtomicI64,
}

impl OrderClock {
    fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            });
        match previous {
            Ok(last) | Err(last) => now.max(last + 1),
        }
    }
}

/// Deduplicated, persistent work list with forefront insertion and leases.
///
/// A fetched request is leased to the caller until it is marked handled or
/// reclaimed. Leased ids are never returned by another fetch on the same
/// queue instance.
pub struct RequestQueue {
    storage: Arc<dyn QueueStorage>,
    config: QueueConfig,
    client_key: String,
    state: Mutex<LocalState>,
    requests_cache: DashMap<String, CachedRequest>,
    clock: OrderClock,
    client_load: Option<Arc<ClientLoad>>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("name", &self.storage.name())
            .field("client_key", &self.client_key)
            .finish_non_exhaustive()
    }
}

impl RequestQueue {
    /// Create a queue client over `storage`
    pub fn new(storage: Arc<dyn QueueStorage>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let client_key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CLIENT_KEY_LENGTH)
            .map(char::from)
            .collect();
        debug!(
            "Opening request queue {} as client {}",
            storage.name(),
            client_key
        );
        Ok(Self {
            state: Mutex::new(LocalState {
                head: QueueHeadCache::default(),
                in_progress: HashSet::new(),
                recently_handled: RecentIds::new(config.recently_handled_capacity),
            }),
            storage,
            config,
            client_key,
            requests_cache: DashMap::new(),
            clock: OrderClock::default(),
            client_load: None,
        })
    }

    /// Open queue `name` (or the default queue) from a storage context
    pub async fn open(
        context: &StorageContext,
        name: Option<&str>,
        config: QueueConfig,
    ) -> Result<Self> {
        config.validate()?;
        let storage = context.open_queue_storage(name).await?;
        Self::new(storage, config)
    }

    /// Report storage calls to `client_load`
    pub fn with_client_load(mut self, client_load: Arc<ClientLoad>) -> Self {
        self.client_load = Some(client_load);
        self
    }

    pub fn name(&self) -> &str {
        self.storage.name()
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a request unless one with the same unique key exists.
    ///
    /// Duplicates are reported through `was_already_present` and leave the
    /// stored request untouched. The request is keyed by its unique key; an
    /// `id` it already carries is replaced.
    pub async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo> {
        let id = request.request_id();
        let unique_key = request.unique_key.clone();

        if let Some(cached) = self.requests_cache.get(&id).map(|c| *c) {
            return Ok(QueueOperationInfo {
                request_id: id,
                unique_key,
                was_already_present: true,
                was_already_handled: cached.is_handled,
            });
        }

        let is_handled = request.is_handled();
        let order_no = if is_handled {
            None
        } else if forefront {
            Some(-self.clock.next())
        } else {
            Some(self.clock.next())
        };

        let record = StoredRequest::new(request, order_no);
        match self.track(self.storage.insert(record, &self.client_key).await) {
            Ok(()) => {
                self.cache_request(&id, is_handled);
                if !is_handled {
                    let mut state = self.state.lock().await;
                    if forefront {
                        state.head.push_front(id.clone());
                    } else {
                        state.head.push_back(id.clone());
                    }
                }
                debug!("Added request {} ({})", id, unique_key);
                Ok(QueueOperationInfo {
                    request_id: id,
                    unique_key,
                    was_already_present: false,
                    was_already_handled: is_handled,
                })
            }
            Err(StorageError::Conflict(_)) => {
                let existing = self
                    .track(self.storage.get(&id).await)
                    .map_err(|e| self.storage_error(e, &id))?;
                let was_already_handled = existing.map(|r| r.is_handled()).unwrap_or(false);
                self.cache_request(&id, was_already_handled);
                Ok(QueueOperationInfo {
                    request_id: id,
                    unique_key,
                    was_already_present: true,
                    was_already_handled,
                })
            }
            Err(e) => Err(self.storage_error(e, &id)),
        }
    }

    /// Add several requests in order
    pub async fn add_requests(
        &self,
        requests: impl IntoIterator<Item = Request>,
        forefront: bool,
    ) -> Result<Vec<QueueOperationInfo>> {
        let mut infos = Vec::new();
        for request in requests {
            infos.push(self.add_request(request, forefront).await?);
        }
        Ok(infos)
    }

    /// Read a request without leasing it
    pub async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        let record = self
            .track(self.storage.get(id).await)
            .map_err(|e| self.storage_error(e, id))?;
        Ok(record.map(|r| r.request))
    }

    /// Lease the next eligible request.
    ///
    /// `None` means nothing is eligible right now; leased requests of this
    /// or other clients may still come back.
    pub async fn fetch_next_request(&self) -> Result<Option<Request>> {
        let mut skipped = 0;
        loop {
            let id = {
                let mut state = self.state.lock().await;
                self.ensure_head_is_fresh(&mut state).await?;
                match next_eligible(&mut state) {
                    Some(id) => {
                        state.in_progress.insert(id.clone());
                        id
                    }
                    None => return Ok(None),
                }
            };

            let record = match self.track(self.storage.get(&id).await) {
                Ok(record) => record,
                Err(e) => {
                    self.state.lock().await.in_progress.remove(&id);
                    return Err(self.storage_error(e, &id));
                }
            };

            match record {
                Some(record) if !record.is_handled() => {
                    let mut request = record.request;
                    request.id = Some(record.id);
                    return Ok(Some(request));
                }
                Some(_) => {
                    let mut state = self.state.lock().await;
                    state.in_progress.remove(&id);
                    state.recently_handled.insert(id.clone());
                    self.cache_request(&id, true);
                }
                None => {
                    warn!(
                        "Request {} listed in queue {} is missing, dropping its lease",
                        id,
                        self.name()
                    );
                    let mut state = self.state.lock().await;
                    state.in_progress.remove(&id);
                    state.head.invalidate();
                    self.requests_cache.remove(&id);
                }
            }

            skipped += 1;
            if skipped > self.config.head_min_length {
                return Ok(None);
            }
        }
    }

    /// Mark a leased request as handled.
    ///
    /// Handling an already handled request again changes nothing.
    pub async fn mark_request_handled(
        &self,
        request: &mut Request,
    ) -> Result<QueueOperationInfo> {
        let id = request.request_id();
        let handled_at = request.handled_at.unwrap_or_else(Utc::now);
        let mut handled = request.clone();
        handled.handled_at = Some(handled_at);
        let previous = self
            .track(self.storage.mark_handled(handled, &self.client_key).await)
            .map_err(|e| self.storage_error(e, &id))?;

        let was_already_handled = previous.is_handled();
        request.handled_at = if was_already_handled {
            previous.request.handled_at
        } else {
            Some(handled_at)
        };
        request.id = Some(id.clone());

        {
            let mut state = self.state.lock().await;
            state.in_progress.remove(&id);
            state.head.remove(&id);
            state.recently_handled.insert(id.clone());
        }
        self.cache_request(&id, true);

        Ok(QueueOperationInfo {
            request_id: id,
            unique_key: previous.unique_key,
            was_already_present: true,
            was_already_handled,
        })
    }

    /// Return a leased request to the queue for another attempt.
    ///
    /// The request keeps its position unless `forefront` is set. Handled
    /// requests are never brought back, even when another client marked
    /// them handled while this one held the lease.
    pub async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo> {
        let id = request.request_id();
        let order_no = forefront.then(|| -self.clock.next());
        let previous = self
            .track(
                self.storage
                    .reclaim(request.clone(), order_no, &self.client_key)
                    .await,
            )
            .map_err(|e| self.storage_error(e, &id))?;

        if previous.is_handled() {
            warn!("Not reclaiming request {}, it is already handled", id);
            {
                let mut state = self.state.lock().await;
                state.in_progress.remove(&id);
                state.head.remove(&id);
                state.recently_handled.insert(id.clone());
            }
            self.cache_request(&id, true);
            return Ok(QueueOperationInfo {
                request_id: id,
                unique_key: previous.unique_key,
                was_already_present: true,
                was_already_handled: true,
            });
        }

        {
            let mut state = self.state.lock().await;
            state.in_progress.remove(&id);
            state.recently_handled.remove(&id);
            if forefront {
                state.head.push_front(id.clone());
            } else {
                state.head.invalidate();
            }
        }
        debug!("Reclaimed request {} (forefront={})", id, forefront);

        Ok(QueueOperationInfo {
            request_id: id,
            unique_key: previous.unique_key,
            was_already_present: true,
            was_already_handled: false,
        })
    }

    /// Whether there is nothing to fetch right now
    pub async fn is_empty(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_head_is_fresh(&mut state).await?;
        let state = &*state;
        Ok(!state.head.contains_any(|id| {
            !state.in_progress.contains(id) && !state.recently_handled.contains(id)
        }))
    }

    /// Check that no request is leased and none is pending, both in the
    /// local head and in storage
    pub async fn check_finished(&self) -> Result<FinishedCheck> {
        let mut state = self.state.lock().await;
        if !state.in_progress.is_empty() {
            return Ok(FinishedCheck {
                is_finished: false,
                had_multiple_clients: state.head.had_multiple_clients(),
            });
        }

        let pending_in_storage = self.refresh_head(&mut state).await?;
        Ok(FinishedCheck {
            is_finished: state.head.is_empty() && pending_in_storage == 0,
            had_multiple_clients: state.head.had_multiple_clients(),
        })
    }

    /// Whether all work is done.
    ///
    /// When other clients share the queue the last write must also be older
    /// than the consistency delay.
    pub async fn is_finished(&self) -> Result<bool> {
        let check = self.check_finished().await?;
        if !check.is_finished {
            return Ok(false);
        }
        if !check.had_multiple_clients {
            return Ok(true);
        }

        let totals = self
            .track(self.storage.count_totals(&self.client_key).await)
            .map_err(|e| self.queue_storage_error(e))?;
        let quiet = match totals.modified_at {
            Some(modified_at) => {
                let age = Utc::now()
                    .signed_duration_since(modified_at)
                    .to_std()
                    .unwrap_or_default();
                age >= self.config.consistency_delay
            }
            None => true,
        };
        if !quiet {
            debug!(
                "Queue {} looks finished but other clients wrote recently",
                self.name()
            );
        }
        Ok(quiet)
    }

    /// Queue metadata and counters
    pub async fn get_info(&self) -> Result<QueueMetadata> {
        self.track(self.storage.metadata().await)
            .map_err(|e| self.queue_storage_error(e))
    }

    pub async fn handled_count(&self) -> Result<usize> {
        let totals = self
            .track(self.storage.count_totals(&self.client_key).await)
            .map_err(|e| self.queue_storage_error(e))?;
        Ok(totals.handled)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let totals = self
            .track(self.storage.count_totals(&self.client_key).await)
            .map_err(|e| self.queue_storage_error(e))?;
        Ok(totals.pending())
    }

    /// Number of requests currently leased from this client
    pub async fn in_progress_count(&self) -> usize {
        self.state.lock().await.in_progress.len()
    }

    /// Delete the queue and everything in it
    pub async fn drop_queue(&self) -> Result<()> {
        self.track(self.storage.drop_storage().await)
            .map_err(|e| self.queue_storage_error(e))?;
        let mut state = self.state.lock().await;
        state.head.clear();
        state.in_progress.clear();
        state.recently_handled.clear();
        self.requests_cache.clear();
        Ok(())
    }

    async fn ensure_head_is_fresh(&self, state: &mut LocalState) -> Result<()> {
        if !state.head.must_refresh() {
            let totals = self
                .track(self.storage.count_totals(&self.client_key).await)
                .map_err(|e| self.queue_storage_error(e))?;
            if !state.head.is_stale(&totals) {
                return Ok(());
            }
        }
        self.refresh_head(state).await.map(|_| ())
    }

    /// Reload the head from storage, returning how many pending requests
    /// storage listed before local filtering
    async fn refresh_head(&self, state: &mut LocalState) -> Result<usize> {
        let limit = (state.in_progress.len() * self.config.head_buffer_factor)
            .max(self.config.head_min_length);
        let head = self
            .track(self.storage.list_head(limit, &self.client_key).await)
            .map_err(|e| self.queue_storage_error(e))?;

        let listed = head.items.len();
        let complete = listed < limit;
        let ids = head
            .items
            .into_iter()
            .filter(|r| {
                !state.in_progress.contains(&r.id) && !state.recently_handled.contains(&r.id)
            })
            .map(|r| r.id)
            .collect::<Vec<_>>();
        debug!(
            "Refreshed head of queue {}: {} eligible of limit {}",
            self.name(),
            ids.len(),
            limit
        );
        state
            .head
            .replace(ids, head.queue_modified_at, complete, head.had_multiple_clients);
        Ok(listed)
    }

    fn cache_request(&self, id: &str, is_handled: bool) {
        if self.config.requests_cache_capacity == 0 {
            return;
        }
        if self.requests_cache.len() >= self.config.requests_cache_capacity
            && !self.requests_cache.contains_key(id)
        {
            let evict = self.requests_cache.iter().next().map(|e| e.key().clone());
            if let Some(key) = evict {
                self.requests_cache.remove(&key);
            }
        }
        self.requests_cache
            .insert(id.to_string(), CachedRequest { is_handled });
    }

    fn track<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Some(load) = &self.client_load {
            match &result {
                Err(e) if e.is_transient() => load.record_error(),
                _ => load.record_success(),
            }
        }
        result
    }

    fn storage_error(&self, error: StorageError, id: &str) -> Error {
        Error::storage(error)
            .with_queue_name(self.name())
            .with_request_id(id)
    }

    fn queue_storage_error(&self, error: StorageError) -> Error {
        Error::storage(error).with_queue_name(self.name())
    }
}

/// Pop the next head id that is neither leased nor recently handled
fn next_eligible(state: &mut LocalState) -> Option<String> {
    while let Some(id) = state.head.pop_front() {
        if !state.in_progress.contains(&id) && !state.recently_handled.contains(&id) {
            return Some(id);
        }
    }
    None
}
