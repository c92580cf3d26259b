use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;

use autocrawl_core::client_load::ClientLoad;
use autocrawl_core::error::{Error, Result};
use autocrawl_core::error_handler::{DefaultErrorHandler, ErrorAction, ErrorManager};
use autocrawl_core::request::Request;
use autocrawl_scheduler::{QueueOperationInfo, RequestQueue};
use autocrawl_storage::StorageContext;

use crate::config::CrawlerConfig;
use crate::events::{Event, EventSender};
use crate::pool::{AutoscaledPool, PoolStats, TaskContext, TaskProvider};
use crate::snapshotter::Snapshotter;
use crate::stats::{CrawlerState, CrawlerStats};
use crate::system_status::{StatusSource, SystemStatus};
use crate::utils::format_duration;

/// What a request handler gets to work with
pub struct CrawlingContext {
    /// The leased request
    pub request: Request,
    queue: Arc<RequestQueue>,
    task: TaskContext,
}

impl CrawlingContext {
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    /// Whether the crawl is being aborted
    pub fn is_aborted(&self) -> bool {
        self.task.is_aborted()
    }

    /// Add a discovered request to the queue
    pub async fn enqueue(&self, request: Request) -> Result<QueueOperationInfo> {
        self.queue.add_request(request, false).await
    }
}

/// User code run for every request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, context: &mut CrawlingContext) -> Result<()>;

    /// Called once a request has been given up on
    async fn handle_failed_request(
        &self,
        _context: &CrawlingContext,
        _error: &Error,
    ) -> Result<()> {
        Ok(())
    }
}

/// Gives a leased request back to the queue unless disarmed
struct LeaseGuard {
    queue: Arc<RequestQueue>,
    request: Option<Request>,
}

impl LeaseGuard {
    fn new(queue: Arc<RequestQueue>, request: Request) -> Self {
        Self {
            queue,
            request: Some(request),
        }
    }

    fn disarm(&mut self) {
        self.request = None;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let queue = self.queue.clone();
                runtime.spawn(async move {
                    if let Err(e) = queue.reclaim_request(&request, false).await {
                        warn!("Failed to reclaim request {}: {}", request.url, e);
                    }
                });
            }
            Err(_) => warn!(
                "Request {} stays leased, no runtime to reclaim it",
                request.url
            ),
        }
    }
}

/// Feeds queued requests through the handler
struct CrawlTaskProvider {
    queue: Arc<RequestQueue>,
    handler: Arc<dyn RequestHandler>,
    error_manager: Arc<ErrorManager>,
    stats: Arc<RwLock<CrawlerStats>>,
    max_requests_per_crawl: Option<usize>,
    handle_request_timeout: Duration,
    abort_requests: mpsc::UnboundedSender<String>,
    events: Option<EventSender>,
}

impl CrawlTaskProvider {
    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    async fn limit_reached(&self) -> bool {
        match self.max_requests_per_crawl {
            Some(max) => self.stats.read().await.requests_handled() >= max,
            None => false,
        }
    }

    async fn handle_failure(
        &self,
        mut context: CrawlingContext,
        error: Error,
        guard: &mut LeaseGuard,
    ) -> Result<()> {
        context.request.push_error_message(error.to_string());
        let request_id = context.request.request_id();
        let error = error
            .with_url(context.request.url.as_str())
            .with_request_id(request_id.clone());
        let action = self
            .error_manager
            .handle_error(&error, &context.request)
            .await?;

        match action {
            ErrorAction::Retry { forefront, .. } => {
                context.request.retry_count += 1;
                self.queue
                    .reclaim_request(&context.request, forefront)
                    .await?;
                guard.disarm();
                self.stats.write().await.record_retry();
                self.emit(Event::RequestRetried {
                    request_id,
                    retry_count: context.request.retry_count,
                });
            }
            ErrorAction::GiveUp { .. } => {
                self.queue.mark_request_handled(&mut context.request).await?;
                guard.disarm();
                self.stats.write().await.record_failed();
                if let Err(e) = self.handler.handle_failed_request(&context, &error).await {
                    warn!(
                        "Failed request handler for {} returned an error: {}",
                        context.request.url, e
                    );
                }
                self.emit(Event::RequestFailed {
                    request_id,
                    message: error.to_string(),
                });
            }
            ErrorAction::Abort { reason } => {
                self.queue.reclaim_request(&context.request, true).await?;
                guard.disarm();
                let _ = self.abort_requests.send(reason);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TaskProvider for CrawlTaskProvider {
    async fn is_task_ready(&self) -> Result<bool> {
        if self.limit_reached().await {
            return Ok(false);
        }
        Ok(!self.queue.is_empty().await?)
    }

    async fn run_task(&self, task: TaskContext) -> Result<bool> {
        if self.limit_reached().await {
            return Ok(false);
        }
        let Some(request) = self.queue.fetch_next_request().await? else {
            return Ok(false);
        };

        let mut guard = LeaseGuard::new(self.queue.clone(), request.clone());
        let mut context = CrawlingContext {
            request,
            queue: self.queue.clone(),
            task,
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.handle_request_timeout,
            self.handler.handle_request(&mut context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.handle_request_timeout)),
        };

        match outcome {
            Ok(()) => {
                self.queue.mark_request_handled(&mut context.request).await?;
                guard.disarm();
                self.stats.write().await.record_finished(started.elapsed());
                debug!("Request {} handled", context.request.url);
                self.emit(Event::RequestHandled {
                    request_id: context.request.request_id(),
                });
            }
            Err(error) => self.handle_failure(context, error, &mut guard).await?,
        }

        Ok(true)
    }

    async fn is_finished(&self) -> Result<bool> {
        if self.limit_reached().await {
            info!("Reached the maximum number of requests per crawl");
            return Ok(true);
        }
        self.queue.is_finished().await
    }
}

/// Drains a request queue through a handler on an autoscaled pool
pub struct BasicCrawler {
    config: CrawlerConfig,
    queue: Arc<RequestQueue>,
    handler: Arc<dyn RequestHandler>,
    error_manager: Arc<ErrorManager>,
    stats: Arc<RwLock<CrawlerStats>>,
    status: Option<Arc<dyn StatusSource>>,
    client_load: Option<Arc<ClientLoad>>,
    events: Option<EventSender>,
    pool: Mutex<Option<Arc<AutoscaledPool>>>,
    last_pool_stats: RwLock<Option<PoolStats>>,
}

impl BasicCrawler {
    /// Create a new crawler
    pub fn new(
        queue: Arc<RequestQueue>,
        handler: Arc<dyn RequestHandler>,
        config: CrawlerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let error_manager = Arc::new(ErrorManager::new(
            DefaultErrorHandler::new()
                .with_max_retries(config.max_request_retries)
                .with_retry_forefront(config.retry_forefront),
        ));

        Ok(Self {
            config,
            queue,
            handler,
            error_manager,
            stats: Arc::new(RwLock::new(CrawlerStats::default())),
            status: None,
            client_load: None,
            events: None,
            pool: Mutex::new(None),
            last_pool_stats: RwLock::new(None),
        })
    }

    /// Create a crawler over queue `name` (or the default queue) of `context`.
    ///
    /// The queue is opened with `config.queue`, and its storage calls feed
    /// the client load the snapshotter watches.
    pub async fn open(
        context: &StorageContext,
        name: Option<&str>,
        handler: Arc<dyn RequestHandler>,
        config: CrawlerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let client_load = Arc::new(ClientLoad::new());
        let queue = RequestQueue::open(context, name, config.queue.clone())
            .await?
            .with_client_load(client_load.clone());
        Ok(Self::new(Arc::new(queue), handler, config)?.with_client_load(client_load))
    }

    /// Decide retries with a custom error manager
    pub fn with_error_manager(mut self, error_manager: Arc<ErrorManager>) -> Self {
        self.error_manager = error_manager;
        self
    }

    /// Scale on the given status source instead of sampling this process
    pub fn with_status_source(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    /// Storage client counters the snapshotter should watch
    pub fn with_client_load(mut self, client_load: Arc<ClientLoad>) -> Self {
        self.client_load = Some(client_load);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn error_manager(&self) -> Arc<ErrorManager> {
        self.error_manager.clone()
    }

    pub async fn stats(&self) -> CrawlerStats {
        self.stats.read().await.clone()
    }

    /// Counters of the last finished pool run
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.last_pool_stats.read().await.clone()
    }

    /// Add requests to the end of the queue
    pub async fn add_requests(
        &self,
        requests: impl IntoIterator<Item = Request>,
    ) -> Result<Vec<QueueOperationInfo>> {
        self.queue.add_requests(requests, false).await
    }

    /// Crawl until the queue is finished or the crawl is aborted
    pub async fn run(&self) -> Result<CrawlerStats> {
        let (status, snapshotter) = match &self.status {
            Some(status) => (status.clone(), None),
            None => {
                let mut snapshotter = Snapshotter::new(self.config.snapshotter.clone())?;
                if let Some(client_load) = &self.client_load {
                    snapshotter = snapshotter.with_client_load(client_load.clone());
                }
                let snapshotter = Arc::new(snapshotter);
                let status: Arc<dyn StatusSource> = Arc::new(SystemStatus::new(
                    snapshotter.clone(),
                    self.config.system_status.clone(),
                ));
                (status, Some(snapshotter))
            }
        };

        let (abort_requests, mut abort_receiver) = mpsc::unbounded_channel();
        let provider = Arc::new(CrawlTaskProvider {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            error_manager: self.error_manager.clone(),
            stats: self.stats.clone(),
            max_requests_per_crawl: self.config.max_requests_per_crawl,
            handle_request_timeout: self.config.handle_request_timeout,
            abort_requests,
            events: self.events.clone(),
        });

        let mut pool = AutoscaledPool::new(self.config.pool.clone(), provider, status)?;
        if let Some(events) = &self.events {
            pool = pool.with_events(events.clone());
        }
        let pool = Arc::new(pool);
        *self.pool.lock().await = Some(pool.clone());
        if let Some(snapshotter) = &snapshotter {
            snapshotter.start().await;
        }

        self.stats.write().await.mark_started();
        info!("Crawler started on queue {}", self.queue.name());

        let mut abort_reason = None;
        let result = {
            let run = pool.run();
            tokio::pin!(run);
            loop {
                tokio::select! {
                    biased;
                    Some(reason) = abort_receiver.recv() => {
                        if abort_reason.is_none() {
                            pool.abort().await;
                            abort_reason = Some(reason);
                        }
                    }
                    result = &mut run => break result,
                }
            }
        };

        *self.pool.lock().await = None;
        if let Some(snapshotter) = snapshotter {
            snapshotter.stop().await;
        }

        let stats = {
            let mut stats = self.stats.write().await;
            stats.mark_finished();
            stats.clone()
        };
        *self.last_pool_stats.write().await = Some(result?);

        info!(
            "Crawler finished: {} requests finished, {} failed, {} retried in {}",
            stats.requests_finished,
            stats.requests_failed,
            stats.requests_retried,
            format_duration(stats.duration().unwrap_or_default())
        );

        match abort_reason {
            Some(reason) => Err(Error::other(format!("Crawl aborted: {}", reason))),
            None => Ok(stats),
        }
    }

    /// Stop the running crawl once in-flight requests finish
    pub async fn abort(&self) {
        let pool = self.pool.lock().await.clone();
        if let Some(pool) = pool {
            pool.abort().await;
        }
    }

    pub async fn pause(&self) -> Result<()> {
        match self.pool.lock().await.clone() {
            Some(pool) => pool.pause().await,
            None => Err(Error::pool("crawler is not running")),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        match self.pool.lock().await.clone() {
            Some(pool) => pool.resume().await,
            None => Err(Error::pool("crawler is not running")),
        }
    }

    /// Save crawler state to file
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state = CrawlerState {
            stats: self.stats().await,
            errors: self.error_manager.stats().await,
            pool: self.pool_stats().await,
        };

        let serialized = serde_json::to_string_pretty(&state).map_err(|e| {
            Error::other(format!("Failed to serialize crawler state: {}", e))
        })?;
        tokio::fs::write(path, serialized).await.map_err(|e| {
            Error::other(format!("Failed to write crawler state to file: {}", e))
        })?;

        info!("Crawler state saved to {}", path.display());
        Ok(())
    }

    /// Load crawler state from file
    pub async fn load_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let serialized = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::other(format!("Failed to read crawler state from file: {}", e))
        })?;
        let state: CrawlerState = serde_json::from_str(&serialized).map_err(|e| {
            Error::other(format!("Failed to deserialize crawler state: {}", e))
        })?;

        *self.stats.write().await = state.stats;
        *self.error_manager.stats_ref().write().await = state.errors;
        *self.last_pool_stats.write().await = state.pool;

        info!("Crawler state loaded from {}", path.display());
        Ok(())
    }
}
