use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use autocrawl_core::error::{Error, Result};
use autocrawl_core::error_handler::{ErrorAction, ErrorHandler, ErrorManager};
use autocrawl_core::request::Request;
use autocrawl_scheduler::{QueueConfig, RequestQueue};
use autocrawl_storage::{MemoryStorage, StorageContext};

use crate::mock::ScriptedStatus;
use crate::{BasicCrawler, CrawlerConfig, CrawlingContext, PoolConfig, RequestHandler};

/// Fails each URL a configured number of times before succeeding
struct FlakyHandler {
    failures: Mutex<HashMap<String, usize>>,
    fail_times: usize,
    failed_callbacks: AtomicUsize,
}

impl FlakyHandler {
    fn new(fail_times: usize) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            fail_times,
            failed_callbacks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RequestHandler for FlakyHandler {
    async fn handle_request(&self, context: &mut CrawlingContext) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(context.request.url.to_string()).or_insert(0);
        if *count < self.fail_times {
            *count += 1;
            return Err(Error::task("flaky"));
        }
        Ok(())
    }

    async fn handle_failed_request(&self, context: &CrawlingContext, error: &Error) -> Result<()> {
        assert!(!context.request.error_messages.is_empty());
        let error_context = error.context().unwrap();
        assert_eq!(error_context.url.as_deref(), Some(context.request.url.as_str()));
        assert_eq!(error_context.request_id, Some(context.request.request_id()));
        self.failed_callbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Follows links up to a fixed depth
struct LinkHandler {
    visited: AtomicUsize,
}

#[async_trait]
impl RequestHandler for LinkHandler {
    async fn handle_request(&self, context: &mut CrawlingContext) -> Result<()> {
        self.visited.fetch_add(1, Ordering::SeqCst);
        let depth = context.request.url.path().matches('/').count();
        if depth < 3 {
            for child in ["a", "b"] {
                let url = format!("{}/{}", context.request.url, child);
                context.enqueue(Request::get(url)?).await?;
            }
        }
        Ok(())
    }
}

struct AbortOnError;

#[async_trait]
impl ErrorHandler for AbortOnError {
    async fn handle_error(&self, _error: &Error, _request: &Request) -> Result<ErrorAction> {
        Ok(ErrorAction::Abort {
            reason: "unrecoverable".to_string(),
        })
    }
}

fn queue() -> Arc<RequestQueue> {
    Arc::new(
        RequestQueue::new(Arc::new(MemoryStorage::new("crawl")), QueueConfig::default()).unwrap(),
    )
}

fn config(max_concurrency: usize) -> CrawlerConfig {
    CrawlerConfig {
        pool: PoolConfig {
            maybe_run_interval: Duration::from_millis(50),
            ..PoolConfig::default().with_concurrency(1, max_concurrency)
        },
        ..CrawlerConfig::default()
    }
}

fn crawler(
    queue: Arc<RequestQueue>,
    handler: Arc<dyn RequestHandler>,
    config: CrawlerConfig,
) -> BasicCrawler {
    BasicCrawler::new(queue, handler, config)
        .unwrap()
        .with_status_source(Arc::new(ScriptedStatus::idle()))
}

fn requests(count: usize) -> Vec<Request> {
    (0..count)
        .map(|i| Request::get(format!("https://example.com/item/{}", i)).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_failed_requests_are_retried() {
    let queue = queue();
    let handler = Arc::new(FlakyHandler::new(1));
    let crawler = crawler(queue.clone(), handler.clone(), config(2));
    crawler.add_requests(requests(3)).await.unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.requests_finished, 3);
    assert_eq!(stats.requests_retried, 3);
    assert_eq!(stats.requests_failed, 0);
    assert_eq!(handler.failed_callbacks.load(Ordering::SeqCst), 0);

    assert_eq!(queue.handled_count().await.unwrap(), 3);
    assert!(queue.is_finished().await.unwrap());

    let errors = crawler.error_manager().stats().await;
    assert_eq!(errors.total_errors, 3);
    assert_eq!(errors.retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_request_is_given_up_after_max_retries() {
    let queue = queue();
    let handler = Arc::new(FlakyHandler::new(usize::MAX));
    let config = CrawlerConfig {
        max_request_retries: 2,
        ..config(1)
    };
    let crawler = crawler(queue.clone(), handler.clone(), config);
    let info = crawler.add_requests(requests(1)).await.unwrap().remove(0);

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.requests_finished, 0);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_retried, 2);
    assert_eq!(handler.failed_callbacks.load(Ordering::SeqCst), 1);

    let stored = queue.get_request(&info.request_id).await.unwrap().unwrap();
    assert!(stored.is_handled());
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.error_messages.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_abort_action_stops_the_crawl() {
    let queue = queue();
    let crawler = crawler(queue.clone(), Arc::new(FlakyHandler::new(usize::MAX)), config(1))
        .with_error_manager(Arc::new(ErrorManager::new(AbortOnError)));
    crawler.add_requests(requests(3)).await.unwrap();

    let error = crawler.run().await.unwrap_err();
    assert!(error.to_string().contains("unrecoverable"));

    // the failed request went back to the queue
    assert_eq!(queue.handled_count().await.unwrap(), 0);
    assert_eq!(queue.pending_count().await.unwrap(), 3);
    assert_eq!(queue.in_progress_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_max_requests_per_crawl() {
    let queue = queue();
    let config = CrawlerConfig {
        max_requests_per_crawl: Some(3),
        ..config(1)
    };
    let crawler = crawler(queue.clone(), Arc::new(FlakyHandler::new(0)), config);
    crawler.add_requests(requests(10)).await.unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.requests_finished, 3);
    assert_eq!(queue.pending_count().await.unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_handler_can_enqueue_requests() {
    let queue = queue();
    let handler = Arc::new(LinkHandler {
        visited: AtomicUsize::new(0),
    });
    let crawler = crawler(queue.clone(), handler.clone(), config(4));
    crawler
        .add_requests(vec![Request::get("https://example.com/root").unwrap()])
        .await
        .unwrap();

    let stats = crawler.run().await.unwrap();
    // root, then two children, then four grandchildren
    assert_eq!(handler.visited.load(Ordering::SeqCst), 7);
    assert_eq!(stats.requests_finished, 7);
    assert_eq!(queue.handled_count().await.unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_is_retried() {
    struct SlowOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for SlowOnce {
        async fn handle_request(&self, _context: &mut CrawlingContext) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(120)).await;
            }
            Ok(())
        }
    }

    let queue = queue();
    let config = CrawlerConfig {
        handle_request_timeout: Duration::from_secs(5),
        ..config(1)
    };
    let crawler = crawler(
        queue.clone(),
        Arc::new(SlowOnce {
            calls: AtomicUsize::new(0),
        }),
        config,
    );
    crawler.add_requests(requests(1)).await.unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.requests_retried, 1);
    assert_eq!(stats.requests_finished, 1);
}

#[tokio::test(start_paused = true)]
async fn test_save_and_load_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let crawler = crawler(queue(), Arc::new(FlakyHandler::new(1)), config(1));
    crawler.add_requests(requests(2)).await.unwrap();
    let stats = crawler.run().await.unwrap();
    crawler.save_state(&path).await.unwrap();

    let restored = self::crawler(queue(), Arc::new(FlakyHandler::new(0)), config(1));
    restored.load_state(&path).await.unwrap();
    assert_eq!(restored.stats().await, stats);
    assert_eq!(restored.error_manager().stats().await.total_errors, 2);
    assert_eq!(
        restored.pool_stats().await.unwrap().tasks_finished,
        crawler.pool_stats().await.unwrap().tasks_finished
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_uses_queue_config() {
    let context = StorageContext::in_memory();
    let opened_config = CrawlerConfig {
        queue: QueueConfig::default().with_head_min_length(2),
        ..config(2)
    };
    let crawler = BasicCrawler::open(
        &context,
        Some("opened"),
        Arc::new(FlakyHandler::new(0)),
        opened_config,
    )
    .await
    .unwrap()
    .with_status_source(Arc::new(ScriptedStatus::idle()));
    assert_eq!(crawler.queue().name(), "opened");
    assert_eq!(crawler.queue().config().head_min_length, 2);

    crawler.add_requests(requests(5)).await.unwrap();
    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.requests_finished, 5);

    let reopened = RequestQueue::open(&context, Some("opened"), QueueConfig::default())
        .await
        .unwrap();
    assert_eq!(reopened.handled_count().await.unwrap(), 5);

    let invalid = CrawlerConfig {
        queue: QueueConfig::default().with_head_min_length(0),
        ..config(2)
    };
    let result = BasicCrawler::open(&context, None, Arc::new(FlakyHandler::new(0)), invalid).await;
    assert!(result.is_err());
}
